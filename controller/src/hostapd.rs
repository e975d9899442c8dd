//! Registry of the locally managed AP interfaces.
//!
//! One [`ApBinding`] per subscribed management socket, keyed by the
//! subscription id the backend handed out. Ids grow monotonically so the
//! map iterates in subscription order. The binding also carries the
//! running channel-utilization average that gets stamped onto outgoing
//! client-table reports.

use crate::bus::{ApDescription, SubscriptionId, SurveySample};
use common::MacAddr;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct ApBinding {
    pub id: SubscriptionId,
    pub iface: String,
    pub bssid: MacAddr,
    pub ssid: String,
    pub ht: bool,
    pub vht: bool,
    last_channel_time: u64,
    last_channel_time_busy: u64,
    chan_util_samples_sum: u64,
    chan_util_num_samples: u32,
    chan_util_average: u32,
}

impl ApBinding {
    pub fn new(id: SubscriptionId, desc: ApDescription) -> Self {
        Self {
            id,
            iface: desc.iface,
            bssid: desc.bssid,
            ssid: desc.ssid,
            ht: desc.ht,
            vht: desc.vht,
            last_channel_time: 0,
            last_channel_time_busy: 0,
            chan_util_samples_sum: 0,
            chan_util_num_samples: 0,
            chan_util_average: 0,
        }
    }

    pub fn chan_util_average(&self) -> u32 {
        self.chan_util_average
    }
}

#[derive(Default)]
pub struct Bindings {
    inner: Mutex<BTreeMap<SubscriptionId, ApBinding>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, binding: ApBinding) {
        self.inner.lock().insert(binding.id, binding);
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<ApBinding> {
        self.inner.lock().remove(&id)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<ApBinding> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ApBinding> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn iface_bound(&self, iface: &str) -> bool {
        self.inner.lock().values().any(|b| b.iface == iface)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Fold one raw survey sample into the binding's accumulator. The
    /// utilization of the sampled window is the busy-time share scaled to
    /// 0..=255; once more than `avg_period` windows are collected the
    /// average is published and the accumulator restarts.
    pub fn note_survey(&self, id: SubscriptionId, sample: SurveySample, avg_period: u32) {
        let mut inner = self.inner.lock();
        let Some(binding) = inner.get_mut(&id) else {
            return;
        };

        let first = binding.last_channel_time == 0 && binding.last_channel_time_busy == 0;
        let time_delta = sample.channel_time.saturating_sub(binding.last_channel_time);
        let busy_delta = sample
            .channel_time_busy
            .saturating_sub(binding.last_channel_time_busy);
        binding.last_channel_time = sample.channel_time;
        binding.last_channel_time_busy = sample.channel_time_busy;

        if first || time_delta == 0 {
            return;
        }

        let utilization = (busy_delta * 255 / time_delta).min(255);
        binding.chan_util_samples_sum += utilization;
        binding.chan_util_num_samples += 1;

        if binding.chan_util_num_samples > avg_period {
            binding.chan_util_average =
                (binding.chan_util_samples_sum / u64::from(binding.chan_util_num_samples)) as u32;
            binding.chan_util_samples_sum = 0;
            binding.chan_util_num_samples = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(iface: &str, bssid: &str) -> ApDescription {
        ApDescription {
            iface: iface.to_string(),
            bssid: bssid.parse().unwrap(),
            ssid: "w".to_string(),
            ht: true,
            vht: false,
        }
    }

    #[test]
    fn test_insert_order_by_id() {
        let bindings = Bindings::new();
        bindings.insert(ApBinding::new(2, desc("wlan1", "aa:aa:aa:aa:aa:02")));
        bindings.insert(ApBinding::new(1, desc("wlan0", "aa:aa:aa:aa:aa:01")));

        let snapshot = bindings.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, 1);
        assert!(bindings.iface_bound("wlan0"));
        assert!(!bindings.iface_bound("wlan9"));

        bindings.remove(1);
        assert!(!bindings.iface_bound("wlan0"));
    }

    #[test]
    fn test_survey_averaging() {
        let bindings = Bindings::new();
        bindings.insert(ApBinding::new(1, desc("wlan0", "aa:aa:aa:aa:aa:01")));

        // First sample only seeds the counters.
        bindings.note_survey(
            1,
            SurveySample {
                channel_time: 1000,
                channel_time_busy: 100,
            },
            2,
        );
        assert_eq!(bindings.get(1).unwrap().chan_util_average(), 0);

        // Three windows at 50% busy (delta 1000 time / 500 busy each):
        // utilization 127 per window, published after avg_period=2 exceeded.
        for i in 1..=3u64 {
            bindings.note_survey(
                1,
                SurveySample {
                    channel_time: 1000 + i * 1000,
                    channel_time_busy: 100 + i * 500,
                },
                2,
            );
        }
        assert_eq!(bindings.get(1).unwrap().chan_util_average(), 127);
    }
}
