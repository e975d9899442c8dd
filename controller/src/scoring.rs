//! AP scoring and the accept/deny decision for incoming requests.
//!
//! Everything here is a function over the store and the configured metric;
//! no state of its own. The same predicate backs the inbound request path
//! and the periodic kick evaluation, which differ only in strictness.

use crate::config::MetricConfig;
use crate::store::{Ap, ProbeEntry, Store};
use common::MacAddr;

pub const WLAN_STATUS_SUCCESS: u16 = 0;
pub const WLAN_STATUS_AP_UNABLE_TO_HANDLE_NEW_STA: u16 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Probe,
    Auth,
    Assoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Deny(u16),
}

impl Decision {
    pub fn status_code(&self) -> u16 {
        match self {
            Decision::Accept => WLAN_STATUS_SUCCESS,
            Decision::Deny(reason) => *reason,
        }
    }
}

/// Score one `(client, AP)` pairing, higher is better. Each term either
/// contributes its configured weight or nothing, so the result does not
/// depend on evaluation order.
pub fn score(metric: &MetricConfig, ap: &Ap, probe: &ProbeEntry) -> i32 {
    let mut total = 0;
    if probe.ht_capable && ap.ht {
        total += metric.ht_support;
    }
    if probe.vht_capable && ap.vht {
        total += metric.vht_support;
    }
    if !ap.ht {
        total += metric.no_ht_support;
    }
    if !ap.vht {
        total += metric.no_vht_support;
    }
    if probe.signal_dbm >= metric.rssi_threshold_high {
        total += metric.rssi;
    }
    if probe.signal_dbm <= metric.rssi_threshold_low {
        total += metric.low_rssi;
    }
    if ap.freq_mhz >= 5000 {
        total += metric.freq;
    }
    if i32::from(ap.channel_utilization) <= metric.chan_util_low {
        total += metric.chan_util;
    }
    if i32::from(ap.channel_utilization) >= metric.chan_util_high {
        total += metric.max_chan_util;
    }
    total
}

/// Is there an AP in the same steering domain that scores better for this
/// client than `current_bssid`?
///
/// Strict mode requires a strictly higher score (used when kicking an
/// associated client). Non-strict mode also accepts an equal score when the
/// candidate's BSSID orders lower, so two equally-placed controllers agree
/// on which AP wins the tie.
pub fn better_ap_available(
    store: &Store,
    metric: &MetricConfig,
    current_bssid: MacAddr,
    client: MacAddr,
    strict: bool,
) -> bool {
    let probes = store.probes_for_client(client);
    let Some(current_probe) = probes.iter().find(|p| p.bssid == current_bssid) else {
        // This AP has never heard the client; anyone who has is better.
        return true;
    };

    let Some(current_ap) = store.ap_get(current_bssid) else {
        // No AP record for the current AP: any known AP that heard the
        // client wins.
        return probes
            .iter()
            .any(|p| p.bssid != current_bssid && store.ap_get(p.bssid).is_some());
    };

    let current_score = score(metric, &current_ap, current_probe);

    for probe in probes.iter().filter(|p| p.bssid != current_bssid) {
        let Some(ap) = store.ap_get(probe.bssid) else {
            continue;
        };
        if ap.ssid != current_ap.ssid {
            continue;
        }
        let candidate = score(metric, &ap, probe);
        if candidate > current_score {
            return true;
        }
        if !strict && candidate == current_score && ap.bssid < current_bssid {
            return true;
        }
    }
    false
}

/// Decide whether the AP should accept this request.
pub fn decide(
    store: &Store,
    metric: &MetricConfig,
    kind: RequestKind,
    bssid: MacAddr,
    client: MacAddr,
) -> Decision {
    if store.permit_contains(client) {
        return Decision::Accept;
    }

    // Driver-assisted recognition: a client re-appearing at an AP that
    // denied it inside the deny window gets the same answer again.
    if metric.use_driver_recog {
        if let Some(denied) = store.denied_lookup(bssid, client) {
            return Decision::Deny(denied.reason);
        }
    }

    let reason = match kind {
        RequestKind::Probe => WLAN_STATUS_AP_UNABLE_TO_HANDLE_NEW_STA,
        RequestKind::Auth => metric.deny_auth_reason,
        RequestKind::Assoc => metric.deny_assoc_reason,
    };

    // No probe record at this AP means we have no data to steer with, and
    // a request without a preceding probe is itself suspect.
    let Some(probe) = store.probe_get(bssid, client) else {
        return deny(store, metric, kind, bssid, client, reason);
    };

    if probe.counter < metric.min_probe_count {
        return Decision::Accept;
    }

    let evaluate = match kind {
        RequestKind::Probe => metric.eval_probe_req,
        RequestKind::Auth => metric.eval_auth_req,
        RequestKind::Assoc => metric.eval_assoc_req,
    };
    if !evaluate {
        return Decision::Accept;
    }

    if better_ap_available(store, metric, bssid, client, false) {
        return deny(store, metric, kind, bssid, client, reason);
    }

    Decision::Accept
}

fn deny(
    store: &Store,
    metric: &MetricConfig,
    kind: RequestKind,
    bssid: MacAddr,
    client: MacAddr,
    reason: u16,
) -> Decision {
    if metric.use_driver_recog && matches!(kind, RequestKind::Auth | RequestKind::Assoc) {
        store.denied_insert(bssid, client, reason);
    }
    Decision::Deny(reason)
}
