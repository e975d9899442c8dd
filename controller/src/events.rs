//! Local event bus: notifications from the subscribed APs.
//!
//! Every payload is enriched with the originating AP's BSSID and SSID
//! before dispatch, so the store and the decision engine never have to map
//! a subscription back to an AP. Dispatch is by full method name. Probe
//! observations are replicated before the decision is computed; the
//! decision itself only ever travels back to the asking AP.

use crate::bus::ApEvent;
use crate::config::Config;
use crate::hostapd::{ApBinding, Bindings};
use crate::scoring::{decide, Decision, RequestKind, WLAN_STATUS_SUCCESS};
use crate::store::{Origin, Store};
use crate::transport::Replicator;
use common::{AuthMessage, NotifyMessage, ProbeMessage, METHOD_DEAUTH, METHOD_PROBE};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

pub struct EventBus {
    store: Arc<Store>,
    config: Arc<Config>,
    bindings: Arc<Bindings>,
    replicator: Replicator,
    malformed_events: AtomicU64,
}

impl EventBus {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        bindings: Arc<Bindings>,
        replicator: Replicator,
    ) -> Self {
        Self {
            store,
            config,
            bindings,
            replicator,
            malformed_events: AtomicU64::new(0),
        }
    }

    pub fn malformed_events(&self) -> u64 {
        self.malformed_events.load(Ordering::Relaxed)
    }

    pub async fn run(
        &self,
        mut events: mpsc::Receiver<ApEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    pub fn handle_event(&self, event: ApEvent) {
        if event.method == "remove" {
            if let Some(binding) = self.bindings.remove(event.id) {
                tracing::info!("ap {} ({}) went away", binding.iface, binding.bssid);
            }
            return;
        }

        let Some(binding) = self.bindings.get(event.id) else {
            tracing::debug!("event from unknown subscription {}", event.id);
            return;
        };

        let Some(payload) = enrich(event.payload, &binding) else {
            self.note_malformed("event payload is not an object");
            reply_status(event.reply, WLAN_STATUS_SUCCESS);
            return;
        };

        match event.method.as_str() {
            "probe" => self.handle_probe(payload, event.reply),
            "auth" => self.handle_auth_assoc(RequestKind::Auth, payload, event.reply),
            "assoc" => self.handle_auth_assoc(RequestKind::Assoc, payload, event.reply),
            "deauth" => self.handle_deauth(payload),
            other => tracing::debug!("ignoring event method {:?}", other),
        }
    }

    fn handle_probe(&self, payload: Value, reply: Option<oneshot::Sender<u16>>) {
        let msg: ProbeMessage = match serde_json::from_value(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.note_malformed(&e.to_string());
                reply_status(reply, WLAN_STATUS_SUCCESS);
                return;
            }
        };

        self.store.probe_insert(&msg, Origin::Local);
        self.replicator.publish(METHOD_PROBE, &msg);

        let decision = decide(
            &self.store,
            &self.config.metric,
            RequestKind::Probe,
            msg.bssid,
            msg.address,
        );
        if let Decision::Deny(reason) = decision {
            tracing::debug!("denying probe from {} at {}: {}", msg.address, msg.bssid, reason);
        }
        reply_status(reply, decision.status_code());
    }

    fn handle_auth_assoc(
        &self,
        kind: RequestKind,
        payload: Value,
        reply: Option<oneshot::Sender<u16>>,
    ) {
        let msg: AuthMessage = match serde_json::from_value(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.note_malformed(&e.to_string());
                reply_status(reply, WLAN_STATUS_SUCCESS);
                return;
            }
        };

        let decision = decide(
            &self.store,
            &self.config.metric,
            kind,
            msg.bssid,
            msg.address,
        );
        match decision {
            Decision::Accept => {
                tracing::debug!("allowing {:?} from {} at {}", kind, msg.address, msg.bssid)
            }
            Decision::Deny(reason) => {
                tracing::info!(
                    "denying {:?} from {} at {} with status {}",
                    kind,
                    msg.address,
                    msg.bssid,
                    reason
                )
            }
        }
        reply_status(reply, decision.status_code());
    }

    fn handle_deauth(&self, payload: Value) {
        let msg: NotifyMessage = match serde_json::from_value(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.note_malformed(&e.to_string());
                return;
            }
        };

        self.store.client_delete(msg.bssid, msg.address);
        self.replicator.publish(METHOD_DEAUTH, &msg);
        tracing::debug!("client {} deauthed at {}", msg.address, msg.bssid);
    }

    fn note_malformed(&self, detail: &str) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("dropping malformed ap event: {}", detail);
    }
}

/// Stamp the binding's AP identity onto the raw payload.
fn enrich(mut payload: Value, binding: &ApBinding) -> Option<Value> {
    let obj = payload.as_object_mut()?;
    obj.insert("bssid".to_string(), Value::String(binding.bssid.to_string()));
    obj.insert("ssid".to_string(), Value::String(binding.ssid.clone()));
    Some(payload)
}

fn reply_status(reply: Option<oneshot::Sender<u16>>, status: u16) {
    if let Some(tx) = reply {
        let _ = tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ApDescription;
    use common::MacAddr;
    use serde_json::json;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn test_bus() -> (EventBus, Arc<Store>, mpsc::Receiver<String>) {
        let store = Arc::new(Store::new());
        let mut config = Config::default();
        config.metric.eval_auth_req = true;
        config.metric.min_probe_count = 1;
        let bindings = Arc::new(Bindings::new());
        bindings.insert(ApBinding::new(
            1,
            ApDescription {
                iface: "wlan0".to_string(),
                bssid: mac("aa:aa:aa:aa:aa:01"),
                ssid: "w".to_string(),
                ht: true,
                vht: true,
            },
        ));
        let (tx, rx) = mpsc::channel(16);
        let bus = EventBus::new(
            store.clone(),
            Arc::new(config),
            bindings,
            Replicator::from_sender(tx),
        );
        (bus, store, rx)
    }

    fn probe_event(reply: Option<oneshot::Sender<u16>>) -> ApEvent {
        ApEvent {
            id: 1,
            method: "probe".to_string(),
            payload: json!({
                "address": "cc:00:00:00:00:01",
                "target": "aa:aa:aa:aa:aa:01",
                "signal": -55,
                "freq": 5180,
                "ht_support": true,
                "vht_support": true,
            }),
            reply,
        }
    }

    #[test]
    fn test_probe_event_inserted_enriched_and_replicated() {
        let (bus, store, mut replicated) = test_bus();
        let (tx, mut rx) = oneshot::channel();

        bus.handle_event(probe_event(Some(tx)));

        // The binding's bssid was stamped on before insertion.
        let entry = store
            .probe_get(mac("aa:aa:aa:aa:aa:01"), mac("cc:00:00:00:00:01"))
            .unwrap();
        assert_eq!(entry.counter, 1);
        assert_eq!(entry.origin, Origin::Local);
        assert_eq!(rx.try_recv().unwrap(), WLAN_STATUS_SUCCESS);

        let frame = replicated.try_recv().unwrap();
        match common::decode_frame(&frame).unwrap() {
            common::RemoteMessage::Probe(p) => {
                assert_eq!(p.bssid, mac("aa:aa:aa:aa:aa:01"));
                assert_eq!(p.signal, -55);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_auth_without_probe_denied() {
        let (bus, store, _replicated) = test_bus();
        let (tx, mut rx) = oneshot::channel();

        bus.handle_event(ApEvent {
            id: 1,
            method: "auth".to_string(),
            payload: json!({
                "address": "cc:00:00:00:00:02",
                "target": "aa:aa:aa:aa:aa:01",
            }),
            reply: Some(tx),
        });

        assert_eq!(rx.try_recv().unwrap(), 17);
        assert!(store
            .denied_lookup(mac("aa:aa:aa:aa:aa:01"), mac("cc:00:00:00:00:02"))
            .is_some());
    }

    #[test]
    fn test_deauth_drops_client_and_replicates() {
        let (bus, store, mut replicated) = test_bus();
        store.apply_client_table(
            &serde_json::from_value(json!({
                "bssid": "aa:aa:aa:aa:aa:01",
                "ssid": "w",
                "clients": {"cc:00:00:00:00:01": {"auth": true, "assoc": true}},
            }))
            .unwrap(),
        );
        assert_eq!(store.clients_for_ap(mac("aa:aa:aa:aa:aa:01")).len(), 1);

        bus.handle_event(ApEvent {
            id: 1,
            method: "deauth".to_string(),
            payload: json!({"address": "cc:00:00:00:00:01"}),
            reply: None,
        });

        assert!(store.clients_for_ap(mac("aa:aa:aa:aa:aa:01")).is_empty());
        let frame = replicated.try_recv().unwrap();
        assert!(matches!(
            common::decode_frame(&frame).unwrap(),
            common::RemoteMessage::Deauth(_)
        ));
    }

    #[test]
    fn test_unknown_subscription_ignored() {
        let (bus, store, _replicated) = test_bus();
        bus.handle_event(ApEvent {
            id: 99,
            method: "probe".to_string(),
            payload: json!({"address": "cc:00:00:00:00:01"}),
            reply: None,
        });
        assert!(store.probe_snapshot().is_empty());
    }

    #[test]
    fn test_malformed_event_counted_and_accepted() {
        let (bus, store, _replicated) = test_bus();
        let (tx, mut rx) = oneshot::channel();

        bus.handle_event(ApEvent {
            id: 1,
            method: "probe".to_string(),
            payload: json!({"signal": -40}), // no client address
            reply: Some(tx),
        });

        assert_eq!(bus.malformed_events(), 1);
        assert!(store.probe_snapshot().is_empty());
        // Without data there is nothing to steer on; the AP proceeds.
        assert_eq!(rx.try_recv().unwrap(), WLAN_STATUS_SUCCESS);
    }

    #[test]
    fn test_remove_event_evicts_binding() {
        let (bus, _store, _replicated) = test_bus();
        bus.handle_event(ApEvent {
            id: 1,
            method: "remove".to_string(),
            payload: Value::Null,
            reply: None,
        });
        bus.handle_event(probe_event(None));
        // Binding gone: the probe was dropped.
        assert!(_store.probe_snapshot().is_empty());
    }
}
