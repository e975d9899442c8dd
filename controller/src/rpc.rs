//! Control surface registered on the management bus as the `dawn` object.
//!
//! Read queries assemble their reply from store snapshots; the only write
//! is the permit-list addition, which also lands in the on-disk list and
//! is replicated to the fleet.

use crate::bus::{RpcRequest, RpcStatus};
use crate::config::Config;
use crate::scoring::score;
use crate::store::Store;
use crate::transport::Replicator;
use common::{AddMacMessage, METHOD_ADDMAC};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Name the control object is registered under.
pub const RPC_OBJECT: &str = "dawn";

pub struct ControlSurface {
    store: Arc<Store>,
    config: Arc<Config>,
    replicator: Replicator,
}

impl ControlSurface {
    pub fn new(store: Arc<Store>, config: Arc<Config>, replicator: Replicator) -> Self {
        Self {
            store,
            config,
            replicator,
        }
    }

    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<RpcRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let result = self.handle(&request.method, request.args);
                    let _ = request.reply.send(result);
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    pub fn handle(&self, method: &str, args: Value) -> Result<Value, RpcStatus> {
        match method {
            "add_mac" => self.add_mac(args),
            "get_hearing_map" => Ok(self.hearing_map()),
            "get_network" => Ok(self.network_overview()),
            _ => Err(RpcStatus::MethodNotFound),
        }
    }

    fn add_mac(&self, args: Value) -> Result<Value, RpcStatus> {
        let msg: AddMacMessage =
            serde_json::from_value(args).map_err(|_| RpcStatus::InvalidArgument)?;

        if self.store.permit_insert(msg.addr) {
            if let Err(e) = crate::macfile::append(Path::new(&self.config.maclist_path), msg.addr) {
                tracing::error!("failed to append {} to permit list file: {}", msg.addr, e);
            }
        }
        self.replicator.publish(METHOD_ADDMAC, &msg);
        Ok(json!({}))
    }

    /// `{ ssid -> { client -> { bssid -> observation } } }` over every
    /// probe whose AP is currently known.
    pub fn hearing_map(&self) -> Value {
        let mut map: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>> = BTreeMap::new();

        for probe in self.store.probe_snapshot() {
            let Some(ap) = self.store.ap_get(probe.bssid) else {
                continue;
            };
            let entry = json!({
                "signal": probe.signal_dbm,
                "freq": probe.freq_mhz,
                "ht_support": probe.ht_capable,
                "vht_support": probe.vht_capable,
                "score": score(&self.config.metric, &ap, &probe),
            });
            map.entry(ap.ssid)
                .or_default()
                .entry(probe.client.to_string())
                .or_default()
                .insert(probe.bssid.to_string(), entry);
        }

        serde_json::to_value(map).unwrap_or_default()
    }

    /// `{ ssid -> { bssid -> ap fields + clients } }`.
    pub fn network_overview(&self) -> Value {
        let mut map: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();

        for ap in self.store.ap_snapshot() {
            let mut clients = BTreeMap::new();
            for client in self.store.clients_for_ap(ap.bssid) {
                clients.insert(
                    client.client.to_string(),
                    serde_json::to_value(&client.flags).unwrap_or_default(),
                );
            }
            let entry = json!({
                "freq": ap.freq_mhz,
                "ht_supported": ap.ht,
                "vht_supported": ap.vht,
                "channel_utilization": ap.channel_utilization,
                "num_sta": ap.station_count,
                "collision_domain": ap.collision_domain,
                "bandwidth": ap.bandwidth_mhz,
                "clients": clients,
            });
            map.entry(ap.ssid).or_default().insert(ap.bssid.to_string(), entry);
        }

        serde_json::to_value(map).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Ap, Origin};
    use common::{MacAddr, ProbeMessage};
    use std::time::Instant;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn surface_with_tempfile() -> (ControlSurface, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new());
        let mut config = Config::default();
        config.maclist_path = dir
            .path()
            .join("mac_list")
            .to_string_lossy()
            .into_owned();
        (
            ControlSurface::new(store.clone(), Arc::new(config), Replicator::disabled()),
            store,
            dir,
        )
    }

    fn seed_ap(store: &Store, bssid: &str, ssid: &str, freq: u32) {
        store.ap_insert(Ap {
            bssid: mac(bssid),
            ssid: ssid.to_string(),
            freq_mhz: freq,
            ht: true,
            vht: true,
            channel_utilization: 0,
            station_count: 0,
            collision_domain: -1,
            bandwidth_mhz: -1,
            last_seen: Instant::now(),
        });
    }

    #[test]
    fn test_add_mac_permits_and_appends() {
        let (surface, store, dir) = surface_with_tempfile();

        let reply = surface
            .handle("add_mac", json!({"addr": "cc:00:00:00:00:09"}))
            .unwrap();
        assert_eq!(reply, json!({}));
        assert!(store.permit_contains(mac("cc:00:00:00:00:09")));

        let file = std::fs::read_to_string(dir.path().join("mac_list")).unwrap();
        assert!(file.ends_with("CC:00:00:00:00:09\n"));

        // Re-adding is idempotent on the file.
        surface
            .handle("add_mac", json!({"addr": "cc:00:00:00:00:09"}))
            .unwrap();
        let file = std::fs::read_to_string(dir.path().join("mac_list")).unwrap();
        assert_eq!(file.matches("CC:00:00:00:00:09").count(), 1);
    }

    #[test]
    fn test_add_mac_rejects_garbage() {
        let (surface, _store, _dir) = surface_with_tempfile();
        assert_eq!(
            surface.handle("add_mac", json!({"addr": "zz"})),
            Err(RpcStatus::InvalidArgument)
        );
        assert_eq!(
            surface.handle("no_such_method", json!({})),
            Err(RpcStatus::MethodNotFound)
        );
    }

    #[test]
    fn test_hearing_map_shape() {
        let (surface, store, _dir) = surface_with_tempfile();
        seed_ap(&store, "aa:aa:aa:aa:aa:01", "w", 5180);
        seed_ap(&store, "aa:aa:aa:aa:aa:02", "w", 2412);
        for bssid in ["aa:aa:aa:aa:aa:01", "aa:aa:aa:aa:aa:02"] {
            store.probe_insert(
                &ProbeMessage {
                    bssid: mac(bssid),
                    address: mac("cc:00:00:00:00:01"),
                    target: mac(bssid),
                    signal: -55,
                    freq: 5180,
                    ht_support: true,
                    vht_support: true,
                },
                Origin::Local,
            );
        }

        let map = surface.hearing_map();
        let client = &map["w"]["CC:00:00:00:00:01"];
        assert!(client["AA:AA:AA:AA:AA:01"]["score"].is_i64());
        assert_eq!(client["AA:AA:AA:AA:AA:02"]["signal"], json!(-55));
        assert_eq!(client["AA:AA:AA:AA:AA:01"]["ht_support"], json!(true));
    }

    #[test]
    fn test_network_overview_shape() {
        let (surface, store, _dir) = surface_with_tempfile();
        store.apply_client_table(
            &serde_json::from_value(json!({
                "bssid": "aa:aa:aa:aa:aa:01",
                "ssid": "w",
                "freq": 5180,
                "ht_supported": true,
                "clients": {
                    "cc:00:00:00:00:01": {"auth": true, "assoc": true, "aid": 3}
                }
            }))
            .unwrap(),
        );

        let map = surface.network_overview();
        let ap = &map["w"]["AA:AA:AA:AA:AA:01"];
        assert_eq!(ap["num_sta"], json!(1));
        assert_eq!(ap["clients"]["CC:00:00:00:00:01"]["aid"], json!(3));
    }
}
