//! Periodic control loops: client-table polling, channel-utilization
//! sampling, AP discovery, peer discovery and store ageing.
//!
//! Each loop is an interval task on the single-threaded scheduler. The
//! work of one tick is factored into a `*_once` method so tests can drive
//! a tick directly without waiting on timers.

use crate::bus::{BusHandle, SubscriptionId, MDNS_SERVICE};
use crate::config::Config;
use crate::hostapd::{ApBinding, Bindings};
use crate::scoring::better_ap_available;
use crate::store::{Store, Ttls};
use crate::transport::tcp::TcpMesh;
use crate::transport::Replicator;
use common::{ClientTableMessage, MacAddr, NotifyMessage, METHOD_CLIENTS, METHOD_SETPROBE};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Rate limiter for kicks: one kick per (bssid, client) per spacing window.
struct Kicker {
    last: Mutex<HashMap<(MacAddr, MacAddr), Instant>>,
}

impl Kicker {
    fn new() -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
        }
    }

    fn try_begin(&self, bssid: MacAddr, client: MacAddr, spacing: Duration) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match last.get(&(bssid, client)) {
            Some(previous) if now.duration_since(*previous) < spacing => false,
            _ => {
                last.insert((bssid, client), now);
                true
            }
        }
    }

    fn prune(&self, horizon: Duration) {
        let now = Instant::now();
        self.last
            .lock()
            .retain(|_, at| now.duration_since(*at) <= horizon);
    }
}

pub struct ControlLoops {
    config: Arc<Config>,
    store: Arc<Store>,
    bindings: Arc<Bindings>,
    bus: BusHandle,
    replicator: Replicator,
    mesh: Option<TcpMesh>,
    kicks: Kicker,
}

impl ControlLoops {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        bindings: Arc<Bindings>,
        bus: BusHandle,
        replicator: Replicator,
        mesh: Option<TcpMesh>,
    ) -> Self {
        Self {
            config,
            store,
            bindings,
            bus,
            replicator,
            mesh,
            kicks: Kicker::new(),
        }
    }

    /// Start every recurring job. Peer discovery only runs in mesh mode.
    pub fn spawn_all(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let loops = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let period = Duration::from_secs(loops.config.times.update_hostapd.max(1));
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => loops.discover_aps_once().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        {
            let loops = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let period = Duration::from_secs(loops.config.times.update_client.max(1));
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => loops.poll_clients_once().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        {
            let loops = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let period = Duration::from_secs(loops.config.times.update_chan_util.max(1));
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => loops.sample_channel_utilization_once().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        if self.mesh.is_some() {
            let loops = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let period = Duration::from_secs(loops.config.times.update_tcp_con.max(1));
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => loops.discover_peers_once().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        {
            let loops = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let period = Duration::from_secs(loops.config.metric.ageing_time.max(1));
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => loops.age_once(),
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        handles
    }

    /// Re-scan the hostapd socket directory and subscribe to anything new.
    pub async fn discover_aps_once(&self) {
        let dir = self.config.hostapd.socket_dir.clone();
        let sockets = match scan_socket_dir(Path::new(&dir)).await {
            Ok(sockets) => sockets,
            Err(e) => {
                tracing::debug!("no hostapd sockets under {}: {}", dir, e);
                return;
            }
        };

        for iface in sockets {
            if self.bindings.iface_bound(&iface) {
                continue;
            }
            match self.bus.subscribe(&iface).await {
                Ok((id, desc)) => {
                    tracing::info!("watching ap {} ({}, ssid {:?})", desc.iface, desc.bssid, desc.ssid);
                    self.bindings.insert(ApBinding::new(id, desc));
                    if let Err(e) = self.bus.notify_response(id).await {
                        tracing::debug!("notify_response for {} failed: {}", iface, e);
                    }
                }
                Err(e) => {
                    tracing::debug!("failed to subscribe to {}: {}", iface, e);
                }
            }
        }
    }

    /// Fetch every binding's client table, publish it fleet-wide and apply
    /// it locally, kicking if configured.
    pub async fn poll_clients_once(&self) {
        for binding in self.bindings.snapshot() {
            match self.bus.get_clients(binding.id).await {
                Ok(raw) => self.ingest_client_table(&binding, raw).await,
                Err(e) => {
                    tracing::debug!("get_clients for {} failed: {}", binding.iface, e);
                }
            }
        }
    }

    pub async fn ingest_client_table(&self, binding: &ApBinding, raw: Value) {
        let Some(msg) = self.enrich_client_table(binding, raw) else {
            return;
        };
        self.replicator.publish(METHOD_CLIENTS, &msg);
        self.store.apply_client_table(&msg);
        if self.config.metric.kicking {
            self.kick_clients(binding.bssid, binding.id).await;
        }
    }

    /// Stamp the AP identity, its averaged channel utilization and the
    /// configured collision domain / bandwidth onto a raw client table.
    fn enrich_client_table(&self, binding: &ApBinding, mut raw: Value) -> Option<ClientTableMessage> {
        let Some(obj) = raw.as_object_mut() else {
            tracing::warn!("client table from {} is not an object", binding.iface);
            return None;
        };
        obj.insert("bssid".to_string(), json!(binding.bssid.to_string()));
        obj.insert("ssid".to_string(), json!(binding.ssid));
        obj.insert("ht_supported".to_string(), json!(binding.ht));
        obj.insert("vht_supported".to_string(), json!(binding.vht));
        obj.insert(
            "channel_utilization".to_string(),
            json!(binding.chan_util_average()),
        );
        obj.insert(
            "collision_domain".to_string(),
            json!(self.config.network.collision_domain),
        );
        obj.insert("bandwidth".to_string(), json!(self.config.network.bandwidth));

        match serde_json::from_value(raw) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::warn!("discarding client table from {}: {}", binding.iface, e);
                None
            }
        }
    }

    /// Evict every client of `bssid` that a strictly better AP has heard.
    /// Before the kick, the client's probe counters are raised to the
    /// acceptance threshold fleet-wide so the next AP lets it in.
    pub async fn kick_clients(&self, bssid: MacAddr, ap_id: SubscriptionId) -> usize {
        let metric = &self.config.metric;
        let spacing = Duration::from_secs(metric.min_kick_count);
        let mut kicked = 0;

        for client in self.store.clients_for_ap(bssid) {
            let addr = client.client;
            if self.store.permit_contains(addr) {
                continue;
            }
            let Some(probe) = self.store.probe_get(bssid, addr) else {
                continue;
            };
            if probe.counter < metric.min_probe_count {
                continue;
            }
            if !better_ap_available(&self.store, metric, bssid, addr, true) {
                continue;
            }
            if !self.kicks.try_begin(bssid, addr, spacing) {
                continue;
            }

            self.store.probe_set_all_counts(addr, metric.min_probe_count);
            self.replicator.publish(
                METHOD_SETPROBE,
                &NotifyMessage {
                    bssid: addr,
                    address: addr,
                },
            );

            match self
                .bus
                .del_client(
                    ap_id,
                    addr,
                    metric.deny_assoc_reason,
                    true,
                    self.config.hostapd.ban_time,
                )
                .await
            {
                Ok(()) => {
                    tracing::info!("kicked {} from {}", addr, bssid);
                    kicked += 1;
                }
                Err(e) => {
                    tracing::warn!("del_client for {} at {} failed: {}", addr, bssid, e);
                }
            }
        }
        kicked
    }

    pub async fn sample_channel_utilization_once(&self) {
        for binding in self.bindings.snapshot() {
            match self.bus.survey_sample(&binding.iface).await {
                Ok(sample) => {
                    self.bindings
                        .note_survey(binding.id, sample, self.config.metric.chan_util_avg_period);
                }
                Err(e) => {
                    tracing::debug!("survey for {} failed: {}", binding.iface, e);
                }
            }
        }
    }

    /// Ask the mDNS layer for peer controllers and keep the mesh dialed.
    pub async fn discover_peers_once(&self) {
        let Some(mesh) = &self.mesh else {
            return;
        };
        match self.bus.mdns_browse(MDNS_SERVICE).await {
            Ok(peers) => {
                for (ip, port) in peers {
                    mesh.add_peer(SocketAddr::from((ip, port)));
                }
            }
            Err(e) => {
                tracing::debug!("mdns browse failed: {}", e);
            }
        }
    }

    pub fn age_once(&self) {
        let ttls = Ttls::from_ageing(self.config.metric.ageing_time);
        self.store.sweep(Instant::now(), &ttls);
        // Forgotten observations mean forgotten kicks too.
        self.kicks.prune(Duration::from_secs(2 * self.config.metric.ageing_time));
    }
}

async fn scan_socket_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        #[cfg(unix)]
        let is_socket = std::os::unix::fs::FileTypeExt::is_socket(&file_type);
        #[cfg(not(unix))]
        let is_socket = false;
        if is_socket {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_kicker_spacing() {
        let kicker = Kicker::new();
        let bssid = mac("aa:aa:aa:aa:aa:01");
        let client = mac("cc:00:00:00:00:01");

        assert!(kicker.try_begin(bssid, client, Duration::from_secs(60)));
        assert!(!kicker.try_begin(bssid, client, Duration::from_secs(60)));
        // Zero spacing means no limit.
        assert!(kicker.try_begin(bssid, client, Duration::from_secs(0)));
        // Other pairs are unaffected.
        assert!(kicker.try_begin(bssid, mac("cc:00:00:00:00:02"), Duration::from_secs(60)));
    }

    #[test]
    fn test_kicker_prune() {
        let kicker = Kicker::new();
        let bssid = mac("aa:aa:aa:aa:aa:01");
        let client = mac("cc:00:00:00:00:01");
        assert!(kicker.try_begin(bssid, client, Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        kicker.prune(Duration::from_millis(1));
        assert!(kicker.try_begin(bssid, client, Duration::from_secs(60)));
    }
}
