//! Replication transport: fan observations out to peer controllers and
//! fold theirs into the local store.
//!
//! One of two mutually exclusive channels is opened at startup: a UDP
//! multicast/broadcast socket (`network.option` 0/1) or a TCP mesh
//! (`network.option` 2). Either way the rest of the daemon only sees the
//! [`Replicator`] handle for sending and the store mutations performed by
//! the inbound processor. Everything is best-effort: a failed send never
//! fails the event that produced it.

pub mod crypto;
pub mod datagram;
pub mod tcp;

use crate::config::Config;
use crate::macfile;
use crate::store::{Origin, Store};
use common::{decode_frame, encode_frame, RemoteMessage};
use crypto::FrameCipher;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind replication socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("invalid replication address: {0}")]
    InvalidAddress(String),
}

/// Drop/error counters, readable from tests and diagnostics.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub crypto_errors: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub oversize_dropped: AtomicU64,
}

/// Handle for publishing observations to the fleet. Cloned into every
/// component that replicates; sending never blocks and never fails the
/// caller.
#[derive(Clone)]
pub struct Replicator {
    tx: Option<mpsc::Sender<String>>,
}

impl Replicator {
    /// Wrap an encoded-frame queue. The transport owns the consuming end;
    /// tests hand in their own channel to capture what would go out.
    pub fn from_sender(tx: mpsc::Sender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A replicator that drops everything. For tests and for running
    /// without peers.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish<T: Serialize>(&self, method: &str, data: &T) {
        let Some(tx) = &self.tx else {
            return;
        };
        match encode_frame(method, data) {
            Ok(frame) => {
                if tx.try_send(frame).is_err() {
                    tracing::warn!("replication queue full, dropping {} frame", method);
                }
            }
            Err(e) => {
                tracing::error!("failed to encode {} frame: {}", method, e);
            }
        }
    }
}

pub struct Transport {
    pub replicator: Replicator,
    pub stats: Arc<TransportStats>,
    pub mesh: Option<tcp::TcpMesh>,
}

/// Open the configured replication channel and start its tasks.
pub async fn start(
    config: Arc<Config>,
    store: Arc<Store>,
    shutdown: &broadcast::Sender<()>,
) -> Result<Transport, TransportError> {
    let cipher = Arc::new(FrameCipher::from_config(
        config.network.use_symm_enc,
        &config.network.shared_key,
    ));
    let stats = Arc::new(TransportStats::default());
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(64);

    let mesh = if config.network.option == 2 {
        let listener = tcp::TcpMesh::bind(config.network.tcp_port)
            .await
            .map_err(TransportError::Bind)?;
        tracing::info!("mesh listening on tcp port {}", config.network.tcp_port);

        let mesh = tcp::TcpMesh::new(config.network.tcp_port);
        mesh.spawn_accept(listener, in_tx.clone(), shutdown);

        let fanout_mesh = mesh.clone();
        let fanout_cipher = cipher.clone();
        let mut fanout_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        fanout_mesh.send_all(&fanout_cipher.seal(&frame));
                    }
                    _ = fanout_shutdown.recv() => break,
                }
            }
        });
        Some(mesh)
    } else {
        let channel = datagram::bind(&config.network)?;
        datagram::spawn(
            channel,
            cipher.clone(),
            out_rx,
            in_tx.clone(),
            stats.clone(),
            shutdown,
        );
        None
    };

    let processor_store = store;
    let processor_config = config;
    let processor_cipher = cipher;
    let processor_stats = stats.clone();
    let mut processor_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                wire = in_rx.recv() => {
                    let Some(wire) = wire else { break };
                    handle_inbound(
                        &processor_store,
                        &processor_config,
                        &processor_cipher,
                        &processor_stats,
                        &wire,
                    );
                }
                _ = processor_shutdown.recv() => break,
            }
        }
    });

    Ok(Transport {
        replicator: Replicator::from_sender(out_tx),
        stats,
        mesh,
    })
}

/// Unseal, decode and apply one inbound frame. Failures only bump a
/// counter; a bad peer cannot disturb local state.
pub fn handle_inbound(
    store: &Store,
    config: &Config,
    cipher: &FrameCipher,
    stats: &TransportStats,
    wire: &[u8],
) {
    let frame = match cipher.open(wire) {
        Ok(frame) => frame,
        Err(e) => {
            match cipher {
                FrameCipher::Plaintext => {
                    stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                }
                FrameCipher::Symmetric(_) => {
                    stats.crypto_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            tracing::debug!("dropping undecodable frame: {}", e);
            return;
        }
    };

    match decode_frame(&frame) {
        Ok(msg) => apply_remote(store, config, msg),
        Err(e) => {
            stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("dropping malformed frame: {}", e);
        }
    }
}

/// Route a decoded peer observation into the store. Nothing in here
/// re-broadcasts: remote observations terminate locally.
pub fn apply_remote(store: &Store, config: &Config, msg: RemoteMessage) {
    match msg {
        RemoteMessage::Probe(probe) => {
            store.probe_insert(&probe, Origin::Remote);
        }
        RemoteMessage::Clients(table) => {
            store.apply_client_table(&table);
        }
        RemoteMessage::Deauth(notify) => {
            store.client_delete(notify.bssid, notify.address);
        }
        RemoteMessage::SetProbe(notify) => {
            store.probe_set_all_counts(notify.address, config.metric.min_probe_count);
        }
        RemoteMessage::AddMac(addmac) => {
            if store.permit_insert(addmac.addr) {
                if let Err(e) = macfile::append(Path::new(&config.maclist_path), addmac.addr) {
                    tracing::error!("failed to append {} to permit list: {}", addmac.addr, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{NotifyMessage, ProbeMessage, METHOD_PROBE, METHOD_SETPROBE};

    fn probe_msg() -> ProbeMessage {
        ProbeMessage {
            bssid: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            address: "cc:00:00:00:00:01".parse().unwrap(),
            target: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            signal: -55,
            freq: 5180,
            ht_support: true,
            vht_support: true,
        }
    }

    #[test]
    fn test_inbound_probe_lands_in_store() {
        let store = Store::new();
        let config = Config::default();
        let cipher = FrameCipher::plaintext();
        let stats = TransportStats::default();

        let wire = encode_frame(METHOD_PROBE, &probe_msg()).unwrap();
        handle_inbound(&store, &config, &cipher, &stats, wire.as_bytes());

        let entry = store
            .probe_get(
                "aa:aa:aa:aa:aa:01".parse().unwrap(),
                "cc:00:00:00:00:01".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(entry.counter, 1);
        assert_eq!(entry.origin, Origin::Remote);
        assert_eq!(stats.malformed_frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_wrong_key_frame_counted_and_ignored() {
        let store = Store::new();
        let config = Config::default();
        let ours = FrameCipher::symmetric("right key");
        let theirs = FrameCipher::symmetric("wrong key");
        let stats = TransportStats::default();

        let wire = theirs.seal(&encode_frame(METHOD_PROBE, &probe_msg()).unwrap());
        handle_inbound(&store, &config, &ours, &stats, &wire);

        assert_eq!(stats.crypto_errors.load(Ordering::Relaxed), 1);
        assert!(store.probe_snapshot().is_empty());
    }

    #[test]
    fn test_malformed_frame_counted() {
        let store = Store::new();
        let config = Config::default();
        let cipher = FrameCipher::plaintext();
        let stats = TransportStats::default();

        handle_inbound(&store, &config, &cipher, &stats, b"{\"nope\":1}");
        assert_eq!(stats.malformed_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_setprobe_raises_counters() {
        let store = Store::new();
        let mut config = Config::default();
        config.metric.min_probe_count = 4;
        let cipher = FrameCipher::plaintext();
        let stats = TransportStats::default();

        store.probe_insert(&probe_msg(), Origin::Local);
        let wire = encode_frame(
            METHOD_SETPROBE,
            &NotifyMessage {
                bssid: "cc:00:00:00:00:01".parse().unwrap(),
                address: "cc:00:00:00:00:01".parse().unwrap(),
            },
        )
        .unwrap();
        handle_inbound(&store, &config, &cipher, &stats, wire.as_bytes());

        let entry = store
            .probe_get(
                "aa:aa:aa:aa:aa:01".parse().unwrap(),
                "cc:00:00:00:00:01".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(entry.counter, 4);
    }
}
