//! UDP replication channel: one socket, multicast or broadcast.
//!
//! The socket is set up with `socket2` so the multicast join and the
//! broadcast flag can be applied before it is handed to tokio. One reader
//! task pulls datagrams off the wire and hands them to the inbound queue;
//! one sender task drains the outbound queue. Frames are delimited by the
//! packet boundary, so anything larger than [`MAX_DATAGRAM_LEN`] after
//! sealing is dropped with an error.

use super::crypto::FrameCipher;
use super::{TransportError, TransportStats};
use crate::config::NetworkConfig;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

/// Upper bound on a replication datagram, in bytes.
pub const MAX_DATAGRAM_LEN: usize = 500;

pub struct DatagramChannel {
    pub socket: Arc<UdpSocket>,
    pub dest: SocketAddr,
}

/// Bind the replication socket according to `network.option`:
/// 0 joins `network.ip` as a multicast group, 1 enables broadcast.
pub fn bind(network: &NetworkConfig) -> Result<DatagramChannel, TransportError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let group: Ipv4Addr = network
        .ip
        .parse()
        .map_err(|_| TransportError::InvalidAddress(network.ip.clone()))?;

    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(TransportError::Bind)?;
    socket.set_reuse_address(true).map_err(TransportError::Bind)?;
    socket.set_nonblocking(true).map_err(TransportError::Bind)?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, network.port));
    socket.bind(&bind_addr.into()).map_err(TransportError::Bind)?;

    if network.option == 0 {
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(TransportError::Bind)?;
        // Our own frames must not come back at us.
        socket
            .set_multicast_loop_v4(false)
            .map_err(TransportError::Bind)?;
    } else {
        socket.set_broadcast(true).map_err(TransportError::Bind)?;
    }

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket).map_err(TransportError::Bind)?;

    tracing::info!(
        "replication socket bound on port {} ({} {})",
        network.port,
        if network.option == 0 { "multicast" } else { "broadcast" },
        group
    );

    Ok(DatagramChannel {
        socket: Arc::new(socket),
        dest: SocketAddr::from((group, network.port)),
    })
}

/// Start the sender and reader tasks for a bound datagram channel.
pub fn spawn(
    channel: DatagramChannel,
    cipher: Arc<FrameCipher>,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<Vec<u8>>,
    stats: Arc<TransportStats>,
    shutdown: &broadcast::Sender<()>,
) {
    let send_socket = channel.socket.clone();
    let send_cipher = cipher.clone();
    let send_stats = stats.clone();
    let dest = channel.dest;
    let mut send_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let wire = send_cipher.seal(&frame);
                    if wire.len() > MAX_DATAGRAM_LEN {
                        send_stats.oversize_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            "dropping oversize replication frame ({} > {} bytes)",
                            wire.len(),
                            MAX_DATAGRAM_LEN
                        );
                        continue;
                    }
                    if let Err(e) = send_socket.send_to(&wire, dest).await {
                        tracing::warn!("replication send to {} failed: {}", dest, e);
                    }
                }
                _ = send_shutdown.recv() => break,
            }
        }
    });

    let recv_socket = channel.socket;
    let mut recv_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                received = recv_socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _peer)) => {
                            if inbound.try_send(buf[..len].to_vec()).is_err() {
                                tracing::warn!("inbound replication queue full, dropping datagram");
                            }
                        }
                        Err(e) => {
                            tracing::error!("replication receive failed: {}", e);
                        }
                    }
                }
                _ = recv_shutdown.recv() => break,
            }
        }
    });
}
