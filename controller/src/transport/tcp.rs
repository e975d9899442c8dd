//! TCP overlay for replication: a full mesh of persistent connections.
//!
//! Every peer reported by the discovery loop gets one outbound connection,
//! dialed with exponential backoff and kept for the life of the process.
//! Inbound connections are accepted on `tcp_port`; each gets its own
//! reader task. Frames are a 4-byte big-endian length prefix followed by
//! the (possibly sealed) frame bytes; `read_exact` buffers partial frames
//! until they complete.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Sanity bound on a framed message.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Per-peer write queue depth.
const WRITE_QUEUE_DEPTH: usize = 64;

pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} out of range", len),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_frame(stream: &mut TcpStream, wire: &[u8]) -> io::Result<()> {
    stream.write_all(&(wire.len() as u32).to_be_bytes()).await?;
    stream.write_all(wire).await
}

#[derive(Clone)]
pub struct TcpMesh {
    peers: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
    local_port: u16,
}

impl TcpMesh {
    pub fn new(local_port: u16) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            local_port,
        }
    }

    pub async fn bind(port: u16) -> io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    /// Accept inbound mesh connections and feed their frames to the
    /// inbound queue. A connection that misbehaves is dropped; any
    /// half-read frame goes with it.
    pub fn spawn_accept(
        &self,
        listener: TcpListener,
        inbound: mpsc::Sender<Vec<u8>>,
        shutdown: &broadcast::Sender<()>,
    ) {
        let mut accept_shutdown = shutdown.subscribe();
        let conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!("mesh connection from {}", peer);
                                let inbound = inbound.clone();
                                let mut reader_shutdown = conn_shutdown.subscribe();
                                tokio::spawn(async move {
                                    let mut stream = stream;
                                    loop {
                                        tokio::select! {
                                            frame = read_frame(&mut stream) => {
                                                match frame {
                                                    Ok(frame) => {
                                                        if inbound.send(frame).await.is_err() {
                                                            break;
                                                        }
                                                    }
                                                    Err(e) => {
                                                        tracing::debug!("mesh peer {} closed: {}", peer, e);
                                                        break;
                                                    }
                                                }
                                            }
                                            _ = reader_shutdown.recv() => break,
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("mesh accept failed: {}", e);
                            }
                        }
                    }
                    _ = accept_shutdown.recv() => break,
                }
            }
        });
    }

    /// Ensure a persistent outbound connection to `addr` exists. Called on
    /// every discovery round; already-known peers are left alone.
    pub fn add_peer(&self, addr: SocketAddr) {
        // Talking to our own listener would echo every frame back.
        if addr.ip().is_loopback() && addr.port() == self.local_port {
            return;
        }

        let mut peers = self.peers.lock();
        if peers.contains_key(&addr) {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        peers.insert(addr, tx);
        drop(peers);

        tracing::info!("adding mesh peer {}", addr);
        tokio::spawn(async move {
            let mut backoff = RECONNECT_MIN;
            loop {
                match TcpStream::connect(addr).await {
                    Ok(mut stream) => {
                        tracing::info!("connected to mesh peer {}", addr);
                        backoff = RECONNECT_MIN;
                        loop {
                            match rx.recv().await {
                                Some(wire) => {
                                    if let Err(e) = write_frame(&mut stream, &wire).await {
                                        tracing::warn!("write to mesh peer {} failed: {}", addr, e);
                                        break;
                                    }
                                }
                                // Mesh dropped; nothing left to send, ever.
                                None => return,
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("connect to mesh peer {} failed: {}", addr, e);
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        });
    }

    /// Queue a sealed frame to every known peer. A peer whose queue is
    /// full loses this frame; replication is best-effort.
    pub fn send_all(&self, wire: &[u8]) {
        let peers = self.peers.lock();
        for (addr, tx) in peers.iter() {
            if tx.try_send(wire.to_vec()).is_err() {
                tracing::warn!("mesh peer {} write queue full, dropping frame", addr);
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framing_roundtrip() {
        let listener = TcpMesh::bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let payload = b"{\"method\":\"probe\",\"data\":\"{}\"}".to_vec();
        let expect = payload.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap();
            assert_eq!(frame, expect);
            // A second, partial write must not produce a frame.
            read_frame(&mut stream).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut client, &payload).await.unwrap();
        // Length prefix promising more bytes than we send: the reader
        // must keep buffering and then fail on EOF, not return garbage.
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);

        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_frame_length_bounds() {
        let listener = TcpMesh::bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let result = server.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mesh_delivers_to_accepted_peer() {
        let (shutdown, _) = broadcast::channel(1);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);

        let listener = TcpMesh::bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let receiver_mesh = TcpMesh::new(addr.port());
        receiver_mesh.spawn_accept(listener, inbound_tx, &shutdown);

        let sender_mesh = TcpMesh::new(0);
        sender_mesh.add_peer(SocketAddr::from(([127, 0, 0, 1], addr.port())));

        // The dial task races with us; retry until the frame lands.
        let wire = b"hello mesh".to_vec();
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                sender_mesh.send_all(&wire);
                tokio::select! {
                    got = inbound_rx.recv() => break got,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received.unwrap(), wire);
    }

    #[tokio::test]
    async fn test_self_connection_skipped() {
        let mesh = TcpMesh::new(1026);
        mesh.add_peer(SocketAddr::from(([127, 0, 0, 1], 1026)));
        assert_eq!(mesh.peer_count(), 0);
        mesh.add_peer(SocketAddr::from(([192, 0, 2, 1], 1026)));
        assert_eq!(mesh.peer_count(), 1);
    }
}
