//! Seam to the AP management service.
//!
//! The controller never talks to hostapd or the system bus directly; it
//! sends [`BusRequest`]s down a channel and the platform backend answers
//! through oneshot replies. AP notifications travel the other way as
//! [`ApEvent`]s. Tests script the backend; on a live router the backend is
//! the ubus/hostapd adapter.
//!
//! Every request carries a one second timeout. A timed-out request mutates
//! nothing; the next timer tick simply retries.

use common::MacAddr;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

pub const BUS_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// mDNS service name peers announce themselves under.
pub const MDNS_SERVICE: &str = "_dawn._tcp";

pub type SubscriptionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus call timed out")]
    Timeout,

    #[error("bus connection closed")]
    Closed,

    #[error("service not available")]
    Unavailable,
}

/// Identity and capabilities of one managed AP interface, resolved by the
/// backend at subscribe time.
#[derive(Debug, Clone)]
pub struct ApDescription {
    pub iface: String,
    pub bssid: MacAddr,
    pub ssid: String,
    pub ht: bool,
    pub vht: bool,
}

/// Raw channel-survey counters from the radio, monotonically increasing.
/// The controller only ever looks at deltas.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurveySample {
    pub channel_time: u64,
    pub channel_time_busy: u64,
}

/// A notification from one subscribed AP. `reply` carries the 802.11
/// status code back for the request classes that expect an answer.
#[derive(Debug)]
pub struct ApEvent {
    pub id: SubscriptionId,
    pub method: String,
    pub payload: serde_json::Value,
    pub reply: Option<oneshot::Sender<u16>>,
}

/// A call on the controller's own RPC object (registered as `dawn`).
#[derive(Debug)]
pub struct RpcRequest {
    pub method: String,
    pub args: serde_json::Value,
    pub reply: oneshot::Sender<Result<serde_json::Value, RpcStatus>>,
}

/// Status codes the control surface can answer with, mirrored onto the
/// platform bus error set by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    InvalidArgument,
    MethodNotFound,
}

#[derive(Debug)]
pub enum BusRequest {
    Subscribe {
        iface: String,
        reply: oneshot::Sender<Result<(SubscriptionId, ApDescription), BusError>>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    /// Acknowledge the notification channel after subscribing.
    NotifyResponse {
        id: SubscriptionId,
    },
    GetClients {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<serde_json::Value, BusError>>,
    },
    DelClient {
        id: SubscriptionId,
        addr: MacAddr,
        reason: u16,
        deauth: bool,
        ban_time: u32,
        reply: oneshot::Sender<Result<(), BusError>>,
    },
    SurveySample {
        iface: String,
        reply: oneshot::Sender<Result<SurveySample, BusError>>,
    },
    /// Refresh and browse the given mDNS service, returning peer endpoints.
    MdnsBrowse {
        service: String,
        reply: oneshot::Sender<Result<Vec<(Ipv4Addr, u16)>, BusError>>,
    },
    RegisterObject {
        name: String,
        reply: oneshot::Sender<Result<mpsc::Receiver<RpcRequest>, BusError>>,
    },
}

/// Caller side of the seam. Cheap to clone; every loop holds one.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<BusRequest>,
}

/// Backend side of the seam: the request stream to serve and the event
/// sender to push AP notifications through.
pub struct BusServer {
    pub requests: mpsc::Receiver<BusRequest>,
    pub events: mpsc::Sender<ApEvent>,
}

/// Create a connected handle/server pair plus the AP event stream.
pub fn channel(capacity: usize) -> (BusHandle, BusServer, mpsc::Receiver<ApEvent>) {
    let (req_tx, req_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    (
        BusHandle { tx: req_tx },
        BusServer {
            requests: req_rx,
            events: event_tx,
        },
        event_rx,
    )
}

impl BusHandle {
    async fn call<T>(
        &self,
        request: BusRequest,
        rx: oneshot::Receiver<Result<T, BusError>>,
    ) -> Result<T, BusError> {
        self.tx.send(request).await.map_err(|_| BusError::Closed)?;
        match timeout(BUS_CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    pub async fn subscribe(
        &self,
        iface: &str,
    ) -> Result<(SubscriptionId, ApDescription), BusError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            BusRequest::Subscribe {
                iface: iface.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.tx
            .send(BusRequest::Unsubscribe { id })
            .await
            .map_err(|_| BusError::Closed)
    }

    pub async fn notify_response(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.tx
            .send(BusRequest::NotifyResponse { id })
            .await
            .map_err(|_| BusError::Closed)
    }

    pub async fn get_clients(&self, id: SubscriptionId) -> Result<serde_json::Value, BusError> {
        let (tx, rx) = oneshot::channel();
        self.call(BusRequest::GetClients { id, reply: tx }, rx).await
    }

    pub async fn del_client(
        &self,
        id: SubscriptionId,
        addr: MacAddr,
        reason: u16,
        deauth: bool,
        ban_time: u32,
    ) -> Result<(), BusError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            BusRequest::DelClient {
                id,
                addr,
                reason,
                deauth,
                ban_time,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn survey_sample(&self, iface: &str) -> Result<SurveySample, BusError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            BusRequest::SurveySample {
                iface: iface.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn mdns_browse(&self, service: &str) -> Result<Vec<(Ipv4Addr, u16)>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            BusRequest::MdnsBrowse {
                service: service.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn register_object(
        &self,
        name: &str,
    ) -> Result<mpsc::Receiver<RpcRequest>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            BusRequest::RegisterObject {
                name: name.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }
}

/// Minimal backend for running without a platform adapter: accepts RPC
/// object registration (no calls will arrive), reports no peers, and
/// answers everything AP-related with `Unavailable`.
pub async fn serve_detached(mut server: BusServer) {
    let mut rpc_channels = Vec::new();
    while let Some(request) = server.requests.recv().await {
        match request {
            BusRequest::Subscribe { reply, iface } => {
                tracing::debug!("no management backend; cannot subscribe to {}", iface);
                let _ = reply.send(Err(BusError::Unavailable));
            }
            BusRequest::Unsubscribe { .. } | BusRequest::NotifyResponse { .. } => {}
            BusRequest::GetClients { reply, .. } => {
                let _ = reply.send(Err(BusError::Unavailable));
            }
            BusRequest::DelClient { reply, .. } => {
                let _ = reply.send(Err(BusError::Unavailable));
            }
            BusRequest::SurveySample { reply, .. } => {
                let _ = reply.send(Err(BusError::Unavailable));
            }
            BusRequest::MdnsBrowse { reply, .. } => {
                let _ = reply.send(Ok(Vec::new()));
            }
            BusRequest::RegisterObject { name, reply } => {
                tracing::info!("registered control object {} (detached)", name);
                let (tx, rx) = mpsc::channel(8);
                rpc_channels.push(tx);
                let _ = reply.send(Ok(rx));
            }
        }
    }
}
