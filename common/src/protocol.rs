//! Wire protocol shared by the controllers and the AP event path.
//!
//! Every replicated frame is a UTF-8 JSON object `{"method": ..., "data": ...}`
//! where `data` carries the per-method payload serialized as its own JSON
//! document. The same typed payloads are used for the notifications coming
//! from the local AP management service, so the event bus and the network
//! path decode through one set of structs.
//!
//! Decoding is permissive: optional fields default to zero/false/empty and
//! unknown fields are ignored. Only a missing or malformed address field
//! fails a payload.

use crate::mac::MacAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const METHOD_PROBE: &str = "probe";
pub const METHOD_CLIENTS: &str = "clients";
pub const METHOD_DEAUTH: &str = "deauth";
pub const METHOD_SETPROBE: &str = "setprobe";
pub const METHOD_ADDMAC: &str = "addmac";

/// Errors produced while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame or payload is not the expected JSON shape.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carried a method name this controller does not know.
    /// Dispatch compares the full method string, never a prefix.
    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

/// Outer envelope of every replicated frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFrame {
    pub method: String,
    pub data: String,
}

/// A probe request observation as seen by one AP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMessage {
    pub bssid: MacAddr,
    pub address: MacAddr,
    pub target: MacAddr,
    #[serde(default)]
    pub signal: i32,
    #[serde(default)]
    pub freq: u32,
    #[serde(default)]
    pub ht_support: bool,
    #[serde(default)]
    pub vht_support: bool,
}

/// An authentication or association request. Same shape for both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMessage {
    pub bssid: MacAddr,
    pub address: MacAddr,
    pub target: MacAddr,
    #[serde(default)]
    pub signal: i32,
    #[serde(default)]
    pub freq: u32,
}

/// Minimal `{bssid, address}` notification, used by deauth and setprobe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyMessage {
    pub bssid: MacAddr,
    pub address: MacAddr,
}

/// Per-station flags inside a client table report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFlags {
    #[serde(default)]
    pub auth: bool,
    #[serde(default)]
    pub assoc: bool,
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub preauth: bool,
    #[serde(default)]
    pub wds: bool,
    #[serde(default)]
    pub wmm: bool,
    #[serde(default)]
    pub ht: bool,
    #[serde(default)]
    pub vht: bool,
    #[serde(default)]
    pub wps: bool,
    #[serde(default)]
    pub mfp: bool,
    #[serde(default)]
    pub aid: u16,
}

fn unknown_i32() -> i32 {
    -1
}

/// One AP's full client table, enriched by the reporting controller with
/// the AP identity and its averaged channel utilization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTableMessage {
    #[serde(default)]
    pub clients: HashMap<MacAddr, ClientFlags>,
    pub bssid: MacAddr,
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub freq: u32,
    #[serde(default)]
    pub ht_supported: bool,
    #[serde(default)]
    pub vht_supported: bool,
    #[serde(default)]
    pub channel_utilization: u32,
    #[serde(default = "unknown_i32")]
    pub collision_domain: i32,
    #[serde(default = "unknown_i32")]
    pub bandwidth: i32,
}

/// Administrative permit-list addition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMacMessage {
    pub addr: MacAddr,
}

/// A decoded replication frame, routed by method tag.
#[derive(Debug, Clone)]
pub enum RemoteMessage {
    Probe(ProbeMessage),
    Clients(ClientTableMessage),
    Deauth(NotifyMessage),
    SetProbe(NotifyMessage),
    AddMac(AddMacMessage),
}

impl RemoteMessage {
    pub fn method(&self) -> &'static str {
        match self {
            RemoteMessage::Probe(_) => METHOD_PROBE,
            RemoteMessage::Clients(_) => METHOD_CLIENTS,
            RemoteMessage::Deauth(_) => METHOD_DEAUTH,
            RemoteMessage::SetProbe(_) => METHOD_SETPROBE,
            RemoteMessage::AddMac(_) => METHOD_ADDMAC,
        }
    }
}

/// Serialize a payload into the two-level frame encoding.
pub fn encode_frame<T: Serialize>(method: &str, data: &T) -> Result<String, ProtocolError> {
    let data = serde_json::to_string(data)?;
    let frame = NetworkFrame {
        method: method.to_string(),
        data,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Decode a frame and its embedded payload.
pub fn decode_frame(raw: &str) -> Result<RemoteMessage, ProtocolError> {
    let frame: NetworkFrame = serde_json::from_str(raw)?;
    match frame.method.as_str() {
        METHOD_PROBE => Ok(RemoteMessage::Probe(serde_json::from_str(&frame.data)?)),
        METHOD_CLIENTS => Ok(RemoteMessage::Clients(serde_json::from_str(&frame.data)?)),
        METHOD_DEAUTH => Ok(RemoteMessage::Deauth(serde_json::from_str(&frame.data)?)),
        METHOD_SETPROBE => Ok(RemoteMessage::SetProbe(serde_json::from_str(&frame.data)?)),
        METHOD_ADDMAC => Ok(RemoteMessage::AddMac(serde_json::from_str(&frame.data)?)),
        other => Err(ProtocolError::UnknownMethod(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_roundtrip() {
        let msg = ProbeMessage {
            bssid: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            address: "cc:00:00:00:00:01".parse().unwrap(),
            target: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            signal: -55,
            freq: 5180,
            ht_support: true,
            vht_support: true,
        };
        let raw = encode_frame(METHOD_PROBE, &msg).unwrap();
        match decode_frame(&raw).unwrap() {
            RemoteMessage::Probe(back) => assert_eq!(back, msg),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_missing_optionals_default() {
        let data = r#"{"bssid":"aa:aa:aa:aa:aa:01","address":"cc:00:00:00:00:01","target":"aa:aa:aa:aa:aa:01"}"#;
        let msg: ProbeMessage = serde_json::from_str(data).unwrap();
        assert_eq!(msg.signal, 0);
        assert_eq!(msg.freq, 0);
        assert!(!msg.ht_support);
        assert!(!msg.vht_support);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let data = r#"{"bssid":"aa:aa:aa:aa:aa:01","address":"cc:00:00:00:00:01","target":"aa:aa:aa:aa:aa:01","rcpi":12,"vendor":"x"}"#;
        assert!(serde_json::from_str::<ProbeMessage>(data).is_ok());
    }

    #[test]
    fn test_missing_address_is_malformed() {
        let data = r#"{"bssid":"aa:aa:aa:aa:aa:01","signal":-40}"#;
        assert!(serde_json::from_str::<ProbeMessage>(data).is_err());
        let data = r#"{"bssid":"aa:aa:aa:aa:aa:01","address":"not-a-mac","target":"aa:aa:aa:aa:aa:01"}"#;
        assert!(serde_json::from_str::<ProbeMessage>(data).is_err());
    }

    #[test]
    fn test_full_method_names_only() {
        // "setpr"/"deaut"-style prefixes must not dispatch.
        let frame = NetworkFrame {
            method: "setpr".to_string(),
            data: r#"{"bssid":"aa:aa:aa:aa:aa:01","address":"cc:00:00:00:00:01"}"#.to_string(),
        };
        let raw = serde_json::to_string(&frame).unwrap();
        assert!(matches!(
            decode_frame(&raw),
            Err(ProtocolError::UnknownMethod(m)) if m == "setpr"
        ));
    }

    #[test]
    fn test_client_table_defaults() {
        let data = r#"{"bssid":"aa:aa:aa:aa:aa:02","clients":{"cc:00:00:00:00:01":{"auth":true,"assoc":true,"aid":1}}}"#;
        let msg: ClientTableMessage = serde_json::from_str(data).unwrap();
        assert_eq!(msg.collision_domain, -1);
        assert_eq!(msg.bandwidth, -1);
        assert_eq!(msg.channel_utilization, 0);
        let client = &msg.clients[&"cc:00:00:00:00:01".parse().unwrap()];
        assert!(client.auth && client.assoc);
        assert!(!client.vht);
        assert_eq!(client.aid, 1);
    }
}
