use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a MAC address string does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address: {0}")]
pub struct InvalidMacAddr(pub String);

/// A 48-bit IEEE 802 MAC address.
///
/// Canonical text form is `HH:HH:HH:HH:HH:HH` with upper-case hex digits;
/// parsing accepts either case. Ordering is lexicographic over the six
/// bytes, which is what the steering tie-break relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = InvalidMacAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| InvalidMacAddr(s.to_string()))?;
            if part.len() != 2 {
                return Err(InvalidMacAddr(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| InvalidMacAddr(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(InvalidMacAddr(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct MacAddrVisitor;

impl Visitor<'_> for MacAddrVisitor {
    type Value = MacAddr;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a MAC address string like \"AA:BB:CC:DD:EE:FF\"")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MacAddr, E> {
        v.parse().map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(MacAddrVisitor)
    }
}
