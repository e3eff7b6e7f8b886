//! Raw payload bytes exchanged between the virtual endpoint and its peer.
//!
//! A [`Packet`] is never interpreted: it is compared byte for byte and
//! rendered as upper-case hex for logs and flow files.  No I/O happens here.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FlowError;

/// An immutable blob of bytes.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    /// Parse a hex dump.  Case is ignored; `:` and whitespace separators are
    /// stripped so dumps copied from Wireshark work unchanged.
    pub fn from_hex(hex_dump: &str) -> Result<Self, FlowError> {
        let cleaned: String = hex_dump
            .chars()
            .filter(|c| *c != ':' && !c.is_whitespace())
            .collect();
        Ok(Self {
            bytes: hex::decode(cleaned)?,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.bytes)
    }
}

impl From<Vec<u8>> for Packet {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<&str> for Packet {
    fn from(text: &str) -> Self {
        Self::from_bytes(text.as_bytes())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", self.to_hex())
    }
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Packet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_dump = String::deserialize(deserializer)?;
        Packet::from_hex(&hex_dump).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_upper_case() {
        assert_eq!(Packet::from("Hello").to_hex(), "48656C6C6F");
    }

    #[test]
    fn from_hex_ignores_case_and_separators() {
        let lower = Packet::from_hex("48656c6c6f").unwrap();
        let dumped = Packet::from_hex("48:65:6C:6c:6F").unwrap();
        assert_eq!(lower, Packet::from("Hello"));
        assert_eq!(dumped, lower);
    }

    #[test]
    fn from_hex_rejects_odd_length() {
        assert!(matches!(
            Packet::from_hex("ABC"),
            Err(FlowError::InvalidHex(_))
        ));
    }

    #[test]
    fn from_hex_rejects_non_hex_chars() {
        assert!(Packet::from_hex("ZZ").is_err());
    }

    #[test]
    fn empty_packet() {
        let p = Packet::from_hex("").unwrap();
        assert!(p.is_empty());
        assert_eq!(p.to_string(), "");
    }

    #[test]
    fn serde_uses_hex_string() {
        let json = serde_json::to_string(&Packet::from("Hi")).unwrap();
        assert_eq!(json, "\"4869\"");
        let back: Packet = serde_json::from_str("\"4869\"").unwrap();
        assert_eq!(back, Packet::from("Hi"));
    }
}
