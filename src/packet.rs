//! Network packet
//!
//! The packet is the message envelope of the protocol: a JSON object
//! `{id, type, body, version}` with a newline terminator on the wire.
//! Packets can be sealed with the peer's RSA public key, which wraps the
//! whole serialized packet into a `kdeconnect.encrypted` carrier.

use crate::crypto::{LocalKeyPair, PeerPublicKey};
use crate::{Error, Result, PROTOCOL_VERSION};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};

/// Packet type carrying an encrypted packet as its payload
pub const PACKET_TYPE_ENCRYPTED: &str = "kdeconnect.encrypted";

static NEXT_ID: AtomicI64 = AtomicI64::new(0);

/// Allocate a packet id: the current millisecond timestamp, bumped past the
/// previously issued id so ids stay strictly increasing within this process.
pub(crate) fn next_packet_id() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut prev = NEXT_ID.load(Ordering::Relaxed);
    loop {
        let next = if now > prev { now } else { prev + 1 };
        match NEXT_ID.compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

/// A protocol message
///
/// Value-typed and compared by content. The body is a JSON object accessed
/// through the typed [`get`](NetworkPacket::get)/[`set`](NetworkPacket::set)
/// accessors; `id`, `type`, `version` and the encrypted flag are not
/// reachable through them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkPacket {
    #[serde(deserialize_with = "deserialize_id")]
    id: i64,

    #[serde(rename = "type")]
    packet_type: String,

    #[serde(default = "empty_body")]
    body: Value,

    #[serde(default = "default_version")]
    version: i64,

    #[serde(skip)]
    encrypted: bool,
}

impl NetworkPacket {
    /// Create a packet of the given type with a fresh id and an empty body
    pub fn new(packet_type: impl Into<String>) -> Self {
        Self {
            id: next_packet_id(),
            packet_type: packet_type.into(),
            body: json!({}),
            version: PROTOCOL_VERSION,
            encrypted: false,
        }
    }

    /// Create a packet with a prebuilt body
    pub fn with_body(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: next_packet_id(),
            packet_type: packet_type.into(),
            body,
            version: PROTOCOL_VERSION,
            encrypted: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn packet_type(&self) -> &str {
        &self.packet_type
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Read-only view of the body object
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Set a body field
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.into(), value.into());
        }
    }

    /// Get a body field, deserialized into the requested type
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a body field, falling back to a caller-supplied default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.body.get(key).is_some()
    }

    /// Encode as newline-terminated JSON
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode a packet from raw bytes
    ///
    /// Accepts any key order and surrounding whitespace. Fails with
    /// [`Error::MalformedPacket`] on invalid JSON or missing fields.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let is_padding = |b: &u8| *b == 0 || b.is_ascii_whitespace();
        let start = data.iter().position(|b| !is_padding(b)).unwrap_or(data.len());
        let end = data.iter().rposition(|b| !is_padding(b)).map_or(start, |i| i + 1);

        let mut packet: NetworkPacket = serde_json::from_slice(&data[start..end])
            .map_err(|e| Error::MalformedPacket(format!("failed to deserialize packet: {e}")))?;
        packet.encrypted = packet.packet_type == PACKET_TYPE_ENCRYPTED;
        Ok(packet)
    }

    /// Encrypt this packet in place with the peer's public key
    ///
    /// The serialized packet is RSA-encrypted in chunks and the packet turns
    /// into a `kdeconnect.encrypted` carrier whose body holds the base64
    /// ciphertext blocks.
    pub fn seal(&mut self, key: &PeerPublicKey) -> Result<()> {
        let plaintext = NetworkPacket::serialize(self)?;
        let blocks = key.encrypt_blocks(&plaintext)?;
        self.body = json!({ "data": blocks });
        self.packet_type = PACKET_TYPE_ENCRYPTED.to_string();
        self.encrypted = true;
        Ok(())
    }

    /// Decrypt an encrypted packet, yielding the packet that was sealed
    ///
    /// The inner packet keeps its original id, type and body.
    pub fn open(&self, key: &LocalKeyPair) -> Result<NetworkPacket> {
        let blocks: Vec<String> = match self.body.get("data") {
            Some(Value::Array(_)) => self
                .get("data")
                .ok_or_else(|| Error::MalformedPacket("non-string ciphertext block".to_string()))?,
            Some(Value::String(block)) => vec![block.clone()],
            _ => {
                return Err(Error::MalformedPacket(
                    "encrypted packet without ciphertext data".to_string(),
                ))
            }
        };

        let plaintext = key.decrypt_blocks(&blocks)?;
        let mut inner = Self::deserialize(&plaintext)?;
        inner.encrypted = false;
        Ok(inner)
    }
}

fn empty_body() -> Value {
    json!({})
}

fn default_version() -> i64 {
    PROTOCOL_VERSION
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_pair() -> (LocalKeyPair, PeerPublicKey) {
        let local = LocalKeyPair::generate().unwrap();
        let peer = PeerPublicKey::from_base64_der(&local.public_key_base64().unwrap()).unwrap();
        (local, peer)
    }

    #[test]
    fn test_new_packet() {
        let packet = NetworkPacket::new("kdeconnect.ping");
        assert!(packet.is_type("kdeconnect.ping"));
        assert_eq!(packet.version(), PROTOCOL_VERSION);
        assert!(!packet.is_encrypted());
        assert!(packet.body().as_object().unwrap().is_empty());
    }

    #[test]
    fn test_packet_ids_strictly_increase() {
        let ids: Vec<i64> = (0..100).map(|_| next_packet_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_typed_body_access() {
        let mut packet = NetworkPacket::new("kdeconnect.pair");
        packet.set("pair", true);
        packet.set("publicKey", "c29tZSBrZXk=");
        packet.set("count", 7);

        assert_eq!(packet.get::<bool>("pair"), Some(true));
        assert_eq!(packet.get::<String>("publicKey").unwrap(), "c29tZSBrZXk=");
        assert_eq!(packet.get::<i64>("count"), Some(7));
        assert!(packet.has("pair"));
        assert!(!packet.has("missing"));
        assert_eq!(packet.get_or("missing", false), false);
        // Wrong type reads as absent
        assert_eq!(packet.get::<bool>("count"), None);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut packet = NetworkPacket::new("kdeconnect.identity");
        packet.set("deviceName", "workstation");
        packet.set("tags", vec!["a".to_string(), "b".to_string()]);

        let bytes = packet.serialize().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');

        let decoded = NetworkPacket::deserialize(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_deserialize_any_key_order() {
        let raw = br#"{"version":5,"body":{"pair":true},"type":"kdeconnect.pair","id":42}"#;
        let packet = NetworkPacket::deserialize(raw).unwrap();
        assert_eq!(packet.id(), 42);
        assert!(packet.is_type("kdeconnect.pair"));
        assert_eq!(packet.get::<bool>("pair"), Some(true));
    }

    #[test]
    fn test_deserialize_string_id() {
        let raw = br#"{"id":"1234","type":"kdeconnect.ping","body":{},"version":5}"#;
        let packet = NetworkPacket::deserialize(raw).unwrap();
        assert_eq!(packet.id(), 1234);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(matches!(
            NetworkPacket::deserialize(b"not json"),
            Err(Error::MalformedPacket(_))
        ));
        // Missing required type field
        assert!(matches!(
            NetworkPacket::deserialize(br#"{"id":1,"body":{},"version":5}"#),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_deserialize_tolerates_padding() {
        let raw = b"\x00\x00  {\"id\":1,\"type\":\"kdeconnect.ping\",\"body\":{},\"version\":5}\n\n";
        let packet = NetworkPacket::deserialize(raw).unwrap();
        assert!(packet.is_type("kdeconnect.ping"));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (local, peer) = key_pair();

        let mut packet = NetworkPacket::new("kdeconnect.ping");
        packet.set("message", "hello");
        let original = packet.clone();

        packet.seal(&peer).unwrap();
        assert!(packet.is_encrypted());
        assert!(packet.is_type(PACKET_TYPE_ENCRYPTED));
        let blocks: Vec<String> = packet.get("data").unwrap();
        assert!(!blocks.is_empty());

        let opened = packet.open(&local).unwrap();
        assert_eq!(opened, original);
        assert!(!opened.is_encrypted());
    }

    #[test]
    fn test_seal_chunks_large_bodies() {
        let (local, peer) = key_pair();

        let mut packet = NetworkPacket::new("kdeconnect.notification");
        packet.set("text", "x".repeat(2000));
        let original = packet.clone();

        packet.seal(&peer).unwrap();
        let blocks: Vec<String> = packet.get("data").unwrap();
        assert!(blocks.len() > 1);

        let opened = packet.open(&local).unwrap();
        assert_eq!(opened, original);
    }

    #[test]
    fn test_open_accepts_single_string_block() {
        let (local, peer) = key_pair();

        let mut packet = NetworkPacket::new("kdeconnect.ping");
        packet.seal(&peer).unwrap();
        let blocks: Vec<String> = packet.get("data").unwrap();
        assert_eq!(blocks.len(), 1);

        let mut flattened = packet.clone();
        flattened.body = json!({ "data": blocks[0] });
        let opened = flattened.open(&local).unwrap();
        assert!(opened.is_type("kdeconnect.ping"));
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let (_, peer) = key_pair();
        let other = LocalKeyPair::generate().unwrap();

        let mut packet = NetworkPacket::new("kdeconnect.ping");
        packet.seal(&peer).unwrap();

        assert!(packet.open(&other).is_err());
    }

    #[test]
    fn test_open_without_data_is_malformed() {
        let local = LocalKeyPair::generate().unwrap();
        let packet = NetworkPacket::new(PACKET_TYPE_ENCRYPTED);
        assert!(matches!(
            packet.open(&local),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_deserialize_marks_encrypted_carrier() {
        let raw = br#"{"id":1,"type":"kdeconnect.encrypted","body":{"data":["AAAA"]},"version":5}"#;
        let packet = NetworkPacket::deserialize(raw).unwrap();
        assert!(packet.is_encrypted());
    }
}
