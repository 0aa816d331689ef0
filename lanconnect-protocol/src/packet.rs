//! Network Packet
//!
//! This module implements the core packet structure for the protocol.
//! Packets are JSON-formatted messages with a newline terminator.
//!
//! ## Packet Structure
//!
//! Each packet contains:
//! - `id`: UNIX epoch timestamp in milliseconds
//! - `type`: Packet type in format `kdeconnect.<plugin>[.<action>]`
//! - `body`: JSON dictionary of plugin-specific parameters
//! - `payloadSize`: (optional) Size of payload data in bytes
//! - `payloadTransferInfo`: (optional) Transfer negotiation parameters
//!
//! Payload bytes never travel inside the packet frame. They flow over a
//! separate [`Transfer`](crate::payload::Transfer) connection whose port is
//! carried in `payloadTransferInfo`.

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Identity announcement, sent in cleartext over UDP and again over TLS
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Pair request, accept, reject and unpair
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Capability list update from an already connected peer
pub const PACKET_TYPE_CAPABILITIES: &str = "kdeconnect.capabilities";

/// Represents a network packet
///
/// # Examples
///
/// ```
/// use lanconnect_protocol::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("kdeconnect.ping", json!({ "message": "hi" }));
///
/// let bytes = packet.to_bytes().unwrap();
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed.packet_type, "kdeconnect.ping");
/// assert_eq!(parsed.id, packet.id);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    /// Note: Some clients send this as a string
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    /// Packet type in format: kdeconnect.<plugin>[.<action>]
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Plugin-specific parameters
    #[serde(default = "empty_body")]
    pub body: Value,

    /// Optional payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Creates a new packet with the specified type and body
    ///
    /// The packet ID is automatically set to the current timestamp in milliseconds.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Create a new packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Serialize packet to bytes with newline terminator
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Json` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet from bytes
    ///
    /// Accepts both newline-terminated and non-terminated JSON, with either
    /// `\r\n` (CRLF) or `\n` (LF) terminators.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidPacket` if the data is not valid JSON
    /// or doesn't conform to the packet structure.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to deserialize packet: {}", e))
        })
    }

    /// Builder pattern: Set payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder pattern: Set payload transfer info
    pub fn with_payload_transfer_info(mut self, info: HashMap<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder pattern: Add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.body.is_object() {
            self.body = empty_body();
        }
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Whether this packet belongs to the connection layer rather than a plugin
    pub fn is_reserved(&self) -> bool {
        matches!(
            self.packet_type.as_str(),
            PACKET_TYPE_IDENTITY | PACKET_TYPE_PAIR | PACKET_TYPE_CAPABILITIES
        )
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Port of the companion payload stream, if one was announced
    pub fn payload_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()?
            .get("port")?
            .as_u64()
            .and_then(|port| u16::try_from(port).ok())
    }

    /// Whether this packet announces a companion payload stream
    pub fn has_payload(&self) -> bool {
        self.payload_port().is_some()
    }
}

fn empty_body() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Custom deserializer for the `id` field to handle both string and number formats
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Custom serializer for the `id` field - always serialize as a number
fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_packet() {
        let packet = Packet::new("kdeconnect.ping", json!({}));
        assert_eq!(packet.packet_type, "kdeconnect.ping");
        assert!(packet.body.is_object());
        assert!(packet.id > 0);
    }

    #[test]
    fn test_packet_serialization() {
        let packet = Packet::with_id(
            42,
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": "test_device",
                "deviceName": "Test Device",
                "protocolVersion": 8
            }),
        );

        let bytes = packet.to_bytes().unwrap();
        let json_str = String::from_utf8_lossy(&bytes);

        assert!(json_str.ends_with('\n'));
        assert_eq!(json_str.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(json_str.trim_end()).unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["type"], "kdeconnect.identity");
        assert!(value.get("payloadSize").is_none());
    }

    #[test]
    fn test_round_trip_preserves_unknown_body_keys() {
        let packet = Packet::with_id(
            i64::MAX,
            "kdeconnect.test",
            json!({
                "foo": "X",
                "nested": { "unknown": [1, 2, 3], "flag": true },
                "big": i64::MIN,
            }),
        );

        let parsed = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.body["nested"]["unknown"], json!([1, 2, 3]));
        assert_eq!(parsed.get_body_field::<i64>("big"), Some(i64::MIN));
    }

    #[test]
    fn test_from_bytes_accepts_crlf_and_string_id() {
        let data = b"{\"id\":\"1700000000000\",\"type\":\"kdeconnect.ping\",\"body\":{}}\r\n";
        let packet = Packet::from_bytes(data).unwrap();
        assert_eq!(packet.id, 1_700_000_000_000);
        assert!(packet.is_type("kdeconnect.ping"));
    }

    #[test]
    fn test_missing_body_defaults_to_object() {
        let packet = Packet::from_bytes(br#"{"id":1,"type":"kdeconnect.ping"}"#).unwrap();
        assert_eq!(packet.body, json!({}));
    }

    #[test]
    fn test_invalid_packet() {
        assert!(matches!(
            Packet::from_bytes(b"{\"id\":1}"),
            Err(ProtocolError::InvalidPacket(_))
        ));
        assert!(Packet::from_bytes(b"{\"id\":true,\"type\":\"a\"}").is_err());
    }

    #[test]
    fn test_payload_fields() {
        let mut info = HashMap::new();
        info.insert("port".to_string(), json!(1739));

        let packet = Packet::new("kdeconnect.photo", json!({}))
            .with_payload_size(1024)
            .with_payload_transfer_info(info);

        let parsed = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.payload_size, Some(1024));
        assert_eq!(parsed.payload_port(), Some(1739));
        assert!(parsed.has_payload());

        let plain = Packet::new("kdeconnect.photo", json!({}));
        assert_eq!(plain.payload_port(), None);
    }

    #[test]
    fn test_reserved_types() {
        assert!(Packet::new(PACKET_TYPE_PAIR, json!({"pair": true})).is_reserved());
        assert!(Packet::new(PACKET_TYPE_CAPABILITIES, json!({})).is_reserved());
        assert!(!Packet::new("kdeconnect.ping", json!({})).is_reserved());
    }

    #[test]
    fn test_with_body_field() {
        let packet = Packet::new("kdeconnect.ping", Value::Null).with_body_field("message", "hi");
        assert_eq!(
            packet.get_body_field::<String>("message"),
            Some("hi".to_string())
        );
    }
}
