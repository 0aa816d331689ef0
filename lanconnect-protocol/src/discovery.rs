//! Device identity and discovery constants
//!
//! Devices announce themselves by sending identity packets over UDP. The
//! same identity is exchanged again over TLS once a channel is established.
//!
//! ## Identity Packet Format
//!
//! Identity packets (`kdeconnect.identity`) contain:
//! - `deviceId`: UUIDv4 with underscores (e.g., `740bd4b9_b418_4ee4_97d6_caf1da8151be`)
//! - `deviceName`: 1-32 character device name
//! - `deviceType`: desktop, laptop, phone, tablet, or tv
//! - `protocolVersion`: Protocol version (currently 8)
//! - `incomingCapabilities`: List of packet types this device can receive
//! - `outgoingCapabilities`: List of packet types this device can send
//! - `tcpPort`: TCP port for establishing connections
//!
//! ## Connection Direction
//!
//! When two devices hear each other, only the one with the lexicographically
//! smaller device id dials (see [`should_initiate`]). The other answers with
//! a unicast identity so the smaller id learns about it.

use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::Ipv4Addr;
use tracing::warn;
use uuid::Uuid;

/// Default port for UDP discovery and TCP channels
pub const DEFAULT_PORT: u16 = 1716;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Maximum identity datagram we accept
pub const MAX_IDENTITY_SIZE: usize = 8192;

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// Convert device type to string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse a device type string
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "desktop" => Some(DeviceType::Desktop),
            "laptop" => Some(DeviceType::Laptop),
            "phone" | "smartphone" => Some(DeviceType::Phone),
            "tablet" => Some(DeviceType::Tablet),
            "tv" => Some(DeviceType::Tv),
            _ => None,
        }
    }
}

/// Device identity information
///
/// Contains everything a peer announces about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier (UUIDv4 with underscores)
    pub device_id: String,

    /// Human-readable device name (1-32 characters)
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version
    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections
    pub tcp_port: u16,
}

impl DeviceInfo {
    /// Create a new DeviceInfo with a freshly generated id
    ///
    /// # Examples
    ///
    /// ```
    /// use lanconnect_protocol::discovery::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("My Computer", DeviceType::Desktop, 1716);
    /// assert_eq!(info.device_id.len(), 36);
    /// ```
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, tcp_port: u16) -> Self {
        Self::with_id(
            Self::generate_device_id(),
            device_name,
            device_type,
            tcp_port,
        )
    }

    /// Generate a UUIDv4 device ID with underscores instead of hyphens
    pub fn generate_device_id() -> String {
        Uuid::new_v4().to_string().replace('-', "_")
    }

    /// Create a DeviceInfo with explicit device ID
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.chars().count() > 32 {
            warn!(
                "Device name should be 1-32 characters, got: {}",
                device_name
            );
        }

        Self {
            device_id: device_id.into(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Set all incoming capabilities at once
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Set all outgoing capabilities at once
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Convert DeviceInfo to an identity packet
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse DeviceInfo from an identity packet
    ///
    /// `protocolVersion` and the capability lists are optional; everything
    /// else must be present.
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Expected identity packet, got {}",
                packet.packet_type
            )));
        }

        let device_id: String = required(packet, "deviceId")?;
        if device_id.is_empty() {
            return Err(ProtocolError::InvalidPacket("Empty deviceId".to_string()));
        }

        let device_type: String = required(packet, "deviceType")?;
        let device_type = DeviceType::parse(&device_type).ok_or_else(|| {
            ProtocolError::InvalidPacket(format!("Unknown device type: {}", device_type))
        })?;

        Ok(Self {
            device_id,
            device_name: required(packet, "deviceName")?,
            device_type,
            protocol_version: packet
                .get_body_field("protocolVersion")
                .unwrap_or(PROTOCOL_VERSION),
            incoming_capabilities: packet
                .get_body_field("incomingCapabilities")
                .unwrap_or_default(),
            outgoing_capabilities: packet
                .get_body_field("outgoingCapabilities")
                .unwrap_or_default(),
            tcp_port: required(packet, "tcpPort")?,
        })
    }
}

fn required<T: serde::de::DeserializeOwned>(packet: &Packet, field: &str) -> Result<T> {
    packet
        .get_body_field(field)
        .ok_or_else(|| ProtocolError::InvalidPacket(format!("Missing or invalid {}", field)))
}

/// Whether the local device dials the remote one
///
/// Both sides evaluate the same comparison, so for any pair of distinct ids
/// exactly one of them initiates.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_type_serialization() {
        assert_eq!(DeviceType::Desktop.as_str(), "desktop");
        assert_eq!(DeviceType::Laptop.as_str(), "laptop");
        assert_eq!(DeviceType::Phone.as_str(), "phone");
        assert_eq!(DeviceType::Tablet.as_str(), "tablet");
        assert_eq!(DeviceType::Tv.as_str(), "tv");
        assert_eq!(DeviceType::parse("smartphone"), Some(DeviceType::Phone));
        assert_eq!(DeviceType::parse("toaster"), None);
    }

    #[test]
    fn test_device_info_creation() {
        let info = DeviceInfo::new("Test Device", DeviceType::Desktop, 1716);

        assert!(info.device_id.contains('_'));
        assert_eq!(info.device_name, "Test Device");
        assert_eq!(info.device_type, DeviceType::Desktop);
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(info.tcp_port, 1716);
    }

    #[test]
    fn test_device_info_roundtrip() {
        let original =
            DeviceInfo::with_id("test_device_id", "Test Device", DeviceType::Phone, 1740)
                .with_incoming_capability("kdeconnect.ping")
                .with_outgoing_capability("kdeconnect.findmyphone.request");

        let packet = original.to_identity_packet();
        let parsed = DeviceInfo::from_identity_packet(&packet).unwrap();

        assert_eq!(parsed, original);
    }

    #[test]
    fn test_invalid_identity_packet() {
        let packet = Packet::new("kdeconnect.ping", json!({}));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());
    }

    #[test]
    fn test_missing_fields_in_identity() {
        let packet = Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": "test_id",
            }),
        );
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());

        let packet = Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": "",
                "deviceName": "Empty",
                "deviceType": "phone",
                "tcpPort": 1716,
            }),
        );
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());
    }

    #[test]
    fn test_device_id_format() {
        let id = DeviceInfo::generate_device_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('_').count(), 4);
        assert!(!id.contains('-'));
    }

    #[test]
    fn test_exactly_one_side_initiates() {
        let a = "0a_device";
        let b = "ff_device";
        assert!(should_initiate(a, b));
        assert!(!should_initiate(b, a));
        assert!(!should_initiate(a, a));
    }
}
