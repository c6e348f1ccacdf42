//! Identity announcements
//!
//! A `kdeconnect.identity` packet is how a transport introduces a peer:
//! it carries the peer-chosen stable device id, the human-readable name,
//! the device type and the protocol version. A [`Device`](crate::Device)
//! discovered on the network is constructed from one of these.

use crate::packet::NetworkPacket;
use crate::{Error, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Packet type announcing a device
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Kind of device, as announced in the identity packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }
}

/// The identity a peer announces about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Opaque stable id, chosen by the peer
    pub device_id: String,

    /// Human-readable name, may change between discoveries
    pub device_name: String,

    #[serde(default)]
    pub device_type: DeviceType,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: i64,
}

fn default_protocol_version() -> i64 {
    PROTOCOL_VERSION
}

impl Identity {
    /// Create the identity of this node, generating a fresh device id
    ///
    /// Device ids are UUIDv4 with underscores instead of hyphens.
    pub fn new(device_name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            device_id: Uuid::new_v4().to_string().replace('-', "_"),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Build the announcement packet
    pub fn to_packet(&self) -> Result<NetworkPacket> {
        Ok(NetworkPacket::with_body(
            PACKET_TYPE_IDENTITY,
            serde_json::to_value(self)?,
        ))
    }

    /// Parse an identity packet
    pub fn from_packet(packet: &NetworkPacket) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(Error::MalformedPacket(format!(
                "expected identity packet, got {}",
                packet.packet_type()
            )));
        }

        serde_json::from_value(packet.body().clone())
            .map_err(|e| Error::MalformedPacket(format!("invalid identity body: {e}")))
    }
}
