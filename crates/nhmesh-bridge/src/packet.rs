//! Packet types on both sides of the pipeline
//!
//! - [`RawPacket`] is what the radio link hands over: numeric node numbers,
//!   a port number and an opaque payload.
//! - [`Packet`] is the normalized, immutable value published to MQTT:
//!   canonical hex node ids, a resolved gateway id and radio metadata.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::node::NodeId;

/// Gateway id published when the link cannot tell us who we are
pub const UNKNOWN_GATEWAY: &str = "unknown";

/// Port numbers for Meshtastic data payloads
/// Based on Meshtastic PortNum enum from portnums.proto
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshtasticPort {
    /// Unknown/invalid port
    Unknown = 0,
    /// Text message port (UTF-8 encoded strings)
    TextMessage = 1,
    /// Remote hardware control
    RemoteHardware = 2,
    /// Position data
    Position = 3,
    /// Node info (user data)
    NodeInfo = 4,
    /// Routing protocol messages
    Routing = 5,
    /// Admin messages
    Admin = 6,
    /// Telemetry data
    Telemetry = 67,
    /// Route discovery
    Traceroute = 70,
    /// Neighbor info
    NeighborInfo = 71,
}

impl MeshtasticPort {
    /// Protobuf enum name, as used in published JSON
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN_APP",
            Self::TextMessage => "TEXT_MESSAGE_APP",
            Self::RemoteHardware => "REMOTE_HARDWARE_APP",
            Self::Position => "POSITION_APP",
            Self::NodeInfo => "NODEINFO_APP",
            Self::Routing => "ROUTING_APP",
            Self::Admin => "ADMIN_APP",
            Self::Telemetry => "TELEMETRY_APP",
            Self::Traceroute => "TRACEROUTE_APP",
            Self::NeighborInfo => "NEIGHBORINFO_APP",
        }
    }
}

impl From<u32> for MeshtasticPort {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::TextMessage,
            2 => Self::RemoteHardware,
            3 => Self::Position,
            4 => Self::NodeInfo,
            5 => Self::Routing,
            6 => Self::Admin,
            67 => Self::Telemetry,
            70 => Self::Traceroute,
            71 => Self::NeighborInfo,
            _ => Self::Unknown,
        }
    }
}

impl From<MeshtasticPort> for u32 {
    fn from(port: MeshtasticPort) -> Self {
        port as u32
    }
}

impl fmt::Display for MeshtasticPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LoRa modem preset of the gateway radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModemPreset {
    /// LONG_FAST
    LongFast,
    /// LONG_SLOW
    LongSlow,
    /// VERY_LONG_SLOW
    VeryLongSlow,
    /// MEDIUM_SLOW
    MediumSlow,
    /// MEDIUM_FAST
    MediumFast,
    /// SHORT_SLOW
    ShortSlow,
    /// SHORT_FAST
    ShortFast,
    /// LONG_MODERATE
    LongModerate,
    /// SHORT_TURBO
    ShortTurbo,
    /// Not reported by the device
    #[default]
    Unknown,
}

impl From<u8> for ModemPreset {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::LongFast,
            1 => Self::LongSlow,
            2 => Self::VeryLongSlow,
            3 => Self::MediumSlow,
            4 => Self::MediumFast,
            5 => Self::ShortSlow,
            6 => Self::ShortFast,
            7 => Self::LongModerate,
            8 => Self::ShortTurbo,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ModemPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A packet as delivered by the radio link
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    /// Source node number
    pub from: u32,
    /// Destination node number (0xFFFFFFFF for broadcast)
    pub to: u32,
    /// Unique packet identifier
    pub packet_id: u32,
    /// Channel index (0-7)
    pub channel: u8,
    /// Port number indicating payload type
    pub port_num: MeshtasticPort,
    /// Raw payload data
    pub payload: Bytes,
    /// Remaining hops
    pub hop_limit: u8,
    /// Whether the sender asked for an ack
    pub want_ack: bool,
    /// Receive timestamp (if the device reported one)
    pub rx_time: Option<DateTime<Utc>>,
}

impl RawPacket {
    /// Check if this is a broadcast message
    pub fn is_broadcast(&self) -> bool {
        NodeId::new(self.to).is_broadcast()
    }
}

/// Decoded portion of a published packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPayload {
    /// Port name, e.g. `TEXT_MESSAGE_APP`
    pub portnum: String,
    /// UTF-8 text for text messages
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    /// Hex-encoded payload for everything else
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<String>,
}

/// A normalized packet, ready for MQTT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Source node in canonical hex
    pub from_id: NodeId,
    /// Destination node in canonical hex, or `^all`
    pub to_id: NodeId,
    /// Packet identifier
    pub id: u32,
    /// Channel index
    pub channel: u8,
    /// Channel name, when the gateway reported one
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel_name: Option<String>,
    /// Remaining hops at reception
    pub hop_limit: u8,
    /// Payload
    pub decoded: DecodedPayload,
    /// When the packet was received
    pub rx_time: DateTime<Utc>,
    /// Gateway that heard the packet, or `unknown`
    pub gateway_id: String,
    /// Always `rf`
    pub source: String,
    /// Gateway modem preset
    #[serde(rename = "modem_preset")]
    pub modem_preset: ModemPreset,
    /// Gateway LoRa channel number
    #[serde(rename = "channel_num")]
    pub lora_channel: u32,
}

impl Packet {
    /// Canonical id of the source node
    pub fn source_node_id(&self) -> &NodeId {
        &self.from_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meshtastic_port_conversion() {
        assert_eq!(MeshtasticPort::from(1), MeshtasticPort::TextMessage);
        assert_eq!(MeshtasticPort::from(70), MeshtasticPort::Traceroute);
        assert_eq!(MeshtasticPort::from(9999), MeshtasticPort::Unknown);
        assert_eq!(u32::from(MeshtasticPort::Telemetry), 67);
    }

    #[test]
    fn test_port_names() {
        assert_eq!(MeshtasticPort::TextMessage.as_str(), "TEXT_MESSAGE_APP");
        assert_eq!(MeshtasticPort::Traceroute.to_string(), "TRACEROUTE_APP");
    }

    #[test]
    fn test_modem_preset_mapping() {
        assert_eq!(ModemPreset::from(0), ModemPreset::LongFast);
        assert_eq!(ModemPreset::from(4), ModemPreset::MediumFast);
        assert_eq!(ModemPreset::from(200), ModemPreset::Unknown);
        assert_eq!(ModemPreset::MediumFast.to_string(), "MediumFast");
    }

    #[test]
    fn test_packet_is_broadcast() {
        let packet = RawPacket {
            from: 0x12345678,
            to: 0xFFFFFFFF,
            packet_id: 1,
            channel: 0,
            port_num: MeshtasticPort::TextMessage,
            payload: Bytes::from_static(b"hi"),
            hop_limit: 3,
            want_ack: false,
            rx_time: None,
        };
        assert!(packet.is_broadcast());
    }

    #[test]
    fn test_published_field_names() {
        let packet = Packet {
            from_id: NodeId::new(0x1a2b3c4d),
            to_id: NodeId::broadcast(),
            id: 7,
            channel: 0,
            channel_name: None,
            hop_limit: 3,
            decoded: DecodedPayload {
                portnum: "TEXT_MESSAGE_APP".into(),
                text: Some("hello".into()),
                payload: None,
            },
            rx_time: Utc::now(),
            gateway_id: UNKNOWN_GATEWAY.into(),
            source: "rf".into(),
            modem_preset: ModemPreset::LongFast,
            lora_channel: 20,
        };
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["fromId"], "!1a2b3c4d");
        assert_eq!(value["toId"], "^all");
        assert_eq!(value["gatewayId"], "unknown");
        assert_eq!(value["modem_preset"], "LongFast");
        assert_eq!(value["channel_num"], 20);
        assert!(value.get("channelName").is_none());
    }
}
