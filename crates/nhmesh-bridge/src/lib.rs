//! Resilient Meshtastic radio to MQTT bridge
//!
//! This crate keeps a gateway radio connected, republishes everything it
//! hears to an MQTT broker, accepts send requests from MQTT, and runs a
//! background traceroute daemon that maps the mesh.
//!
//! # Architecture
//!
//! 1. **Radio link** - TCP or serial session to a Meshtastic device
//!    ([`interface`])
//! 2. **Connection manager** - connect/reconnect state machine with
//!    exponential backoff and stale-event rejection ([`connection`])
//! 3. **Health monitor** - reconnects a link that has gone quiet
//!    ([`health`])
//! 4. **Packet pipeline** - normalizes packets for publishing
//!    ([`pipeline`])
//! 5. **MQTT bridge** - publishes to `<root>/<node id>` and relays send
//!    requests to the radio ([`mqtt`])
//! 6. **Traceroute daemon** - cooldown-spaced traceroutes with per-node
//!    backoff that survives restarts ([`traceroute`])
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nhmesh_bridge::{BridgeConfigBuilder, BridgeService};
//!
//! #[tokio::main]
//! async fn main() -> nhmesh_bridge::Result<()> {
//!     let config = BridgeConfigBuilder::new()
//!         .tcp("192.168.1.50", 4403)
//!         .broker("mqtt.nhmesh.live", 1883)
//!         .root_topic("msh/US/NH/")
//!         .listen_topic("msh/US/NH/send")
//!         .build();
//!
//!     let bridge = BridgeService::start(config)?;
//!     tokio::signal::ctrl_c().await?;
//!     bridge.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `tcp` - TCP link for networked devices (default)
//! - `serial` - Serial port link (requires `libudev-dev` on Linux)
//! - `full` - Enable all links
//!
//! # Protocol Details
//!
//! The device stream uses Meshtastic framing:
//! - Bytes 0-1: Magic number `0x94C3`
//! - Bytes 2-3: Payload length (big-endian u16)
//! - Bytes 4+: Frame body
//!
//! Maximum LoRa payload is **237 bytes**; longer text is rejected before
//! it reaches the radio.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod node;
pub mod packet;

pub mod interface;

pub mod connection;
pub mod health;
pub mod mqtt;
pub mod pipeline;
pub mod traceroute;

pub mod service;

pub mod test_utils;

pub use backoff::ExponentialBackoff;
pub use config::{
    BridgeConfig, BridgeConfigBuilder, HealthConfig, LinkConfig, MqttConfig, ReconnectConfig,
    TracerouteConfig,
};
pub use error::{BridgeError, ErrorKind, Result};
pub use node::NodeId;
pub use packet::{MeshtasticPort, ModemPreset, Packet, RawPacket};

pub use interface::{ConnectionState, LinkInfo, MeshLink, OutboundMessage};

#[cfg(feature = "serial")]
pub use interface::{find_meshtastic_port, SerialLink};
#[cfg(feature = "tcp")]
pub use interface::TcpLink;

pub use connection::{ConnectionManager, ConnectionStats, HealthStatus};
pub use health::HealthMonitor;
pub use mqtt::{MqttBridge, MqttHandle, MqttStatus, SendRequest};
pub use pipeline::{PacketPipeline, PipelineStats};
pub use traceroute::{TracerouteDaemon, TracerouteHandle, TracerouteSnapshot, TracerouteTarget};

pub use service::{BridgeHandle, BridgeService, BridgeStatus};

pub use test_utils::MockLink;

// Protocol constants re-exports
pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_MQTT_PORT, DEFAULT_TCP_PORT, LORA_MAX_PAYLOAD, MAX_HOP_LIMIT,
    MESHTASTIC_MAGIC,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
