//! Radio link implementations
//!
//! A [`MeshLink`] is the device side of the bridge. It opens a session,
//! reports the gateway's local info once the handshake completes, and then
//! pushes every received packet and the eventual disconnect into the
//! [`LinkEventSink`] it was given. Sinks are stamped with the connection
//! generation so the owner can discard events from sessions it has
//! already replaced.
//!
//! - [`tcp::TcpLink`] - TCP connection (requires `tcp` feature)
//! - [`serial::SerialLink`] - Serial port communication (requires `serial` feature)
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

pub(crate) mod codec;
mod session;

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::{find_meshtastic_port, SerialLink};

#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "tcp")]
pub use tcp::TcpLink;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::error::{BridgeError, Result};
use crate::node::NodeId;
use crate::packet::{ModemPreset, RawPacket};

/// Trait for radio links
///
/// Implementations must be safe to call from several tasks at once:
/// `send` can race with `disconnect`, and the owner never holds a lock
/// across any of these calls.
#[async_trait]
pub trait MeshLink: Send + Sync {
    /// Open a session and run the device handshake
    ///
    /// Events for the new session go to `sink` until it ends. A handshake
    /// that gets no reply is not an error; the returned info is then empty.
    async fn connect(&self, sink: LinkEventSink) -> Result<LinkInfo>;

    /// Tear down the current session, if any
    ///
    /// Must not emit a disconnect event for the session it closes.
    async fn disconnect(&self);

    /// Transmit one message over the current session
    async fn send(&self, message: &OutboundMessage) -> Result<()>;

    /// Get the link name (for logging)
    fn name(&self) -> &str;
}

/// Build the link described by the configuration
pub fn from_config(config: &LinkConfig) -> Result<Arc<dyn MeshLink>> {
    match config {
        #[cfg(feature = "tcp")]
        LinkConfig::Tcp { host, port } => Ok(Arc::new(TcpLink::new(host.clone(), *port))),
        #[cfg(feature = "serial")]
        LinkConfig::Serial { port, baud_rate } => {
            Ok(Arc::new(SerialLink::new(port).with_baud_rate(*baud_rate)))
        }
        #[allow(unreachable_patterns)]
        other => Err(BridgeError::InvalidConfig(format!(
            "link {} is not supported by this build",
            other.describe()
        ))),
    }
}

/// Connection state of the radio link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected, no attempt scheduled
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection lost, waiting out the backoff delay
    Reconnecting,
    /// Terminal; entered on stop
    ShuttingDown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// What the gateway radio reported about itself during the handshake
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkInfo {
    /// The gateway's own node id
    pub gateway_id: Option<NodeId>,
    /// Configured modem preset
    pub modem_preset: Option<ModemPreset>,
    /// Configured LoRa channel number
    pub lora_channel: Option<u32>,
    /// Channel index to channel name
    pub channel_names: BTreeMap<u8, String>,
}

/// Something to transmit over the radio
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Text message; `to: None` broadcasts
    Text {
        /// Message body
        text: String,
        /// Destination node
        to: Option<NodeId>,
    },
    /// Route discovery request
    Traceroute {
        /// Node to trace
        to: NodeId,
        /// Hop limit for the request
        hop_limit: u8,
    },
    /// Ask the device to report its local info, proving it is alive
    Heartbeat,
}

/// Events a link reports for a session
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A packet arrived
    Packet(RawPacket),
    /// The device answered a heartbeat
    Heartbeat,
    /// The session ended; `error` is `None` when the link gave no reason
    Disconnected {
        /// Error reported by the link
        error: Option<String>,
    },
}

/// A [`LinkEvent`] with the generation of the session that produced it
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    /// Session generation
    pub generation: u64,
    /// The event
    pub event: LinkEvent,
}

/// Where a link delivers the events of one session
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    generation: u64,
    tx: mpsc::Sender<TaggedEvent>,
}

impl LinkEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::Sender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the session this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a received packet
    pub async fn packet(&self, packet: RawPacket) {
        self.emit(LinkEvent::Packet(packet)).await;
    }

    /// Report a heartbeat reply
    pub async fn heartbeat(&self) {
        self.emit(LinkEvent::Heartbeat).await;
    }

    /// Report the end of the session
    pub async fn disconnected(&self, error: Option<String>) {
        self.emit(LinkEvent::Disconnected { error }).await;
    }

    /// Whether the receiving side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn emit(&self, event: LinkEvent) {
        let tagged = TaggedEvent {
            generation: self.generation,
            event,
        };
        // Receiver gone means the manager stopped
        let _ = self.tx.send(tagged).await;
    }
}
