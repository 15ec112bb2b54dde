//! Error types for the radio/MQTT bridge
//!
//! Every error maps onto one of four handling classes (see [`ErrorKind`]):
//! transport failures are retried through backoff, protocol failures drop
//! the single offending item, configuration failures halt startup, and
//! persistence failures degrade the traceroute daemon to in-memory state.

use thiserror::Error;

use crate::interface::ConnectionState;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Link/Interface Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Opening the link failed
    #[error("Failed to open link {link}: {reason}")]
    ConnectFailed {
        /// Link name (address or port path)
        link: String,
        /// Failure reason
        reason: String,
    },

    /// Link read error
    #[error("Link read error: {0}")]
    ReadError(String),

    /// Link write error
    #[error("Link write error: {0}")]
    WriteError(String),

    /// Link disconnected
    #[error("Link disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Protocol Errors =====
    /// Invalid packet format
    #[error("Invalid packet format: {0}")]
    InvalidPacket(String),

    /// Invalid node ID format
    #[error("Invalid node ID format: {0}")]
    InvalidNodeId(String),

    /// Inbound send request could not be decoded
    #[error("Invalid send request: {0}")]
    InvalidSendRequest(String),

    /// Message too large for LoRa
    #[error("Message too large: {size} bytes exceeds LoRa maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual message size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Send Errors =====
    /// Send attempted while the link is not connected
    #[error("Not connected (state: {state})")]
    NotConnected {
        /// State the manager was in when the send was rejected
        state: ConnectionState,
    },

    /// Send reached the link but failed
    #[error("Send failed: {0}")]
    SendFailed(#[source] Box<BridgeError>),

    // ===== MQTT Errors =====
    /// MQTT client request failed
    #[error("MQTT client error: {0}")]
    Mqtt(String),

    // ===== Persistence Errors =====
    /// Traceroute state could not be read or written
    #[error("Persistence error for {path}: {reason}")]
    Persistence {
        /// File path
        path: String,
        /// Failure reason
        reason: String,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== General Errors =====
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handling class of a [`BridgeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect/send failures, recovered through backoff
    Transport,
    /// Malformed packet or message, recovered by dropping the item
    Protocol,
    /// Fatal at startup, never retried
    Configuration,
    /// Traceroute file problems, logged and otherwise ignored
    Persistence,
    /// Lifecycle and plumbing errors
    Internal,
}

impl BridgeError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::PortNotFound(_)
            | BridgeError::ConnectFailed { .. }
            | BridgeError::ReadError(_)
            | BridgeError::WriteError(_)
            | BridgeError::Disconnected
            | BridgeError::Timeout { .. }
            | BridgeError::NotConnected { .. }
            | BridgeError::Mqtt(_)
            | BridgeError::Io(_) => ErrorKind::Transport,
            BridgeError::SendFailed(inner) => inner.kind(),
            BridgeError::InvalidPacket(_)
            | BridgeError::InvalidNodeId(_)
            | BridgeError::InvalidSendRequest(_)
            | BridgeError::MessageTooLarge { .. } => ErrorKind::Protocol,
            BridgeError::InvalidConfig(_) | BridgeError::MissingConfig(_) => {
                ErrorKind::Configuration
            }
            BridgeError::Persistence { .. } => ErrorKind::Persistence,
            BridgeError::Internal(_) | BridgeError::ChannelClosed => ErrorKind::Internal,
        }
    }

    /// Check if this error is a link-level failure that warrants a reconnect
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::Disconnected
                | BridgeError::Timeout { .. }
                | BridgeError::Io(_)
        )
    }

    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::ConnectFailed { .. } => "CONNECT_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::Timeout { .. } => "TIMEOUT",
            BridgeError::InvalidPacket(_) => "INVALID_PACKET",
            BridgeError::InvalidNodeId(_) => "INVALID_NODE_ID",
            BridgeError::InvalidSendRequest(_) => "INVALID_SEND_REQUEST",
            BridgeError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            BridgeError::NotConnected { .. } => "NOT_CONNECTED",
            BridgeError::SendFailed(_) => "SEND_FAILED",
            BridgeError::Mqtt(_) => "MQTT_ERROR",
            BridgeError::Persistence { .. } => "PERSISTENCE_ERROR",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::MissingConfig(_) => "MISSING_CONFIG",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }

    pub(crate) fn persistence(path: &std::path::Path, reason: impl ToString) -> Self {
        BridgeError::Persistence {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for BridgeError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            tokio_serial::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::ConnectFailed {
                link: String::new(),
                reason: err.description,
            },
        }
    }
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        BridgeError::Mqtt(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = BridgeError::PortNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
    }

    #[test]
    fn test_taxonomy() {
        assert_eq!(BridgeError::Disconnected.kind(), ErrorKind::Transport);
        assert_eq!(
            BridgeError::InvalidSendRequest("x".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            BridgeError::MissingConfig("mqtt.host".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            BridgeError::Persistence {
                path: "/tmp/x".into(),
                reason: "denied".into()
            }
            .kind(),
            ErrorKind::Persistence
        );
    }

    #[test]
    fn test_send_failed_inherits_kind() {
        let err = BridgeError::SendFailed(Box::new(BridgeError::WriteError("broken pipe".into())));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn test_retriable_follows_kind() {
        assert!(BridgeError::NotConnected {
            state: ConnectionState::Reconnecting
        }
        .is_retriable());
        assert!(!BridgeError::InvalidSendRequest("x".into()).is_retriable());
        assert!(!BridgeError::MessageTooLarge { size: 300, max: 237 }.is_retriable());
    }

    #[test]
    fn test_client_error_is_mqtt() {
        let (client, eventloop) =
            rumqttc::AsyncClient::new(rumqttc::MqttOptions::new("test", "127.0.0.1", 1883), 1);
        drop(eventloop);
        let err = BridgeError::from(
            client
                .try_publish("msh/US/NH/x", rumqttc::QoS::AtMostOnce, false, vec![1])
                .unwrap_err(),
        );
        assert_eq!(err.error_code(), "MQTT_ERROR");
        assert!(err.is_retriable());
    }

    #[test]
    fn test_is_transport() {
        assert!(BridgeError::Disconnected.is_transport());
        assert!(BridgeError::Timeout { duration_ms: 5000 }.is_transport());
        assert!(!BridgeError::MessageTooLarge { size: 300, max: 237 }.is_transport());
        assert!(!BridgeError::NotConnected {
            state: ConnectionState::Reconnecting
        }
        .is_transport());
    }
}
