//! TCP link for Meshtastic devices
//!
//! Networked devices (WiFi/Ethernet) expose the same framed stream as the
//! serial port on TCP port 4403.
//!
//! # Requirements
//!
//! Enable the `tcp` feature in Cargo.toml to use this link.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::session::Session;
use super::{LinkEventSink, LinkInfo, MeshLink, OutboundMessage};
use crate::error::{BridgeError, Result};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP link to a networked Meshtastic device
pub struct TcpLink {
    host: String,
    port: u16,
    handshake_timeout: Duration,
    session: Mutex<Option<Arc<Session<TcpStream>>>>,
    name: String,
}

impl TcpLink {
    /// Create a new TCP link
    ///
    /// # Arguments
    ///
    /// * `host` - Device address (e.g., "192.168.1.100")
    /// * `port` - Device port, normally 4403
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let name = format!("tcp:{}:{}", host, port);
        Self {
            host,
            port,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session: Mutex::new(None),
            name,
        }
    }

    /// How long to wait for the device to report its local info
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl MeshLink for TcpLink {
    async fn connect(&self, sink: LinkEventSink) -> Result<LinkInfo> {
        // A leftover session belongs to an older generation
        self.disconnect().await;

        info!(link = %self.name, "Connecting to device");
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| BridgeError::ConnectFailed {
                link: self.name.clone(),
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(link = %self.name, error = %e, "Failed to set TCP_NODELAY");
        }

        let (session, info) =
            Session::open(self.name.clone(), stream, sink, self.handshake_timeout).await?;
        *self.session.lock() = Some(session);
        Ok(info)
    }

    async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
            info!(link = %self.name, "Disconnected from device");
        }
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let session = self
            .session
            .lock()
            .clone()
            .ok_or(BridgeError::Disconnected)?;
        session.send(message).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.session.lock().is_some())
            .finish()
    }
}
