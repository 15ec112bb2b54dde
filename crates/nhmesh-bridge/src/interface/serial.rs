//! Serial port link for Meshtastic devices
//!
//! This module provides async serial communication with Meshtastic devices
//! using tokio-serial. Framing and the handshake are shared with the TCP
//! link.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream};
use tracing::{debug, info};

use super::session::Session;
use super::{LinkEventSink, LinkInfo, MeshLink, OutboundMessage};
use crate::config::DEFAULT_BAUD_RATE;
use crate::error::{BridgeError, Result};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// USB vendor ids of bridges used on Meshtastic boards
/// (Silicon Labs CP210x, FTDI, Espressif native USB, WCH CH34x)
const KNOWN_USB_VIDS: [u16; 4] = [0x10C4, 0x0403, 0x303A, 0x1A86];

/// Find the first serial port that looks like a Meshtastic device
pub fn find_meshtastic_port() -> Option<PathBuf> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!(error = %e, "Cannot enumerate serial ports");
            return None;
        }
    };

    ports.into_iter().find(is_likely_meshtastic).map(|port| {
        info!(port = %port.port_name, "Found likely Meshtastic device");
        PathBuf::from(port.port_name)
    })
}

fn is_likely_meshtastic(port: &SerialPortInfo) -> bool {
    let SerialPortType::UsbPort(usb) = &port.port_type else {
        return false;
    };
    if KNOWN_USB_VIDS.contains(&usb.vid) {
        debug!(vid = usb.vid, pid = usb.pid, "USB vendor match");
        return true;
    }
    usb.product.as_deref().is_some_and(|product| {
        let product = product.to_lowercase();
        ["meshtastic", "t-beam", "t-echo", "lora"]
            .iter()
            .any(|needle| product.contains(needle))
    })
}

/// Serial link to a USB-attached Meshtastic device
pub struct SerialLink {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    handshake_timeout: Duration,

    /// Open session (when connected)
    session: Mutex<Option<Arc<Session<SerialStream>>>>,

    /// Link name for logging
    name: String,
}

impl SerialLink {
    /// Create a new serial link
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session: Mutex::new(None),
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// How long to wait for the device to report its local info
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }
}

#[async_trait]
impl MeshLink for SerialLink {
    async fn connect(&self, sink: LinkEventSink) -> Result<LinkInfo> {
        self.disconnect().await;

        info!(port = %self.port_path.display(), baud = self.baud_rate, "Connecting to serial port");

        if !self.port_path.exists() {
            return Err(BridgeError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .open_native_async()
            .map_err(|e| BridgeError::ConnectFailed {
                link: self.name.clone(),
                reason: e.to_string(),
            })?;

        let (session, info) =
            Session::open(self.name.clone(), stream, sink, self.handshake_timeout).await?;
        *self.session.lock() = Some(session);
        Ok(info)
    }

    async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
            info!(port = %self.port_path.display(), "Disconnected from serial port");
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

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("connected", &self.session.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::TaggedEvent;
    use tokio::sync::mpsc;

    #[test]
    fn test_link_name() {
        let link = SerialLink::new("/dev/ttyUSB0");
        assert_eq!(link.name(), "serial:/dev/ttyUSB0");
        assert_eq!(link.port_path(), Path::new("/dev/ttyUSB0"));
    }

    #[test]
    fn test_vendor_match() {
        let usb = |vid, product: Option<&str>| SerialPortInfo {
            port_name: "/dev/ttyUSB0".into(),
            port_type: SerialPortType::UsbPort(tokio_serial::UsbPortInfo {
                vid,
                pid: 0xEA60,
                serial_number: None,
                manufacturer: None,
                product: product.map(str::to_string),
            }),
        };
        assert!(is_likely_meshtastic(&usb(0x10C4, None)));
        assert!(is_likely_meshtastic(&usb(0x1234, Some("Heltec LoRa 32"))));
        assert!(!is_likely_meshtastic(&usb(0x1234, Some("Keyboard"))));
        assert!(!is_likely_meshtastic(&SerialPortInfo {
            port_name: "/dev/ttyS0".into(),
            port_type: SerialPortType::Unknown,
        }));
    }

    #[tokio::test]
    async fn test_missing_port() {
        let link = SerialLink::new("/dev/does-not-exist-nhmesh");
        let (tx, _rx) = mpsc::channel::<TaggedEvent>(1);
        let err = link.connect(LinkEventSink::new(1, tx)).await.unwrap_err();
        assert!(matches!(err, BridgeError::PortNotFound(_)));
    }
}
