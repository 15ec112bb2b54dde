//! Periodic staleness check for the radio link
//!
//! A TCP session to a device can stay open while the device has stopped
//! delivering anything. On every tick the monitor sends the device a
//! heartbeat; a reply counts as proof of life just like a packet does. When
//! a connected link has been silent for longer than the packet timeout the
//! monitor asks the manager to reconnect.

use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::connection::ConnectionManager;
use crate::interface::{ConnectionState, OutboundMessage};

/// Staleness watchdog
pub struct HealthMonitor {
    manager: Arc<ConnectionManager>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Create a monitor for `manager`
    pub fn new(manager: Arc<ConnectionManager>, config: HealthConfig) -> Self {
        Self { manager, config }
    }

    /// Run one check; returns whether a reconnect was requested
    pub fn check(&self) -> bool {
        let Some(silence) = self.manager.silence() else {
            return false;
        };
        if silence <= self.config.packet_timeout {
            debug!(silence_secs = silence.as_secs(), "Link healthy");
            return false;
        }

        warn!(
            silence_secs = silence.as_secs(),
            timeout_secs = self.config.packet_timeout.as_secs(),
            "Device silent past timeout, link looks stale"
        );
        self.manager.trigger_reconnect("packet timeout")
    }

    /// Ask the device for a heartbeat reply
    ///
    /// A failed write is handled by the manager like any other send
    /// failure.
    pub async fn probe(&self) {
        if !self.manager.is_connected() {
            return;
        }
        if let Err(e) = self.manager.send(OutboundMessage::Heartbeat).await {
            debug!(error = %e, code = e.error_code(), "Heartbeat not sent");
        }
    }

    /// Check every `interval` until cancelled or the manager shuts down
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() fires immediately; the first check is one period in
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.manager.state() == ConnectionState::ShuttingDown {
                break;
            }
            if !self.check() {
                self.probe().await;
            }
        }
        debug!("Health monitor exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::interface::MeshLink;
    use crate::test_utils::{sample_packet, wait_for_state, MockLink};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<MockLink>, Arc<ConnectionManager>, mpsc::Receiver<crate::packet::RawPacket>) {
        let link = Arc::new(MockLink::new());
        let (tx, rx) = mpsc::channel(16);
        let dyn_link: Arc<dyn MeshLink> = link.clone();
        let manager = ConnectionManager::new(
            dyn_link,
            ReconnectConfig::default(),
            tx,
            CancellationToken::new(),
        );
        (link, manager, rx)
    }

    fn config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(30),
            packet_timeout: Duration::from_secs(120),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_action_when_disconnected() {
        let (_link, manager, _rx) = setup();
        let monitor = HealthMonitor::new(manager.clone(), config());
        assert!(!monitor.check());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_packets_keep_link() {
        let (link, manager, mut rx) = setup();
        manager.start().unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        let monitor = HealthMonitor::new(manager.clone(), config());
        tokio::time::sleep(Duration::from_secs(100)).await;
        link.inject_packet(sample_packet(0x10, "still here")).await;
        rx.recv().await.unwrap();
        manager.record_packet();

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(!monitor.check());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_quiet_link() {
        let (link, manager, _rx) = setup();
        manager.start().unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        let cancel = CancellationToken::new();
        tokio::spawn(HealthMonitor::new(manager.clone(), config()).run(cancel.clone()));

        // No packets at all for well past the timeout
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(link.connect_count(), 1);
        assert!(link.heartbeat_count() >= 19);
        assert!(manager.silence().unwrap() <= Duration::from_secs(30));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_heartbeats_go_stale() {
        let (link, manager, _rx) = setup();
        link.ignore_heartbeats(true);
        manager.start().unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        let cancel = CancellationToken::new();
        tokio::spawn(HealthMonitor::new(manager.clone(), config()).run(cancel.clone()));

        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        assert!(link.heartbeat_count() >= 4);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_link_triggers_reconnect() {
        let (link, manager, _rx) = setup();
        link.ignore_heartbeats(true);
        manager.start().unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        let cancel = CancellationToken::new();
        tokio::spawn(HealthMonitor::new(manager.clone(), config()).run(cancel.clone()));

        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(link.connect_count(), 2);
        cancel.cancel();
    }
}
