//! Radio link lifecycle
//!
//! [`ConnectionManager`] owns the link and its state machine:
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──ok──▶ Connected
//!                            ▲   │              │
//!                    backoff │   │ fail         │ disconnect / send failure / stale
//!                            │   ▼              ▼
//!                          Reconnecting ◀───────┘
//!
//! any ──stop──▶ ShuttingDown
//! ```
//!
//! All state lives behind one `parking_lot` mutex that is never held across
//! an await. Connect attempts run on a single worker task, so at most one is
//! in flight; every attempt gets a new generation number and link events
//! carrying an older generation are discarded.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::ReconnectConfig;
use crate::error::{BridgeError, Result};
use crate::interface::{
    ConnectionState, LinkEvent, LinkEventSink, LinkInfo, MeshLink, OutboundMessage, TaggedEvent,
};
use crate::packet::RawPacket;

/// Capacity of the link event channel
const EVENT_CHANNEL_SIZE: usize = 256;

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Reconnecting)
            | (Connected, Reconnecting)
            | (Reconnecting, Connecting) => true,
            _ => false,
        }
    }
}

/// Snapshot of link statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    /// Current state
    pub state: ConnectionState,
    /// Whether the link is usable right now
    pub connected: bool,
    /// When the last successful connect completed
    pub last_connection_time: Option<DateTime<Utc>>,
    /// When the last packet was received
    pub last_packet_time: Option<DateTime<Utc>>,
    /// When the device last answered a heartbeat
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Failed connects and sends since the last successful connect
    pub error_count: u64,
    /// Failed connect attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Generation of the current or most recent connection attempt
    pub generation: u64,
}

/// Link health as seen from outside
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Current state
    pub state: ConnectionState,
    /// Seconds since the last packet or heartbeat, or since connecting
    pub seconds_since_last_packet: Option<u64>,
    /// Whether the silence exceeds the packet timeout
    pub packet_timeout_expired: bool,
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    link_info: LinkInfo,
    connected_at: Option<Instant>,
    last_packet_at: Option<Instant>,
    last_heartbeat_at: Option<Instant>,
    last_connection_time: Option<DateTime<Utc>>,
    last_packet_time: Option<DateTime<Utc>>,
    last_heartbeat_time: Option<DateTime<Utc>>,
    error_count: u64,
    reconnect_attempts: u32,
    pending_delay: Option<Duration>,
    early_failure: Option<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            link_info: LinkInfo::default(),
            connected_at: None,
            last_packet_at: None,
            last_heartbeat_at: None,
            last_connection_time: None,
            last_packet_time: None,
            last_heartbeat_time: None,
            error_count: 0,
            reconnect_attempts: 0,
            pending_delay: None,
            early_failure: None,
        }
    }
}

enum AttemptOutcome {
    Connected,
    Retry,
    Stopped,
}

/// Owns the radio link and keeps it connected
pub struct ConnectionManager {
    link: Arc<dyn MeshLink>,
    config: ReconnectConfig,
    backoff: ExponentialBackoff,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<TaggedEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TaggedEvent>>>,
    packets_tx: mpsc::Sender<RawPacket>,
    wake: Notify,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager; packets received while connected go to `packets`
    pub fn new(
        link: Arc<dyn MeshLink>,
        config: ReconnectConfig,
        packets: mpsc::Sender<RawPacket>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = ExponentialBackoff::new(config.initial_delay, config.max_delay);

        Arc::new(Self {
            link,
            config,
            backoff,
            inner: Mutex::new(Inner::new()),
            state_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            packets_tx: packets,
            wake: Notify::new(),
            cancel,
        })
    }

    /// Spawn the connect worker and event dispatcher and begin connecting
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| BridgeError::Internal("connection manager already started".into()))?;

        info!(link = %self.link.name(), "Starting connection manager");
        tokio::spawn(Arc::clone(self).run_dispatcher(events_rx));
        tokio::spawn(Arc::clone(self).run_worker());
        self.wake.notify_one();
        Ok(())
    }

    /// Enter ShuttingDown, cancel the workers and close the link
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::ShuttingDown {
                return;
            }
            self.transition(&mut inner, ConnectionState::ShuttingDown);
            inner.connected_at = None;
        }
        self.cancel.cancel();
        self.link.disconnect().await;
        info!(link = %self.link.name(), "Connection manager stopped");
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether the link is connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Info reported by the gateway on the current connection
    pub fn link_info(&self) -> LinkInfo {
        self.inner.lock().link_info.clone()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.lock();
        ConnectionStats {
            state: inner.state,
            connected: inner.state == ConnectionState::Connected,
            last_connection_time: inner.last_connection_time,
            last_packet_time: inner.last_packet_time,
            last_heartbeat_time: inner.last_heartbeat_time,
            error_count: inner.error_count,
            reconnect_attempts: inner.reconnect_attempts,
            generation: inner.generation,
        }
    }

    /// Time since the device was last heard from, while connected
    ///
    /// Measured from the later of the last packet and the last heartbeat
    /// reply, or from the connect if neither arrived yet.
    pub fn silence(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != ConnectionState::Connected {
            return None;
        }
        inner
            .last_packet_at
            .max(inner.last_heartbeat_at)
            .or(inner.connected_at)
            .map(|since| since.elapsed())
    }

    /// Health report against a packet timeout
    pub fn health_status(&self, packet_timeout: Duration) -> HealthStatus {
        let silence = self.silence();
        HealthStatus {
            state: self.state(),
            seconds_since_last_packet: silence.map(|d| d.as_secs()),
            packet_timeout_expired: silence.is_some_and(|d| d > packet_timeout),
        }
    }

    /// Note that a packet was received
    pub fn record_packet(&self) {
        let mut inner = self.inner.lock();
        inner.last_packet_at = Some(Instant::now());
        inner.last_packet_time = Some(Utc::now());
    }

    fn record_heartbeat(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != ConnectionState::Connected {
            debug!(generation, "Dropping heartbeat from stale session");
            return;
        }
        inner.last_heartbeat_at = Some(Instant::now());
        inner.last_heartbeat_time = Some(Utc::now());
    }

    /// Drop the current connection and reconnect after the backoff delay
    ///
    /// Only acts from Connected; returns whether a reconnect was scheduled.
    pub fn trigger_reconnect(&self, reason: &str) -> bool {
        let generation = self.inner.lock().generation;
        self.reconnect_generation(generation, reason)
    }

    /// Transmit a message over the link
    ///
    /// Fails with `NotConnected` unless Connected. A transport failure
    /// counts as an error, schedules a reconnect and is returned as
    /// `SendFailed`.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        let generation = {
            let inner = self.inner.lock();
            if inner.state != ConnectionState::Connected {
                return Err(BridgeError::NotConnected { state: inner.state });
            }
            inner.generation
        };

        let result = match tokio::time::timeout(self.config.send_timeout, self.link.send(&message))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                duration_ms: self.config.send_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => {
                debug!(?message, "Sent to radio");
                Ok(())
            }
            Err(e) if e.is_transport() => {
                warn!(error = %e, code = e.error_code(), "Send failed");
                self.inner.lock().error_count += 1;
                self.reconnect_generation(generation, "send failed");
                Err(BridgeError::SendFailed(Box::new(e)))
            }
            Err(e) => Err(e),
        }
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) -> bool {
        if !inner.state.can_transition_to(next) {
            error!(from = %inner.state, to = %next, "Rejected invalid state transition");
            return false;
        }
        debug!(from = %inner.state, to = %next, "State transition");
        inner.state = next;
        self.state_tx.send_replace(next);
        true
    }

    /// Move to Reconnecting and arm the retry delay
    ///
    /// Only a failed connect counts as an attempt, so the delay after N
    /// consecutive failures is `backoff.delay(N - 1)`.
    fn schedule_retry(&self, inner: &mut Inner, connect_failed: bool) -> Duration {
        self.transition(inner, ConnectionState::Reconnecting);
        let delay = self.backoff.delay(inner.reconnect_attempts);
        if connect_failed {
            inner.reconnect_attempts = inner.reconnect_attempts.saturating_add(1);
        }
        inner.pending_delay = Some(delay);
        inner.connected_at = None;
        delay
    }

    fn reconnect_generation(&self, generation: u64, reason: &str) -> bool {
        let (delay, attempt) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connected {
                debug!(reason, state = %inner.state, "Reconnect not needed");
                return false;
            }
            let delay = self.schedule_retry(&mut inner, false);
            (delay, inner.reconnect_attempts)
        };

        warn!(reason, ?delay, attempt, "Link lost, reconnecting");
        self.wake.notify_one();
        true
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
            }

            loop {
                let delay = self.inner.lock().pending_delay.take();
                if let Some(delay) = delay {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                match self.attempt().await {
                    AttemptOutcome::Retry => continue,
                    AttemptOutcome::Connected | AttemptOutcome::Stopped => break,
                }
            }
        }
        debug!("Connect worker exiting");
    }

    async fn attempt(&self) -> AttemptOutcome {
        fn may_connect(state: ConnectionState) -> bool {
            matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::Reconnecting
            )
        }

        if !may_connect(self.state()) {
            return AttemptOutcome::Stopped;
        }
        // Leftovers of the previous session must not outlive it
        self.link.disconnect().await;

        let sink = {
            let mut inner = self.inner.lock();
            if !may_connect(inner.state) {
                return AttemptOutcome::Stopped;
            }
            inner.generation += 1;
            inner.early_failure = None;
            self.transition(&mut inner, ConnectionState::Connecting);
            LinkEventSink::new(inner.generation, self.events_tx.clone())
        };
        let generation = sink.generation();
        info!(link = %self.link.name(), generation, "Connecting");

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return AttemptOutcome::Stopped,
            result = tokio::time::timeout(self.config.connect_timeout, self.link.connect(sink)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(BridgeError::Timeout {
                        duration_ms: self.config.connect_timeout.as_millis() as u64,
                    }),
                }
            }
        };

        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Connecting || inner.generation != generation {
            return AttemptOutcome::Stopped;
        }

        let result = match (result, inner.early_failure.take()) {
            (Ok(_), Some(reason)) => Err(BridgeError::ConnectFailed {
                link: self.link.name().to_string(),
                reason: format!("link dropped during connect: {}", reason),
            }),
            (result, _) => result,
        };

        match result {
            Ok(info) => {
                self.transition(&mut inner, ConnectionState::Connected);
                inner.connected_at = Some(Instant::now());
                inner.last_packet_at = None;
                inner.last_heartbeat_at = None;
                inner.last_connection_time = Some(Utc::now());
                inner.reconnect_attempts = 0;
                inner.error_count = 0;
                info!(
                    link = %self.link.name(),
                    generation,
                    gateway = ?info.gateway_id,
                    "Connected"
                );
                inner.link_info = info;
                AttemptOutcome::Connected
            }
            Err(e) => {
                inner.error_count += 1;
                let delay = self.schedule_retry(&mut inner, true);
                warn!(
                    link = %self.link.name(),
                    error = %e,
                    code = e.error_code(),
                    ?delay,
                    attempt = inner.reconnect_attempts,
                    "Connect failed, retrying"
                );
                AttemptOutcome::Retry
            }
        }
    }

    async fn run_dispatcher(self: Arc<Self>, mut events: mpsc::Receiver<TaggedEvent>) {
        loop {
            let tagged = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                tagged = events.recv() => match tagged {
                    Some(tagged) => tagged,
                    None => break,
                },
            };

            match tagged.event {
                LinkEvent::Packet(packet) => {
                    if !self.accepts_packet(tagged.generation) {
                        continue;
                    }
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        sent = self.packets_tx.send(packet) => {
                            if sent.is_err() {
                                debug!("Packet consumer gone");
                            }
                        }
                    }
                }
                LinkEvent::Heartbeat => self.record_heartbeat(tagged.generation),
                LinkEvent::Disconnected { error } => {
                    self.on_disconnect(tagged.generation, error);
                }
            }
        }
        debug!("Event dispatcher exiting");
    }

    fn accepts_packet(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        if inner.generation != generation {
            debug!(generation, current = inner.generation, "Dropping packet from stale session");
            return false;
        }
        if inner.state != ConnectionState::Connected {
            debug!(state = %inner.state, "Dropping packet received while not connected");
            return false;
        }
        true
    }

    fn on_disconnect(&self, generation: u64, error: Option<String>) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                info!(
                    generation,
                    current = inner.generation,
                    "Ignoring disconnect from stale session"
                );
                return;
            }

            match inner.state {
                ConnectionState::Connecting => {
                    if let Some(reason) = error {
                        inner.early_failure = Some(reason);
                    }
                    return;
                }
                ConnectionState::Connected => {
                    let within_grace = inner
                        .connected_at
                        .is_some_and(|at| at.elapsed() < self.config.disconnect_grace);
                    if error.is_none() && within_grace {
                        info!(generation, "Ignoring spurious disconnect right after connecting");
                        return;
                    }
                }
                _ => return,
            }
        }

        let reason = error.unwrap_or_else(|| "link reported disconnect".to_string());
        self.reconnect_generation(generation, &reason);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("link", &self.link.name())
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .finish()
    }
}
