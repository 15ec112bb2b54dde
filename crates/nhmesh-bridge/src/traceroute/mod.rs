//! Traceroute daemon
//!
//! Maps the mesh by tracing every node the gateway hears. Newly seen nodes
//! are traced first, nodes with a successful trace are refreshed every
//! `interval`, and failing nodes back off exponentially. At most one
//! traceroute is in flight, consecutive traceroutes are separated by the
//! cooldown, and nothing is sent unless the radio link is Connected.
//!
//! Per-node state survives restarts through an atomically replaced JSON
//! file. Persistence problems are logged; the daemon keeps running on its
//! in-memory state.

mod state;

pub use state::{load, save, SchedulePolicy, TracerouteSchedule, TracerouteTarget};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TracerouteConfig;
use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::interface::{ConnectionState, OutboundMessage};
use crate::node::NodeId;
use crate::packet::MeshtasticPort;

/// Queue depth for observations from the pipeline
pub const OBSERVATION_QUEUE_SIZE: usize = 256;

const COMMAND_QUEUE_SIZE: usize = 16;

/// A packet source reported by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Source node of the packet
    pub node: NodeId,
    /// Port the packet arrived on
    pub port: MeshtasticPort,
}

/// Daemon state for status reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct TracerouteSnapshot {
    /// Known nodes, ordered by node id
    pub targets: Vec<TracerouteTarget>,
    /// Node currently being traced
    pub in_flight: Option<NodeId>,
    /// Successful traceroutes since start
    pub completed: u64,
    /// Failed traceroutes since start
    pub failed: u64,
    /// Whether the last save of the state file succeeded
    pub persistence_ok: bool,
}

enum Command {
    Queue {
        node: NodeId,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to a running daemon
#[derive(Debug, Clone)]
pub struct TracerouteHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<TracerouteSnapshot>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Queue { node, .. } => f.debug_struct("Queue").field("node", node).finish(),
        }
    }
}

impl TracerouteHandle {
    /// Latest daemon state
    pub fn snapshot(&self) -> TracerouteSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Request a traceroute to `node` ahead of its schedule
    ///
    /// Returns false when the node is in failure backoff, already due or
    /// queued, or cannot be traced at all.
    pub async fn queue_traceroute(&self, node: NodeId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Queue { node, reply })
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }
}

/// Wall clock that follows tokio time
///
/// Schedule timestamps are wall-clock values, but elapsed time is measured
/// on the tokio clock so that paused-time tests see backoffs expire.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall + chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_default()
    }
}

enum Outcome {
    Replied,
    Failed(String),
    Cancelled,
}

/// Background traceroute scheduler
pub struct TracerouteDaemon {
    config: TracerouteConfig,
    manager: Arc<ConnectionManager>,
    schedule: TracerouteSchedule,
    observations: mpsc::Receiver<Observation>,
    commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<TracerouteSnapshot>,
    clock: Clock,
    last_finished: Option<Instant>,
    in_flight: Option<NodeId>,
    completed: u64,
    failed: u64,
    persistence_ok: bool,
}

impl TracerouteDaemon {
    /// Create a daemon sending through `manager`
    ///
    /// Returns the daemon, its handle, and the sender the pipeline reports
    /// observations to.
    pub fn new(
        config: TracerouteConfig,
        manager: Arc<ConnectionManager>,
    ) -> (Self, TracerouteHandle, mpsc::Sender<Observation>) {
        let (observe_tx, observations) = mpsc::channel(OBSERVATION_QUEUE_SIZE);
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (snapshot_tx, snapshot_rx) = watch::channel(TracerouteSnapshot {
            persistence_ok: true,
            ..Default::default()
        });

        let daemon = Self {
            schedule: TracerouteSchedule::new(SchedulePolicy::from_config(&config)),
            config,
            manager,
            observations,
            commands,
            snapshot_tx,
            clock: Clock::new(),
            last_finished: None,
            in_flight: None,
            completed: 0,
            failed: 0,
            persistence_ok: true,
        };
        let handle = TracerouteHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (daemon, handle, observe_tx)
    }

    /// Load persisted state, then schedule until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        self.restore().await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            targets = self.schedule.len(),
            cooldown_secs = self.config.cooldown.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Traceroute daemon started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.on_command(command).await,
                Some(observation) = self.observations.recv() => self.on_observation(observation).await,
                _ = ticker.tick() => {
                    if self.trace_next(&cancel).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.persist().await;
        debug!("Traceroute daemon exiting");
    }

    async fn restore(&mut self) {
        let path = &self.config.persistence_file;
        match state::load(path).await {
            Ok(targets) => {
                let policy = SchedulePolicy::from_config(&self.config);
                self.schedule = TracerouteSchedule::with_targets(policy, targets);
                info!(
                    path = %path.display(),
                    targets = self.schedule.len(),
                    "Loaded traceroute state"
                );
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Ignoring unreadable traceroute state");
            }
        }
        self.publish();
    }

    async fn persist(&mut self) {
        match state::save(&self.config.persistence_file, self.schedule.targets()).await {
            Ok(()) => self.persistence_ok = true,
            Err(e) => {
                if self.persistence_ok {
                    error!(error = %e, code = e.error_code(), "Failed to save traceroute state");
                } else {
                    debug!(error = %e, "Traceroute state still not saved");
                }
                self.persistence_ok = false;
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(TracerouteSnapshot {
            targets: self.schedule.targets().cloned().collect(),
            in_flight: self.in_flight,
            completed: self.completed,
            failed: self.failed,
            persistence_ok: self.persistence_ok,
        });
    }

    fn gateway(&self) -> Option<NodeId> {
        self.manager.link_info().gateway_id
    }

    fn traceable(&self, node: NodeId) -> bool {
        node.is_unicast() && Some(node) != self.gateway()
    }

    async fn on_observation(&mut self, observation: Observation) {
        if !self.traceable(observation.node) {
            return;
        }
        if self.schedule.observe(observation.node) {
            info!(node = %observation.node, "New node discovered");
            self.persist().await;
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Queue { node, reply } => {
                let accepted = if self.traceable(node) {
                    if self.schedule.observe(node) {
                        self.persist().await;
                    }
                    self.schedule.request(node, self.clock.now())
                } else {
                    false
                };
                debug!(%node, accepted, "Traceroute requested");
                let _ = reply.send(accepted);
            }
        }
    }

    fn cooling_down(&self) -> bool {
        self.last_finished
            .is_some_and(|at| at.elapsed() < self.config.cooldown)
    }

    /// Trace the next due node, if any and if allowed
    async fn trace_next(&mut self, cancel: &CancellationToken) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        if self.manager.state() != ConnectionState::Connected || self.cooling_down() {
            return ControlFlow::Continue(());
        }
        let Some(node) = self.schedule.next_due(self.clock.now(), self.gateway()) else {
            return ControlFlow::Continue(());
        };

        self.schedule.start(node);
        self.in_flight = Some(node);
        self.publish();
        info!(%node, hop_limit = self.config.hop_limit, "Sending traceroute");

        let outcome = self.trace(node, cancel).await;
        self.in_flight = None;
        self.last_finished = Some(Instant::now());
        let now = self.clock.now();

        match outcome {
            Outcome::Replied => {
                self.schedule.record_success(node, now);
                self.completed += 1;
                info!(%node, "Traceroute completed");
            }
            Outcome::Failed(reason) => {
                let target = self.schedule.record_failure(node, now);
                warn!(
                    %node,
                    reason = %reason,
                    retry_count = target.retry_count,
                    backoff_secs = target.current_backoff.as_secs(),
                    "Traceroute failed"
                );
                self.failed += 1;
            }
            Outcome::Cancelled => {
                self.publish();
                return ControlFlow::Break(());
            }
        }

        self.persist().await;
        ControlFlow::Continue(())
    }

    /// Send one traceroute and wait for the reply from `node`
    async fn trace(&mut self, node: NodeId, cancel: &CancellationToken) -> Outcome {
        let mut state_rx = self.manager.subscribe_state();
        let deadline = Instant::now() + self.config.send_timeout;

        let message = OutboundMessage::Traceroute {
            to: node,
            hop_limit: self.config.hop_limit,
        };
        if let Err(e) = self.manager.send(message).await {
            return Outcome::Failed(e.to_string());
        }
        if *state_rx.borrow_and_update() != ConnectionState::Connected {
            return Outcome::Failed("link left connected state".into());
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    return Outcome::Failed(format!(
                        "no reply within {}s",
                        self.config.send_timeout.as_secs()
                    ));
                }
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() != ConnectionState::Connected {
                        return Outcome::Failed("link left connected state".into());
                    }
                }
                Some(observation) = self.observations.recv() => {
                    let replied =
                        observation.node == node && observation.port == MeshtasticPort::Traceroute;
                    self.on_observation(observation).await;
                    if replied {
                        return Outcome::Replied;
                    }
                }
                Some(command) = self.commands.recv() => self.on_command(command).await,
            }
        }
    }
}
