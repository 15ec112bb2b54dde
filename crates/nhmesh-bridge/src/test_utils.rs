//! Test utilities
//!
//! [`MockLink`] stands in for a radio: connect results can be scripted,
//! events injected into the current session, and everything sent is
//! recorded. It answers heartbeats unless told to play dead, and answers
//! traceroute requests when asked to, so the whole bridge can be driven
//! without hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! let link = Arc::new(MockLink::new());
//! link.fail_connects(2);
//! let manager = ConnectionManager::new(link.clone(), config, packets_tx, cancel);
//! manager.start()?;
//! wait_for_state(&manager, ConnectionState::Connected).await;
//! assert_eq!(link.connect_count(), 3);
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::interface::{ConnectionState, LinkEventSink, LinkInfo, MeshLink, OutboundMessage};
use crate::node::NodeId;
use crate::packet::{MeshtasticPort, RawPacket};

#[derive(Default)]
struct MockState {
    info: LinkInfo,
    fail_connects: usize,
    hang_next_connect: bool,
    drop_during_connect: Option<String>,
    answer_traceroutes: bool,
    ignore_heartbeats: bool,
    heartbeats: usize,
    unreachable: HashSet<NodeId>,
    send_failures: VecDeque<BridgeError>,
    sink: Option<LinkEventSink>,
    connect_times: Vec<Instant>,
    disconnects: usize,
    sent: Vec<OutboundMessage>,
    traceroute_times: Vec<Instant>,
}

enum ConnectPlan {
    Fail,
    Hang,
    Succeed(LinkInfo, Option<String>),
}

/// Scriptable in-memory radio link
pub struct MockLink {
    name: String,
    state: Mutex<MockState>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Create a link that connects successfully with empty local info
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Local info reported on every successful connect
    pub fn with_info(self, info: LinkInfo) -> Self {
        self.state.lock().info = info;
        self
    }

    /// Fail the next `count` connect attempts
    pub fn fail_connects(&self, count: usize) {
        self.state.lock().fail_connects = count;
    }

    /// Make the next connect attempt never complete
    pub fn hang_next_connect(&self) {
        self.state.lock().hang_next_connect = true;
    }

    /// Report an errored disconnect while the next connect is in progress
    pub fn disconnect_during_connect(&self, reason: &str) {
        self.state.lock().drop_during_connect = Some(reason.to_string());
    }

    /// Answer traceroute requests with a reply from the target
    pub fn answer_traceroutes(&self, answer: bool) {
        self.state.lock().answer_traceroutes = answer;
    }

    /// Stop answering heartbeats, like a device that hung
    pub fn ignore_heartbeats(&self, ignore: bool) {
        self.state.lock().ignore_heartbeats = ignore;
    }

    /// Never answer traceroutes to `node`
    pub fn set_unreachable(&self, node: NodeId) {
        self.state.lock().unreachable.insert(node);
    }

    /// Fail the next send with `error`
    pub fn fail_next_send(&self, error: BridgeError) {
        self.state.lock().send_failures.push_back(error);
    }

    /// Number of connect attempts so far
    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_times.len()
    }

    /// When each connect attempt started
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }

    /// Number of disconnect calls so far
    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    /// Heartbeats sent successfully
    pub fn heartbeat_count(&self) -> usize {
        self.state.lock().heartbeats
    }

    /// Messages other than heartbeats sent successfully
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state.lock().sent.clone()
    }

    /// Traceroute destinations, in order
    pub fn traceroutes(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Traceroute { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    /// When each traceroute was sent
    pub fn traceroute_times(&self) -> Vec<Instant> {
        self.state.lock().traceroute_times.clone()
    }

    /// Sink of the open session
    pub fn current_sink(&self) -> Option<LinkEventSink> {
        self.state.lock().sink.clone()
    }

    /// Deliver a packet on the open session
    pub async fn inject_packet(&self, packet: RawPacket) {
        if let Some(sink) = self.current_sink() {
            sink.packet(packet).await;
        }
    }

    /// End the open session
    pub async fn inject_disconnect(&self, error: Option<&str>) {
        if let Some(sink) = self.current_sink() {
            sink.disconnected(error.map(str::to_string)).await;
        }
    }
}

#[async_trait]
impl MeshLink for MockLink {
    async fn connect(&self, sink: LinkEventSink) -> Result<LinkInfo> {
        let plan = {
            let mut state = self.state.lock();
            state.connect_times.push(Instant::now());
            if state.hang_next_connect {
                state.hang_next_connect = false;
                ConnectPlan::Hang
            } else if state.fail_connects > 0 {
                state.fail_connects -= 1;
                ConnectPlan::Fail
            } else {
                state.sink = Some(sink.clone());
                ConnectPlan::Succeed(state.info.clone(), state.drop_during_connect.take())
            }
        };

        match plan {
            ConnectPlan::Fail => Err(BridgeError::ConnectFailed {
                link: self.name.clone(),
                reason: "scripted failure".into(),
            }),
            ConnectPlan::Hang => std::future::pending().await,
            ConnectPlan::Succeed(info, drop_reason) => {
                if let Some(reason) = drop_reason {
                    sink.disconnected(Some(reason)).await;
                    // Let the event reach the manager before connect returns
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(info)
            }
        }
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.sink = None;
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let reply = {
            let mut state = self.state.lock();
            if state.sink.is_none() {
                return Err(BridgeError::Disconnected);
            }
            if let Some(error) = state.send_failures.pop_front() {
                return Err(error);
            }
            if *message == OutboundMessage::Heartbeat {
                state.heartbeats += 1;
                let sink = state.sink.clone().filter(|_| !state.ignore_heartbeats);
                drop(state);
                if let Some(sink) = sink {
                    tokio::spawn(async move { sink.heartbeat().await });
                }
                return Ok(());
            }
            state.sent.push(message.clone());
            if matches!(message, OutboundMessage::Traceroute { .. }) {
                state.traceroute_times.push(Instant::now());
            }

            match message {
                OutboundMessage::Traceroute { to, .. }
                    if state.answer_traceroutes && !state.unreachable.contains(to) =>
                {
                    let gateway = state.info.gateway_id.map(|g| g.num()).unwrap_or(0);
                    state
                        .sink
                        .clone()
                        .map(|sink| (sink, traceroute_reply(*to, gateway)))
                }
                _ => None,
            }
        };

        if let Some((sink, packet)) = reply {
            tokio::spawn(async move { sink.packet(packet).await });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A text packet from `from` to broadcast
pub fn sample_packet(from: u32, text: &str) -> RawPacket {
    RawPacket {
        from,
        to: 0xFFFF_FFFF,
        packet_id: rand::random(),
        channel: 0,
        port_num: MeshtasticPort::TextMessage,
        payload: Bytes::copy_from_slice(text.as_bytes()),
        hop_limit: 3,
        want_ack: false,
        rx_time: None,
    }
}

/// A traceroute response from `from`
pub fn traceroute_reply(from: NodeId, to: u32) -> RawPacket {
    RawPacket {
        from: from.num(),
        to,
        packet_id: rand::random(),
        channel: 0,
        port_num: MeshtasticPort::Traceroute,
        payload: Bytes::new(),
        hop_limit: 3,
        want_ack: false,
        rx_time: None,
    }
}

/// Wait until the manager reaches `state`
///
/// Panics after an hour of (usually paused) tokio time.
pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut rx = manager.subscribe_state();
    tokio::time::timeout(Duration::from_secs(3600), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .unwrap_or_else(|_| panic!("state channel closed waiting for {}", state));
}
