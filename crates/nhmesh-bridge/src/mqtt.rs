//! MQTT side of the bridge
//!
//! The broker connection is independent of the radio link: it reconnects
//! on its own backoff, keeps publishing queued packets once it is back,
//! and re-subscribes to the listen topic after every ConnAck.
//!
//! # Topics
//!
//! - Outbound: every packet is published as JSON to `<root>/<node id>`
//! - Inbound (optional): the listen topic carries send requests
//!   `{"text": "...", "to": "!1a2b3c4d"}`; an absent or empty `to`
//!   broadcasts. Requests are handled one at a time in arrival order. The
//!   listen topic may be a filter with `+` or `#` wildcards.

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet as MqttPacket, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::MqttConfig;
use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::interface::OutboundMessage;
use crate::node::NodeId;
use crate::packet::Packet;

/// Queue between the event loop and the inbound request handler
const INBOUND_QUEUE_SIZE: usize = 64;

/// Topic a node's packets are published on
pub fn topic_for(root: &str, node: &NodeId) -> String {
    format!("{}/{}", root.trim_end_matches('/'), node)
}

/// A request to transmit text over the radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Message body; required and non-empty
    pub text: String,
    /// Destination; absent or empty broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl SendRequest {
    /// Parse and validate a listen-topic payload
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let request: SendRequest = serde_json::from_slice(payload)
            .map_err(|e| BridgeError::InvalidSendRequest(e.to_string()))?;
        if request.text.is_empty() {
            return Err(BridgeError::InvalidSendRequest("text is empty".into()));
        }
        Ok(request)
    }

    /// Resolve the destination; `None` means broadcast
    pub fn destination(&self) -> Result<Option<NodeId>> {
        match self.to.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(to) => {
                let node: NodeId = to.parse()?;
                Ok((!node.is_broadcast()).then_some(node))
            }
        }
    }

    /// Radio message for this request
    pub fn to_message(&self) -> Result<OutboundMessage> {
        Ok(OutboundMessage::Text {
            text: self.text.clone(),
            to: self.destination()?,
        })
    }
}

/// Broker connection status
#[derive(Debug, Clone, Serialize)]
pub struct MqttStatus {
    /// Whether the broker session is up
    pub connected: bool,
    /// Broker address
    pub broker: String,
    /// Root topic
    pub root_topic: String,
    /// Packets handed to the client
    pub published: u64,
    /// Packets the client refused
    pub publish_errors: u64,
    /// Listen-topic subscriptions issued, one per broker session
    pub subscriptions: u64,
    /// Send requests forwarded to the radio
    pub requests_sent: u64,
    /// Send requests discarded as malformed or failed
    pub requests_rejected: u64,
}

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    published: AtomicU64,
    publish_errors: AtomicU64,
    subscriptions: AtomicU64,
    requests_sent: AtomicU64,
    requests_rejected: AtomicU64,
}

/// Read access to a running bridge
#[derive(Debug, Clone)]
pub struct MqttHandle {
    shared: Arc<Shared>,
    broker: String,
    root_topic: String,
}

impl MqttHandle {
    /// Whether the broker session is up
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Status snapshot
    pub fn status(&self) -> MqttStatus {
        MqttStatus {
            connected: self.is_connected(),
            broker: self.broker.clone(),
            root_topic: self.root_topic.clone(),
            published: self.shared.published.load(Ordering::Relaxed),
            publish_errors: self.shared.publish_errors.load(Ordering::Relaxed),
            subscriptions: self.shared.subscriptions.load(Ordering::Relaxed),
            requests_sent: self.shared.requests_sent.load(Ordering::Relaxed),
            requests_rejected: self.shared.requests_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Forwards listen-topic requests to the radio
pub struct InboundHandler {
    manager: Arc<ConnectionManager>,
    shared: Arc<Shared>,
}

impl InboundHandler {
    fn new(manager: Arc<ConnectionManager>, shared: Arc<Shared>) -> Self {
        Self { manager, shared }
    }

    /// Handle one listen-topic payload
    ///
    /// Malformed requests and radio failures are logged and counted,
    /// never propagated.
    pub async fn handle(&self, payload: &[u8]) {
        let message = match SendRequest::from_json(payload).and_then(|r| r.to_message()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Discarding send request");
                self.shared.requests_rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.manager.send(message).await {
            Ok(()) => {
                info!("Forwarded MQTT send request to radio");
                self.shared.requests_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_retriable() => {
                warn!(error = %e, code = e.error_code(), "Radio unavailable, dropping send request");
                self.shared.requests_rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Radio refused send request");
                self.shared.requests_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn run(self, mut requests: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
        loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                payload = requests.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            self.handle(&payload).await;
        }
        debug!("Inbound handler exiting");
    }
}

/// Owns the broker connection
pub struct MqttBridge {
    config: MqttConfig,
    shared: Arc<Shared>,
    manager: Option<Arc<ConnectionManager>>,
}

impl MqttBridge {
    /// Create a bridge; nothing connects until [`run`](Self::run)
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            manager: None,
        }
    }

    /// Forward listen-topic requests to `manager`
    ///
    /// Ignored unless a listen topic is configured.
    pub fn with_manager(mut self, manager: Arc<ConnectionManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Handle for status queries
    pub fn handle(&self) -> MqttHandle {
        MqttHandle {
            shared: Arc::clone(&self.shared),
            broker: format!("{}:{}", self.config.host, self.config.port),
            root_topic: self.config.root_topic.clone(),
        }
    }

    /// Handler for listen-topic payloads, when a radio is attached
    pub fn inbound_handler(&self) -> Option<InboundHandler> {
        self.manager
            .as_ref()
            .map(|manager| InboundHandler::new(Arc::clone(manager), Arc::clone(&self.shared)))
    }

    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }
        options
    }

    /// Publish `packets` until cancelled
    pub async fn run(self, mut packets: mpsc::Receiver<Packet>, cancel: CancellationToken) {
        let (client, mut eventloop) =
            AsyncClient::new(self.options(), self.config.queue_size.max(1));
        let backoff = ExponentialBackoff::new(
            self.config.reconnect_initial_delay,
            self.config.reconnect_max_delay,
        );

        let listen = match (&self.config.listen_topic, self.inbound_handler()) {
            (Some(topic), Some(handler)) => {
                let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
                tokio::spawn(handler.run(rx, cancel.clone()));
                Some((topic.clone(), tx))
            }
            (Some(topic), None) => {
                warn!(topic = %topic, "Listen topic set without a radio, not subscribing");
                None
            }
            _ => None,
        };

        info!(
            broker = %format!("{}:{}", self.config.host, self.config.port),
            root = %self.config.root_topic,
            "Starting MQTT bridge"
        );

        let mut failures: u32 = 0;
        let mut packets_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                packet = packets.recv(), if packets_open => match packet {
                    Some(packet) => self.publish(&client, &packet),
                    None => packets_open = false,
                },
                event = eventloop.poll() => match event {
                    Ok(event) => {
                        if self.on_event(event, &client, listen.as_ref()) {
                            failures = 0;
                        }
                    }
                    Err(e) => {
                        let delay = self.on_connection_error(&backoff, &mut failures);
                        warn!(error = %e, ?delay, attempt = failures, "MQTT connection error, retrying");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }

        self.shutdown(&client, &mut eventloop).await;
    }

    /// Serialize and queue one packet; failures are logged, not raised
    pub fn publish(&self, client: &AsyncClient, packet: &Packet) {
        let topic = topic_for(&self.config.root_topic, &packet.from_id);
        let payload = match serde_json::to_vec(packet) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, from = %packet.from_id, "Failed to serialize packet");
                self.shared.publish_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match client.try_publish(&topic, QoS::AtMostOnce, false, payload) {
            Ok(()) => {
                debug!(topic = %topic, "Published packet");
                self.shared.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let e = BridgeError::from(e);
                warn!(topic = %topic, error = %e, code = e.error_code(), "Failed to publish packet");
                self.shared.publish_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Mark the session down and return the delay before the next poll
    fn on_connection_error(&self, backoff: &ExponentialBackoff, failures: &mut u32) -> Duration {
        self.shared.connected.store(false, Ordering::Relaxed);
        let delay = backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Returns whether the event was a successful (re)connect
    fn on_event(
        &self,
        event: Event,
        client: &AsyncClient,
        listen: Option<&(String, mpsc::Sender<Bytes>)>,
    ) -> bool {
        match event {
            Event::Incoming(MqttPacket::ConnAck(ack)) => {
                info!(code = ?ack.code, "Connected to MQTT broker");
                self.shared.connected.store(true, Ordering::Relaxed);
                if let Some((topic, _)) = listen {
                    match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        Ok(()) => {
                            info!(topic = %topic, "Subscribed to listen topic");
                            self.shared.subscriptions.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            let e = BridgeError::from(e);
                            warn!(topic = %topic, error = %e, code = e.error_code(), "Failed to subscribe");
                        }
                    }
                }
                true
            }
            Event::Incoming(MqttPacket::Publish(publish)) => {
                if let Some((filter, tx)) = listen {
                    if rumqttc::matches(&publish.topic, filter) {
                        if let Err(e) = tx.try_send(publish.payload) {
                            warn!(error = %e, "Inbound request queue full, dropping request");
                            self.shared.requests_rejected.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                false
            }
            Event::Incoming(MqttPacket::Disconnect) => {
                warn!("Broker closed the session");
                self.shared.connected.store(false, Ordering::Relaxed);
                false
            }
            _ => false,
        }
    }

    async fn shutdown(&self, client: &AsyncClient, eventloop: &mut EventLoop) {
        if self.shared.connected.load(Ordering::Relaxed) {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "Disconnect request failed");
            } else {
                // Give the event loop a moment to flush the DISCONNECT
                let _ = tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await;
            }
        }
        self.shared.connected.store(false, Ordering::Relaxed);
        info!("MQTT bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::interface::{ConnectionState, MeshLink};
    use crate::test_utils::{wait_for_state, MockLink};

    #[test]
    fn test_topic_for() {
        let node = NodeId::new(0x1a2b3c4d);
        assert_eq!(topic_for("msh/US/NH/", &node), "msh/US/NH/!1a2b3c4d");
        assert_eq!(topic_for("msh/US/NH", &node), "msh/US/NH/!1a2b3c4d");
    }

    #[test]
    fn test_parse_send_request() {
        let req = SendRequest::from_json(br#"{"text":"hi","to":""}"#).unwrap();
        assert_eq!(req.destination().unwrap(), None);

        let req = SendRequest::from_json(br#"{"text":"hi"}"#).unwrap();
        assert_eq!(req.destination().unwrap(), None);

        let req = SendRequest::from_json(br#"{"text":"hi","to":"!1a2b3c4d"}"#).unwrap();
        assert_eq!(req.destination().unwrap(), Some(NodeId::new(0x1a2b3c4d)));
    }

    #[test]
    fn test_reject_bad_requests() {
        assert!(SendRequest::from_json(b"{bad json").is_err());
        assert!(SendRequest::from_json(br#"{"to":"!1a2b3c4d"}"#).is_err());
        assert!(SendRequest::from_json(br#"{"text":""}"#).is_err());

        let req = SendRequest::from_json(br#"{"text":"hi","to":"!zz"}"#).unwrap();
        assert!(matches!(
            req.destination(),
            Err(BridgeError::InvalidNodeId(_))
        ));

        // A decimal node number must not be read as hex
        let req = SendRequest::from_json(br#"{"text":"hi","to":"1234"}"#).unwrap();
        assert!(matches!(
            req.destination(),
            Err(BridgeError::InvalidNodeId(_))
        ));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let req = SendRequest::from_json(br#"{"text":"hi","channel":2}"#).unwrap();
        assert_eq!(req.text, "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_handler_order_and_recovery() {
        let link = Arc::new(MockLink::new());
        let (tx, _rx) = mpsc::channel(4);
        let dyn_link: Arc<dyn MeshLink> = link.clone();
        let manager = ConnectionManager::new(
            dyn_link,
            ReconnectConfig::default(),
            tx,
            CancellationToken::new(),
        );
        manager.start().unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        let shared = Arc::new(Shared::default());
        let handler = InboundHandler::new(manager, shared.clone());
        handler.handle(b"{bad json").await;
        handler.handle(br#"{"text":"hi","to":""}"#).await;
        handler.handle(br#"{"text":"hi","to":"!1a2b3c4d"}"#).await;

        assert_eq!(
            link.sent(),
            vec![
                OutboundMessage::Text {
                    text: "hi".into(),
                    to: None
                },
                OutboundMessage::Text {
                    text: "hi".into(),
                    to: Some(NodeId::new(0x1a2b3c4d))
                },
            ]
        );
        assert_eq!(shared.requests_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(shared.requests_sent.load(Ordering::Relaxed), 2);
    }

    fn connack() -> Event {
        Event::Incoming(MqttPacket::ConnAck(rumqttc::ConnAck::new(
            rumqttc::ConnectReturnCode::Success,
            false,
        )))
    }

    fn incoming(topic: &str, payload: &[u8]) -> Event {
        Event::Incoming(MqttPacket::Publish(rumqttc::Publish::new(
            topic,
            QoS::AtLeastOnce,
            payload.to_vec(),
        )))
    }

    fn client() -> (AsyncClient, EventLoop) {
        AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 1883), 8)
    }

    fn listen_bridge(filter: &str) -> MqttBridge {
        MqttBridge::new(MqttConfig {
            listen_topic: Some(filter.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_resubscribes_on_every_connack() {
        let bridge = listen_bridge("msh/US/NH/send");
        let (client, _eventloop) = client();
        let (tx, _rx) = mpsc::channel(4);
        let listen = ("msh/US/NH/send".to_string(), tx);

        assert!(bridge.on_event(connack(), &client, Some(&listen)));
        assert!(bridge.on_event(connack(), &client, Some(&listen)));
        let status = bridge.handle().status();
        assert!(status.connected);
        assert_eq!(status.subscriptions, 2);

        // Without a listen topic nothing is subscribed
        assert!(bridge.on_event(connack(), &client, None));
        assert_eq!(bridge.handle().status().subscriptions, 2);
    }

    #[tokio::test]
    async fn test_session_loss_clears_connected() {
        let bridge = MqttBridge::new(MqttConfig::default());
        let (client, _eventloop) = client();

        bridge.on_event(connack(), &client, None);
        assert!(bridge.handle().is_connected());
        assert!(!bridge.on_event(Event::Incoming(MqttPacket::Disconnect), &client, None));
        assert!(!bridge.handle().is_connected());

        bridge.on_event(connack(), &client, None);
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(120));
        let mut failures = 0;
        assert_eq!(bridge.on_connection_error(&backoff, &mut failures), Duration::from_secs(1));
        assert!(!bridge.handle().is_connected());
        assert_eq!(bridge.on_connection_error(&backoff, &mut failures), Duration::from_secs(2));
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_wildcard_listen_topic_routes_requests() {
        let bridge = listen_bridge("msh/US/NH/send/#");
        let (client, _eventloop) = client();
        let (tx, mut rx) = mpsc::channel(4);
        let listen = ("msh/US/NH/send/#".to_string(), tx);

        bridge.on_event(incoming("msh/US/NH/send/gw1", br#"{"text":"hi"}"#), &client, Some(&listen));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(br#"{"text":"hi"}"#));

        // Our own packet topics are not send requests
        bridge.on_event(incoming("msh/US/NH/!1a2b3c4d", b"{}"), &client, Some(&listen));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exact_listen_topic() {
        let bridge = listen_bridge("msh/US/NH/send");
        let (client, _eventloop) = client();
        let (tx, mut rx) = mpsc::channel(4);
        let listen = ("msh/US/NH/send".to_string(), tx);

        bridge.on_event(incoming("msh/US/NH/send/extra", b"{}"), &client, Some(&listen));
        assert!(rx.try_recv().is_err());
        bridge.on_event(incoming("msh/US/NH/send", b"{}"), &client, Some(&listen));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_inbound_queue_rejects_request() {
        let bridge = listen_bridge("msh/US/NH/send");
        let (client, _eventloop) = client();
        let (tx, _rx) = mpsc::channel(1);
        let listen = ("msh/US/NH/send".to_string(), tx);

        bridge.on_event(incoming("msh/US/NH/send", br#"{"text":"a"}"#), &client, Some(&listen));
        bridge.on_event(incoming("msh/US/NH/send", br#"{"text":"b"}"#), &client, Some(&listen));
        assert_eq!(bridge.handle().status().requests_rejected, 1);
    }

    #[tokio::test]
    async fn test_run_without_broker_stops_on_cancel() {
        let bridge = MqttBridge::new(MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        });
        let handle = bridge.handle();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let raw = crate::test_utils::sample_packet(0x1a2b3c4d, "queued");
        let packet = crate::pipeline::normalize(&raw, &crate::interface::LinkInfo::default()).unwrap();
        tx.send(packet).await.unwrap();
        let task = tokio::spawn(bridge.run(rx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let status = handle.status();
        assert!(!status.connected);
        assert_eq!(status.published, 1);
        assert_eq!(status.subscriptions, 0);
    }

    #[test]
    fn test_status_defaults() {
        let bridge = MqttBridge::new(MqttConfig::default());
        let status = bridge.handle().status();
        assert!(!status.connected);
        assert_eq!(status.broker, "mqtt.nhmesh.live:1883");
        assert_eq!(status.published, 0);
    }
}
