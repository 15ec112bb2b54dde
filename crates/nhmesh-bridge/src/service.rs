//! Bridge service - wires the components together
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          BridgeService                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌───────────┐   RawPacket   ┌──────────┐   Packet   ┌─────────┐ │
//! │  │ Connection│──────────────►│ Packet   │───────────►│  MQTT   │ │
//! │  │ Manager   │               │ Pipeline │            │ Bridge  │ │
//! │  └───────────┘               └──────────┘            └─────────┘ │
//! │     ▲    ▲                        │ Observation           │      │
//! │     │    │   ┌─────────────┐      ▼                       │      │
//! │     │    └───│ Traceroute  │◄─────┘                       │      │
//! │     │        │ Daemon      │           send requests      │      │
//! │     │        └─────────────┘◄─────────────────────────────┘      │
//! │  ┌──┴──────────┐                                                 │
//! │  │ Health      │                                                 │
//! │  │ Monitor     │                                                 │
//! │  └─────────────┘                                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every component runs as its own task. The connection manager is the
//! only owner of the radio link; everything else reaches the radio through
//! [`ConnectionManager::send`].

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::connection::{ConnectionManager, ConnectionStats, HealthStatus};
use crate::error::{BridgeError, Result};
use crate::health::HealthMonitor;
use crate::interface::{self, ConnectionState, MeshLink};
use crate::mqtt::{MqttBridge, MqttHandle, MqttStatus};
use crate::node::NodeId;
use crate::pipeline::{PacketPipeline, PipelineHandle, PipelineStats};
use crate::traceroute::{TracerouteDaemon, TracerouteHandle, TracerouteSnapshot};

/// Queue between the connection manager and the pipeline
const RAW_QUEUE_SIZE: usize = 256;

/// How long `stop` waits for tasks to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Combined status of a running bridge
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    /// Radio link statistics
    pub connection: ConnectionStats,
    /// Radio link staleness
    pub health: HealthStatus,
    /// Pipeline counters
    pub pipeline: PipelineStats,
    /// Broker connection
    pub mqtt: MqttStatus,
    /// Traceroute daemon state, when enabled
    pub traceroute: Option<TracerouteSnapshot>,
}

/// Entry point for running the bridge
pub struct BridgeService;

impl BridgeService {
    /// Validate `config`, build the radio link it describes and start
    pub fn start(config: BridgeConfig) -> Result<BridgeHandle> {
        config.validate()?;
        let link = interface::from_config(&config.link)?;
        Self::start_with_link(config, link)
    }

    /// Start over an existing link
    pub fn start_with_link(config: BridgeConfig, link: Arc<dyn MeshLink>) -> Result<BridgeHandle> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_SIZE);
        let (publish_tx, publish_rx) = mpsc::channel(config.mqtt.queue_size.max(1));

        let manager = ConnectionManager::new(
            link,
            config.reconnect.clone(),
            raw_tx,
            cancel.child_token(),
        );

        let mut tasks = Vec::new();
        let mut pipeline = PacketPipeline::new(Arc::clone(&manager), publish_tx);

        let traceroute = if config.traceroute.enabled {
            let (daemon, handle, observe_tx) =
                TracerouteDaemon::new(config.traceroute.clone(), Arc::clone(&manager));
            pipeline = pipeline.with_observer(observe_tx);
            tasks.push(tokio::spawn(daemon.run(cancel.child_token())));
            Some(handle)
        } else {
            info!("Traceroute daemon disabled");
            None
        };

        let pipeline_handle = pipeline.handle();
        tasks.push(tokio::spawn(pipeline.run(raw_rx, cancel.child_token())));

        let mqtt = MqttBridge::new(config.mqtt.clone()).with_manager(Arc::clone(&manager));
        let mqtt_handle = mqtt.handle();
        tasks.push(tokio::spawn(mqtt.run(publish_rx, cancel.child_token())));

        let monitor = HealthMonitor::new(Arc::clone(&manager), config.health.clone());
        tasks.push(tokio::spawn(monitor.run(cancel.child_token())));

        manager.start()?;

        info!(
            link = %config.link.describe(),
            broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
            root_topic = %config.mqtt.root_topic,
            "Bridge started"
        );

        Ok(BridgeHandle {
            manager,
            pipeline: pipeline_handle,
            mqtt: mqtt_handle,
            traceroute,
            packet_timeout: config.health.packet_timeout,
            cancel,
            tasks,
        })
    }
}

/// Handle to a running bridge
pub struct BridgeHandle {
    manager: Arc<ConnectionManager>,
    pipeline: PipelineHandle,
    mqtt: MqttHandle,
    traceroute: Option<TracerouteHandle>,
    packet_timeout: Duration,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    #[cfg(test)]
    pub(crate) fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Watch radio link state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    /// Radio link statistics
    pub fn stats(&self) -> ConnectionStats {
        self.manager.stats()
    }

    /// Radio link staleness
    pub fn health_status(&self) -> HealthStatus {
        self.manager.health_status(self.packet_timeout)
    }

    /// Pipeline counters
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Broker connection status
    pub fn mqtt_status(&self) -> MqttStatus {
        self.mqtt.status()
    }

    /// Traceroute daemon state, when enabled
    pub fn traceroute_snapshot(&self) -> Option<TracerouteSnapshot> {
        self.traceroute.as_ref().map(TracerouteHandle::snapshot)
    }

    /// Everything above in one value
    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            connection: self.stats(),
            health: self.health_status(),
            pipeline: self.pipeline_stats(),
            mqtt: self.mqtt_status(),
            traceroute: self.traceroute_snapshot(),
        }
    }

    /// Ask for a traceroute to `node` ahead of its schedule
    pub async fn queue_traceroute(&self, node: NodeId) -> Result<bool> {
        match &self.traceroute {
            Some(handle) => handle.queue_traceroute(node).await,
            None => Err(BridgeError::InvalidConfig("traceroute daemon is disabled".into())),
        }
    }

    /// Shut everything down and wait for the tasks to finish
    pub async fn stop(self) {
        info!("Stopping bridge");
        self.manager.stop().await;
        self.cancel.cancel();

        let all = futures::future::join_all(self.tasks);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, all).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Bridge task ended abnormally");
                    }
                }
            }
            Err(_) => warn!("Timed out waiting for bridge tasks"),
        }
        info!("Bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfigBuilder;
    use crate::test_utils::{wait_for_state, MockLink};

    fn config(dir: &std::path::Path) -> BridgeConfig {
        BridgeConfigBuilder::new()
            .tcp("127.0.0.1", 4403)
            .broker("127.0.0.1", 1)
            .persistence_file(dir.join("state.json"))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_fatal() {
        let link: Arc<dyn MeshLink> = Arc::new(MockLink::new());
        let result = BridgeService::start_with_link(BridgeConfig::default(), link);
        assert!(matches!(result, Err(BridgeError::MissingConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let link = Arc::new(MockLink::new());
        let dyn_link: Arc<dyn MeshLink> = link.clone();
        let handle = BridgeService::start_with_link(config(dir.path()), dyn_link).unwrap();

        wait_for_state(handle.manager(), ConnectionState::Connected).await;
        let status = handle.status();
        assert!(status.connection.connected);
        assert!(status.traceroute.is_some());

        let manager = Arc::clone(handle.manager());
        handle.stop().await;
        assert_eq!(manager.state(), ConnectionState::ShuttingDown);
        assert!(link.disconnect_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_traceroute() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.traceroute.enabled = false;
        let link: Arc<dyn MeshLink> = Arc::new(MockLink::new());
        let handle = BridgeService::start_with_link(config, link).unwrap();

        let mut state = handle.subscribe_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert!(handle.traceroute_snapshot().is_none());
        assert!(handle.queue_traceroute(NodeId::new(0x42)).await.is_err());
        handle.stop().await;
    }
}
