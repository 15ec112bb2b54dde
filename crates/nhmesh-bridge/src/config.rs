//! Configuration types for the bridge
//!
//! This module provides configuration structures for the radio link,
//! reconnection policy, health monitoring, the MQTT broker connection and
//! the traceroute daemon. Every section has defaults matching the
//! production deployment; [`BridgeConfig::validate`] rejects combinations
//! that cannot work before any connection is attempted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Maximum payload size for Meshtastic LoRa packets
pub const LORA_MAX_PAYLOAD: usize = 237;

/// Meshtastic stream protocol magic number (first 2 bytes of a frame)
pub const MESHTASTIC_MAGIC: u16 = 0x94C3;

/// Default baud rate for Meshtastic serial devices
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default TCP port exposed by networked Meshtastic devices
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Maximum allowed hops in Meshtastic protocol
pub const MAX_HOP_LIMIT: u8 = 7;

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Radio link (serial or TCP)
    #[serde(default)]
    pub link: LinkConfig,

    /// Radio reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Staleness monitoring
    #[serde(default)]
    pub health: HealthConfig,

    /// MQTT broker settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Traceroute daemon settings
    #[serde(default)]
    pub traceroute: TracerouteConfig,
}

impl BridgeConfig {
    /// Check that the configuration can be used to start the bridge
    ///
    /// Failures here are configuration errors: fatal, never retried.
    pub fn validate(&self) -> Result<()> {
        match &self.link {
            LinkConfig::Tcp { host, .. } if host.trim().is_empty() => {
                return Err(BridgeError::MissingConfig("link.host (NODE_IP)".into()));
            }
            LinkConfig::Serial { port, .. } if port.as_os_str().is_empty() => {
                return Err(BridgeError::MissingConfig(
                    "link.port (SERIAL_PORT)".into(),
                ));
            }
            _ => {}
        }

        if self.mqtt.host.trim().is_empty() {
            return Err(BridgeError::MissingConfig("mqtt.host (MQTT_ENDPOINT)".into()));
        }
        if self.mqtt.root_topic.trim_matches('/').is_empty() {
            return Err(BridgeError::MissingConfig("mqtt.root_topic (MQTT_TOPIC)".into()));
        }
        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            return Err(BridgeError::InvalidConfig(
                "MQTT username and password must be provided together".into(),
            ));
        }
        if matches!(&self.mqtt.listen_topic, Some(t) if t.trim().is_empty()) {
            return Err(BridgeError::InvalidConfig("mqtt.listen_topic is empty".into()));
        }

        if self.reconnect.initial_delay.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "reconnect.initial_delay must be non-zero".into(),
            ));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(BridgeError::InvalidConfig(
                "reconnect.max_delay is shorter than reconnect.initial_delay".into(),
            ));
        }
        if self.health.interval.is_zero() {
            return Err(BridgeError::InvalidConfig("health.interval must be non-zero".into()));
        }

        let tr = &self.traceroute;
        if tr.retry_base.is_zero() || tr.poll_interval.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "traceroute.retry_base and traceroute.poll_interval must be non-zero".into(),
            ));
        }
        if tr.max_backoff < tr.retry_base {
            return Err(BridgeError::InvalidConfig(
                "traceroute.max_backoff is shorter than traceroute.retry_base".into(),
            ));
        }
        if tr.hop_limit == 0 || tr.hop_limit > MAX_HOP_LIMIT {
            return Err(BridgeError::InvalidConfig(format!(
                "traceroute.hop_limit must be within 1..={}",
                MAX_HOP_LIMIT
            )));
        }

        Ok(())
    }
}

/// Link type for connecting to the radio
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LinkConfig {
    /// TCP connection (devices with WiFi/Ethernet)
    Tcp {
        /// Host address
        host: String,
        /// Port number
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    /// Serial port connection
    Serial {
        /// Path to serial port (e.g., /dev/ttyUSB0, COM3)
        port: PathBuf,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::Tcp {
            host: String::new(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

impl LinkConfig {
    /// Human-readable link name for logging
    pub fn describe(&self) -> String {
        match self {
            LinkConfig::Tcp { host, port } => format!("tcp:{}:{}", host, port),
            LinkConfig::Serial { port, .. } => format!("serial:{}", port.display()),
        }
    }
}

/// Radio reconnection behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry; doubles on every failure
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on the retry delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Error-free disconnects this soon after connecting are ignored
    #[serde(with = "humantime_serde", default = "default_grace_window")]
    pub disconnect_grace: Duration,

    /// Bound on a single connect attempt (including the device handshake)
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Bound on a single send
    #[serde(with = "humantime_serde", default = "default_send_timeout")]
    pub send_timeout: Duration,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_grace_window() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            disconnect_grace: default_grace_window(),
            connect_timeout: default_connect_timeout(),
            send_timeout: default_send_timeout(),
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often the monitor checks the link
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub interval: Duration,

    /// A connected link with no packets for this long is considered half-open
    #[serde(with = "humantime_serde", default = "default_packet_timeout")]
    pub packet_timeout: Duration,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_packet_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            packet_timeout: default_packet_timeout(),
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Username (requires `password`)
    #[serde(default)]
    pub username: Option<String>,

    /// Password (requires `username`)
    #[serde(default)]
    pub password: Option<String>,

    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Root topic; packets go to `<root>/<node id>`
    #[serde(default = "default_root_topic")]
    pub root_topic: String,

    /// Topic carrying JSON send requests for the radio (disabled when unset)
    #[serde(default)]
    pub listen_topic: Option<String>,

    /// MQTT keep-alive
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// Delay before the first broker reconnect; doubles on every failure
    #[serde(with = "humantime_serde", default = "default_mqtt_initial_delay")]
    pub reconnect_initial_delay: Duration,

    /// Upper bound on the broker reconnect delay
    #[serde(with = "humantime_serde", default = "default_mqtt_max_delay")]
    pub reconnect_max_delay: Duration,

    /// Outbound packet queue between pipeline and broker client
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_mqtt_host() -> String {
    "mqtt.nhmesh.live".to_string()
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_client_id() -> String {
    format!("nhmesh-producer-{:08x}", rand::random::<u32>())
}

fn default_root_topic() -> String {
    "msh/US/NH/".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_mqtt_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_mqtt_max_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_queue_size() -> usize {
    256
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            client_id: default_client_id(),
            root_topic: default_root_topic(),
            listen_topic: None,
            keep_alive: default_keep_alive(),
            reconnect_initial_delay: default_mqtt_initial_delay(),
            reconnect_max_delay: default_mqtt_max_delay(),
            queue_size: default_queue_size(),
        }
    }
}

/// Traceroute daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteConfig {
    /// Run the daemon at all
    #[serde(default = "default_traceroute_enabled")]
    pub enabled: bool,

    /// Minimum gap between the end of one traceroute and the start of the next
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,

    /// Refresh period for nodes with a successful traceroute
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    /// Consecutive failures before a node is only retried at `max_backoff`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential failure backoff
    #[serde(with = "humantime_serde", default = "default_retry_base")]
    pub retry_base: Duration,

    /// Upper bound on the failure backoff
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Hop limit for traceroute requests
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,

    /// Bound on a single traceroute send
    #[serde(with = "humantime_serde", default = "default_traceroute_timeout")]
    pub send_timeout: Duration,

    /// How often the daemon looks for due work
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// File holding per-node retry/backoff state
    #[serde(default = "default_persistence_file")]
    pub persistence_file: PathBuf,
}

fn default_traceroute_enabled() -> bool {
    true
}

fn default_cooldown() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_interval() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base() -> Duration {
    Duration::from_secs(60)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_hop_limit() -> u8 {
    MAX_HOP_LIMIT
}

fn default_traceroute_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_persistence_file() -> PathBuf {
    PathBuf::from("/tmp/traceroute_state.json")
}

impl Default for TracerouteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: default_cooldown(),
            interval: default_interval(),
            max_retries: default_max_retries(),
            retry_base: default_retry_base(),
            max_backoff: default_max_backoff(),
            hop_limit: MAX_HOP_LIMIT,
            send_timeout: default_traceroute_timeout(),
            poll_interval: default_poll_interval(),
            persistence_file: default_persistence_file(),
        }
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the radio over TCP
    pub fn tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.link = LinkConfig::Tcp {
            host: host.into(),
            port,
        };
        self
    }

    /// Connect to the radio over a serial port
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.link = LinkConfig::Serial {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        };
        self
    }

    /// Set the radio reconnect backoff bounds
    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.reconnect.initial_delay = initial;
        self.config.reconnect.max_delay = max;
        self
    }

    /// Set the spurious-disconnect grace window
    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.reconnect.disconnect_grace = grace;
        self
    }

    /// Set the health check cadence and packet staleness threshold
    pub fn health(mut self, interval: Duration, packet_timeout: Duration) -> Self {
        self.config.health.interval = interval;
        self.config.health.packet_timeout = packet_timeout;
        self
    }

    /// Set the MQTT broker address
    pub fn broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.mqtt.host = host.into();
        self.config.mqtt.port = port;
        self
    }

    /// Set MQTT credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.mqtt.username = Some(username.into());
        self.config.mqtt.password = Some(password.into());
        self
    }

    /// Set the MQTT root topic
    pub fn root_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.mqtt.root_topic = topic.into();
        self
    }

    /// Enable the inbound send path on the given topic
    pub fn listen_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.mqtt.listen_topic = Some(topic.into());
        self
    }

    /// Set traceroute cooldown and refresh interval
    pub fn traceroute_timing(mut self, cooldown: Duration, interval: Duration) -> Self {
        self.config.traceroute.cooldown = cooldown;
        self.config.traceroute.interval = interval;
        self
    }

    /// Set traceroute failure backoff parameters
    pub fn traceroute_backoff(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.config.traceroute.max_retries = max_retries;
        self.config.traceroute.retry_base = base;
        self.config.traceroute.max_backoff = max;
        self
    }

    /// Set the traceroute persistence file
    pub fn persistence_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.traceroute.persistence_file = path.into();
        self
    }

    /// Enable or disable the traceroute daemon
    pub fn traceroute_enabled(mut self, enabled: bool) -> Self {
        self.config.traceroute.enabled = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> BridgeConfig {
        BridgeConfigBuilder::new()
            .tcp("192.168.1.50", DEFAULT_TCP_PORT)
            .build()
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(config.traceroute.cooldown, Duration::from_secs(180));
        assert_eq!(config.traceroute.interval, Duration::from_secs(43200));
        assert_eq!(config.traceroute.max_retries, 3);
        assert_eq!(config.traceroute.max_backoff, Duration::from_secs(86400));
        assert_eq!(config.mqtt.root_topic, "msh/US/NH/");
        assert!(config.mqtt.listen_topic.is_none());
    }

    #[test]
    fn test_default_link_requires_address() {
        let err = BridgeConfig::default().validate().unwrap_err();
        assert!(matches!(err, BridgeError::MissingConfig(_)));
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_username_without_password_rejected() {
        let mut config = valid();
        config.mqtt.username = Some("user".into());
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_broker_rejected() {
        let config = BridgeConfigBuilder::new()
            .tcp("10.0.0.2", 4403)
            .broker("", 1883)
            .build();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_hop_limit_bounds() {
        let mut config = valid();
        config.traceroute.hop_limit = MAX_HOP_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_humantime_durations_from_json() {
        let json = r#"{
            "link": {"type": "serial", "port": "/dev/ttyACM0"},
            "traceroute": {"cooldown": "30s", "max_backoff": "1h"}
        }"#;
        let config: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.traceroute.cooldown, Duration::from_secs(30));
        assert_eq!(config.traceroute.max_backoff, Duration::from_secs(3600));
        assert_eq!(config.traceroute.max_retries, 3);
        match config.link {
            LinkConfig::Serial { baud_rate, .. } => assert_eq!(baud_rate, DEFAULT_BAUD_RATE),
            other => panic!("unexpected link {:?}", other),
        }
    }

    #[test]
    fn test_link_describe() {
        assert_eq!(valid().link.describe(), "tcp:192.168.1.50:4403");
    }
}
