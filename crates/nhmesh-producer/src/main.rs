//! nhmesh producer - Meshtastic gateway to MQTT
//!
//! Connects to a Meshtastic radio over TCP or serial, publishes every
//! received packet to `<topic>/<node id>` on the broker, relays send
//! requests from the listen topic to the radio, and traceroutes the nodes
//! it hears.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nhmesh_bridge::{BridgeConfig, BridgeConfigBuilder, BridgeHandle, BridgeService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConnectionType {
    Tcp,
    Serial,
}

#[derive(Parser, Debug)]
#[command(name = "nhmesh-producer")]
#[command(about = "Bridge a Meshtastic radio to an MQTT broker", version)]
struct Args {
    /// MQTT broker address
    #[arg(long, env = "MQTT_ENDPOINT", default_value = "mqtt.nhmesh.live")]
    broker: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Root topic
    #[arg(long, env = "MQTT_TOPIC", default_value = "msh/US/NH/")]
    topic: String,

    /// MQTT username
    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Topic to receive JSON send requests on
    #[arg(long, env = "MQTT_LISTEN_TOPIC")]
    listen_topic: Option<String>,

    /// How to reach the radio
    #[arg(long, env = "CONNECTION_TYPE", value_enum, default_value = "tcp")]
    connection_type: ConnectionType,

    /// Radio IP address (tcp)
    #[arg(long, env = "NODE_IP")]
    node_ip: Option<String>,

    /// Radio TCP port
    #[arg(long, env = "NODE_PORT", default_value_t = nhmesh_bridge::DEFAULT_TCP_PORT)]
    node_port: u16,

    /// Serial device (serial; autodetected when omitted)
    #[arg(long, env = "SERIAL_PORT")]
    serial_port: Option<PathBuf>,

    /// Seconds of radio silence before the link is considered stale
    #[arg(long, env = "PACKET_TIMEOUT", default_value_t = 600)]
    packet_timeout: u64,

    /// Disable the traceroute daemon
    #[arg(long, env = "TRACEROUTE_DISABLED")]
    no_traceroute: bool,

    /// Seconds between traceroutes
    #[arg(long, env = "TRACEROUTE_COOLDOWN", default_value_t = 180)]
    traceroute_cooldown: u64,

    /// Seconds between periodic traceroutes of a node
    #[arg(long, env = "TRACEROUTE_INTERVAL", default_value_t = 43200)]
    traceroute_interval: u64,

    /// Failures before a node is only retried at the maximum backoff
    #[arg(long, env = "TRACEROUTE_MAX_RETRIES", default_value_t = 3)]
    traceroute_max_retries: u32,

    /// Maximum backoff in seconds for failing nodes
    #[arg(long, env = "TRACEROUTE_MAX_BACKOFF", default_value_t = 86400)]
    traceroute_max_backoff: u64,

    /// Seconds to wait for a traceroute reply
    #[arg(long, env = "TRACEROUTE_SEND_TIMEOUT", default_value_t = 30)]
    traceroute_send_timeout: u64,

    /// File for persisting traceroute retry/backoff state
    #[arg(
        long,
        env = "TRACEROUTE_PERSISTENCE_FILE",
        default_value = "/tmp/traceroute_state.json"
    )]
    traceroute_persistence_file: PathBuf,

    /// Seconds between status log lines (0 disables)
    #[arg(long, env = "STATUS_INTERVAL", default_value_t = 300)]
    status_interval: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<BridgeConfig> {
        let mut builder = BridgeConfigBuilder::new()
            .broker(self.broker, self.port)
            .root_topic(self.topic)
            .health(Duration::from_secs(30), Duration::from_secs(self.packet_timeout))
            .traceroute_enabled(!self.no_traceroute)
            .traceroute_timing(
                Duration::from_secs(self.traceroute_cooldown),
                Duration::from_secs(self.traceroute_interval),
            )
            .traceroute_backoff(
                self.traceroute_max_retries,
                Duration::from_secs(60),
                Duration::from_secs(self.traceroute_max_backoff),
            )
            .persistence_file(self.traceroute_persistence_file);

        builder = match self.connection_type {
            ConnectionType::Tcp => {
                let host = self
                    .node_ip
                    .context("NODE_IP is required for tcp connections")?;
                builder.tcp(host, self.node_port)
            }
            ConnectionType::Serial => builder.serial_port(serial_port(self.serial_port)?),
        };

        if let Some(topic) = self.listen_topic {
            builder = builder.listen_topic(topic);
        }
        match (self.username, self.password) {
            (Some(user), Some(pass)) => builder = builder.credentials(user, pass),
            (None, None) => {}
            _ => anyhow::bail!("MQTT_USERNAME and MQTT_PASSWORD must be set together"),
        }

        let mut config = builder.build();
        config.traceroute.send_timeout = Duration::from_secs(self.traceroute_send_timeout);
        Ok(config)
    }
}

#[cfg(feature = "serial")]
fn serial_port(configured: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match configured {
        Some(port) => Ok(port),
        None => nhmesh_bridge::find_meshtastic_port()
            .context("no SERIAL_PORT given and no Meshtastic device detected"),
    }
}

#[cfg(not(feature = "serial"))]
fn serial_port(_configured: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    anyhow::bail!("serial connections need a build with the `serial` feature")
}

fn init_logging(verbose: bool, level: &str) {
    let fallback = if verbose { "debug" } else { level };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn log_status(bridge: &BridgeHandle) {
    let status = bridge.status();
    let (targets, traced, failed) = status
        .traceroute
        .map(|t| (t.targets.len(), t.completed, t.failed))
        .unwrap_or_default();

    info!(
        state = %status.connection.state,
        errors = status.connection.error_count,
        silence_secs = ?status.health.seconds_since_last_packet,
        forwarded = status.pipeline.forwarded,
        dropped = status.pipeline.invalid + status.pipeline.queue_dropped,
        mqtt_connected = status.mqtt.connected,
        published = status.mqtt.published,
        traceroute_targets = targets,
        traceroutes_ok = traced,
        traceroutes_failed = failed,
        "Bridge status"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, &args.log_level);

    let status_interval = args.status_interval;
    let config = args.into_config()?;
    info!(
        version = nhmesh_bridge::VERSION,
        link = %config.link.describe(),
        "Starting nhmesh producer"
    );

    let bridge = BridgeService::start(config).context("invalid configuration")?;

    if status_interval > 0 {
        let mut ticker = tokio::time::interval(Duration::from_secs(status_interval));
        ticker.tick().await;
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => log_status(&bridge),
            }
        }
    } else {
        shutdown_signal().await;
    }

    bridge.stop().await;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nhmesh_bridge::LinkConfig;

    #[test]
    fn test_tcp_args() {
        let args = Args::parse_from([
            "nhmesh-producer",
            "--node-ip",
            "192.168.1.50",
            "--listen-topic",
            "msh/US/NH/send",
            "--traceroute-cooldown",
            "60",
        ]);
        let config = args.into_config().unwrap();
        assert!(config.validate().is_ok());
        assert!(matches!(config.link, LinkConfig::Tcp { ref host, port: 4403 } if host == "192.168.1.50"));
        assert_eq!(config.mqtt.listen_topic.as_deref(), Some("msh/US/NH/send"));
        assert_eq!(config.traceroute.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_tcp_requires_node_ip() {
        let args = Args::parse_from(["nhmesh-producer", "--connection-type", "tcp"]);
        if args.node_ip.is_none() {
            assert!(args.into_config().is_err());
        }
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let args = Args::parse_from([
            "nhmesh-producer",
            "--node-ip",
            "10.0.0.2",
            "--username",
            "user",
        ]);
        if args.password.is_none() {
            assert!(args.into_config().is_err());
        }
    }
}
