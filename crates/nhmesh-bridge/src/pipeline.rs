//! Inbound packet normalization
//!
//! Every packet the manager accepts passes through here once: the link's
//! liveness timestamp is bumped, the packet is turned into a [`Packet`]
//! with canonical node ids and gateway metadata, and the result is handed
//! to the MQTT bridge. The source node is also reported to the traceroute
//! daemon. A bad packet is logged and dropped without stopping the loop.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::interface::LinkInfo;
use crate::node::NodeId;
use crate::packet::{DecodedPayload, MeshtasticPort, Packet, RawPacket, UNKNOWN_GATEWAY};
use crate::traceroute::Observation;

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineStats {
    /// Packets normalized and queued for MQTT
    pub forwarded: u64,
    /// Packets dropped as malformed
    pub invalid: u64,
    /// Packets dropped because the MQTT queue was full or closed
    pub queue_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    invalid: AtomicU64,
    queue_dropped: AtomicU64,
}

/// Normalize a raw packet against the gateway's local info
pub fn normalize(raw: &RawPacket, info: &LinkInfo) -> Result<Packet> {
    let from_id = NodeId::new(raw.from);
    if !from_id.is_unicast() {
        return Err(BridgeError::InvalidNodeId(format!("source {:#010x}", raw.from)));
    }

    let decoded = match raw.port_num {
        MeshtasticPort::TextMessage => {
            let text = std::str::from_utf8(&raw.payload).map_err(|e| {
                BridgeError::InvalidPacket(format!("text payload is not UTF-8: {}", e))
            })?;
            DecodedPayload {
                portnum: raw.port_num.as_str().to_string(),
                text: Some(text.to_string()),
                payload: None,
            }
        }
        port => DecodedPayload {
            portnum: port.as_str().to_string(),
            text: None,
            payload: (!raw.payload.is_empty()).then(|| hex::encode(&raw.payload)),
        },
    };

    Ok(Packet {
        from_id,
        to_id: NodeId::new(raw.to),
        id: raw.packet_id,
        channel: raw.channel,
        channel_name: info.channel_names.get(&raw.channel).cloned(),
        hop_limit: raw.hop_limit,
        decoded,
        rx_time: raw.rx_time.unwrap_or_else(Utc::now),
        gateway_id: info
            .gateway_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| UNKNOWN_GATEWAY.to_string()),
        source: "rf".to_string(),
        modem_preset: info.modem_preset.unwrap_or_default(),
        lora_channel: info.lora_channel.unwrap_or(0),
    })
}

/// Consumes raw packets from the manager
pub struct PacketPipeline {
    manager: Arc<ConnectionManager>,
    publish_tx: mpsc::Sender<Packet>,
    observe_tx: Option<mpsc::Sender<Observation>>,
    counters: Arc<Counters>,
}

/// Read access to a running pipeline's counters
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    counters: Arc<Counters>,
}

impl PipelineHandle {
    /// Counter snapshot
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            queue_dropped: self.counters.queue_dropped.load(Ordering::Relaxed),
        }
    }
}

impl PacketPipeline {
    /// Create a pipeline publishing to `publish_tx`
    pub fn new(manager: Arc<ConnectionManager>, publish_tx: mpsc::Sender<Packet>) -> Self {
        Self {
            manager,
            publish_tx,
            observe_tx: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Also report source nodes to the traceroute daemon
    pub fn with_observer(mut self, observe_tx: mpsc::Sender<Observation>) -> Self {
        self.observe_tx = Some(observe_tx);
        self
    }

    /// Handle for reading counters
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Process one packet
    pub fn process(&self, raw: RawPacket) {
        self.manager.record_packet();

        let info = self.manager.link_info();
        let packet = match normalize(&raw, &info) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    error = %e,
                    code = e.error_code(),
                    from = raw.from,
                    "Dropping packet"
                );
                self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        trace!(
            from = %packet.from_id,
            port = %packet.decoded.portnum,
            "Normalized packet"
        );

        if let Some(observe_tx) = &self.observe_tx {
            let observation = Observation {
                node: packet.from_id,
                port: raw.port_num,
            };
            if let Err(e) = observe_tx.try_send(observation) {
                debug!(error = %e, "Traceroute daemon not keeping up");
            }
        }

        match self.publish_tx.try_send(packet) {
            Ok(()) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "MQTT queue unavailable, dropping packet");
                self.counters.queue_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Consume packets until cancelled or the manager goes away
    pub async fn run(self, mut packets: mpsc::Receiver<RawPacket>, cancel: CancellationToken) {
        loop {
            let raw = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                raw = packets.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };
            self.process(raw);
        }
        debug!("Packet pipeline exiting");
    }
}
