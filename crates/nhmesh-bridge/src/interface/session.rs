//! One open byte-stream session with a device
//!
//! Shared by the TCP and serial links: the handshake, the reader task that
//! feeds the event sink, and serialized writes.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::codec::{self, DeviceFrame, FrameDecoder};
use super::{LinkEventSink, LinkInfo, OutboundMessage};
use crate::error::{BridgeError, Result};

const READ_BUFFER_SIZE: usize = 512;

/// Byte streams a session can run over
pub(crate) trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DeviceStream for T {}

pub(crate) struct Session<S: DeviceStream> {
    name: String,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    cancel: CancellationToken,
}

impl<S: DeviceStream> Session<S> {
    /// Run the handshake on `stream` and start forwarding events to `sink`
    pub(crate) async fn open(
        name: String,
        stream: S,
        sink: LinkEventSink,
        handshake_timeout: Duration,
    ) -> Result<(Arc<Self>, LinkInfo)> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::new();

        let request = codec::frame(&codec::encode_want_config(rand::random()))?;
        writer
            .write_all(&request)
            .await
            .map_err(|e| BridgeError::WriteError(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| BridgeError::WriteError(e.to_string()))?;

        let info = match tokio::time::timeout(
            handshake_timeout,
            read_local_info(&mut reader, &mut decoder, &sink),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(link = %name, "Device did not report local info, continuing without it");
                LinkInfo::default()
            }
        };

        info!(
            link = %name,
            gateway = ?info.gateway_id,
            preset = ?info.modem_preset,
            channels = info.channel_names.len(),
            "Device session open"
        );

        let cancel = CancellationToken::new();
        tokio::spawn(read_loop(
            name.clone(),
            reader,
            decoder,
            sink,
            cancel.clone(),
        ));

        let session = Arc::new(Self {
            name,
            writer: tokio::sync::Mutex::new(writer),
            cancel,
        });
        Ok((session, info))
    }

    pub(crate) async fn send(&self, message: &OutboundMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Disconnected);
        }

        let body = codec::encode_outbound(message, rand::random())?;
        let framed = codec::frame(&body)?;
        debug!(link = %self.name, size = framed.len(), "Writing frame");

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&framed)
            .await
            .map_err(|e| BridgeError::WriteError(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| BridgeError::WriteError(format!("Flush failed: {}", e)))
    }

    /// Stop the reader without reporting a disconnect, then close the stream
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!(link = %self.name, error = %e, "Shutdown on close failed");
        }
    }
}

impl<S: DeviceStream> Drop for Session<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_local_info<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    sink: &LinkEventSink,
) -> Result<LinkInfo> {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        loop {
            let body = match decoder.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed frame");
                    continue;
                }
            };
            match codec::decode(&body) {
                Ok(DeviceFrame::LocalInfo(info)) => return Ok(info),
                Ok(DeviceFrame::Packet(packet)) => sink.packet(packet).await,
                Err(e) => warn!(error = %e, "Dropping undecodable frame"),
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => return Err(BridgeError::Disconnected),
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => return Err(BridgeError::ReadError(e.to_string())),
        }
    }
}

async fn read_loop<S: DeviceStream>(
    name: String,
    mut reader: ReadHalf<S>,
    mut decoder: FrameDecoder,
    sink: LinkEventSink,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        loop {
            let body = match decoder.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    warn!(link = %name, error = %e, "Dropping malformed frame");
                    continue;
                }
            };
            match codec::decode(&body) {
                Ok(DeviceFrame::Packet(packet)) => sink.packet(packet).await,
                Ok(DeviceFrame::LocalInfo(_)) => {
                    trace!(link = %name, "Heartbeat reply");
                    sink.heartbeat().await;
                }
                Err(e) => warn!(link = %name, error = %e, "Dropping undecodable frame"),
            }
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(link = %name, "Reader stopped");
                return;
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!(link = %name, "Device closed the stream");
                sink.disconnected(Some("stream closed by device".into()))
                    .await;
                return;
            }
            Ok(n) => {
                trace!(link = %name, bytes = n, "Read from device");
                decoder.extend(&buf[..n]);
            }
            Err(e) => {
                warn!(link = %name, error = %e, "Device read error");
                sink.disconnected(Some(e.to_string())).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{LinkEvent, TaggedEvent};
    use crate::node::NodeId;
    use crate::packet::{MeshtasticPort, ModemPreset, RawPacket};
    use bytes::Bytes;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    fn sample_packet() -> RawPacket {
        RawPacket {
            from: 0x0a0b0c0d,
            to: 0xFFFFFFFF,
            packet_id: 5,
            channel: 0,
            port_num: MeshtasticPort::TextMessage,
            payload: Bytes::from_static(b"ping"),
            hop_limit: 3,
            want_ack: false,
            rx_time: None,
        }
    }

    #[tokio::test]
    async fn test_handshake_and_packets() {
        let (host, mut device) = duplex(4096);
        let (tx, mut rx) = mpsc::channel::<TaggedEvent>(8);
        let sink = LinkEventSink::new(3, tx);

        let device_side = tokio::spawn(async move {
            let mut request = [0u8; 9];
            device.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..2], &[0x94, 0xC3]);

            let info = LinkInfo {
                gateway_id: Some(NodeId::new(0xfeedbeef)),
                modem_preset: Some(ModemPreset::LongFast),
                lora_channel: Some(20),
                ..LinkInfo::default()
            };
            let reply = codec::frame(&codec::encode_local_info(&info)).unwrap();
            device.write_all(&reply).await.unwrap();
            let packet = codec::frame(&codec::encode_packet(&sample_packet())).unwrap();
            device.write_all(&packet).await.unwrap();
            device
        });

        let (session, info) =
            Session::open("test".into(), host, sink, Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(info.gateway_id, Some(NodeId::new(0xfeedbeef)));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 3);
        assert_eq!(event.event, LinkEvent::Packet(sample_packet()));

        // Closing the device end reports an errored disconnect
        let mut device = device_side.await.unwrap();
        session.send(&OutboundMessage::Heartbeat).await.unwrap();
        let mut request = [0u8; 9];
        device.read_exact(&mut request).await.unwrap();
        assert_eq!(request[4], 0x03);
        let reply = codec::frame(&codec::encode_local_info(&LinkInfo::default())).unwrap();
        device.write_all(&reply).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, LinkEvent::Heartbeat);

        drop(device);
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.event,
            LinkEvent::Disconnected { error: Some(_) }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_yields_empty_info() {
        let (host, _device) = duplex(4096);
        let (tx, _rx) = mpsc::channel::<TaggedEvent>(8);
        let sink = LinkEventSink::new(1, tx);

        let (_session, info) =
            Session::open("silent".into(), host, sink, Duration::from_secs(2))
                .await
                .unwrap();
        assert_eq!(info, LinkInfo::default());
    }

    #[tokio::test]
    async fn test_close_does_not_report_disconnect() {
        let (host, mut device) = duplex(4096);
        let (tx, mut rx) = mpsc::channel::<TaggedEvent>(8);
        let sink = LinkEventSink::new(1, tx);

        tokio::spawn(async move {
            let mut request = [0u8; 9];
            device.read_exact(&mut request).await.unwrap();
            let reply = codec::frame(&codec::encode_local_info(&LinkInfo::default())).unwrap();
            device.write_all(&reply).await.unwrap();
            // Hold the device end open until the host closes
            let mut rest = Vec::new();
            let _ = device.read_to_end(&mut rest).await;
        });

        let (session, _) = Session::open("test".into(), host, sink, Duration::from_secs(5))
            .await
            .unwrap();
        session.close().await;
        drop(session);

        assert!(rx.recv().await.is_none());
    }
}
