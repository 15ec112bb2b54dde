//! Stream framing and the device message codec
//!
//! Every message on a serial or TCP link is framed as:
//! - Bytes 0-1: Magic (0x94C3, big-endian)
//! - Bytes 2-3: Body length (big-endian u16)
//! - Bytes 4+: Body
//!
//! The first body byte selects the message kind. Multi-byte integers are
//! big-endian throughout.
//!
//! | kind | direction | layout after the kind byte |
//! |------|-----------|----------------------------|
//! | 0x01 | both | from(4) to(4) id(4) channel(1) port(1) hop_limit(1) flags(1) rx_time(4) payload.. |
//! | 0x02 | device → host | node_num(4) modem_preset(1) lora_channel(4) { index(1) len(1) name.. }* |
//! | 0x03 | host → device | nonce(4), requests a 0x02 reply |

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{trace, warn};

use crate::config::{LORA_MAX_PAYLOAD, MESHTASTIC_MAGIC};
use crate::error::{BridgeError, Result};
use crate::interface::{LinkInfo, OutboundMessage};
use crate::node::NodeId;
use crate::packet::{MeshtasticPort, ModemPreset, RawPacket};

/// Largest body accepted from a device
pub(crate) const MAX_FRAME_BODY: usize = 512;

const FRAME_HEADER_LEN: usize = 4;
const PACKET_HEADER_LEN: usize = 20;
const LOCAL_INFO_LEN: usize = 9;

const KIND_PACKET: u8 = 0x01;
const KIND_LOCAL_INFO: u8 = 0x02;
const KIND_WANT_CONFIG: u8 = 0x03;

const FLAG_WANT_ACK: u8 = 0x01;

/// A decoded device message
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeviceFrame {
    /// A mesh packet heard by the radio
    Packet(RawPacket),
    /// Reply to a config request
    LocalInfo(LinkInfo),
}

/// Accumulates stream bytes and splits them into frame bodies
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub(crate) fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_BODY * 2),
        }
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete frame body out of the buffer
    ///
    /// Bytes before a magic number are discarded. An oversized length is
    /// reported as an error after skipping its magic, so the caller can
    /// log it and keep going.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
        if magic != MESHTASTIC_MAGIC {
            match self.find_magic() {
                Some(pos) => {
                    warn!(discarded = pos, "Discarding bytes before magic number");
                    self.buffer.advance(pos);
                }
                None => {
                    // Keep a trailing first magic byte, the rest may follow
                    let keep = usize::from(self.buffer.last() == Some(&0x94));
                    let discard = self.buffer.len() - keep;
                    if discard > 0 {
                        warn!(discarded = discard, "Discarding buffer without magic");
                        self.buffer.advance(discard);
                    }
                    return Ok(None);
                }
            }

            if self.buffer.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
        }

        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length > MAX_FRAME_BODY {
            self.buffer.advance(2);
            return Err(BridgeError::InvalidPacket(format!(
                "frame length {} exceeds maximum",
                length
            )));
        }

        let total = FRAME_HEADER_LEN + length;
        if self.buffer.len() < total {
            trace!(
                have = self.buffer.len(),
                need = total,
                "Waiting for complete frame"
            );
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total);
        frame.advance(FRAME_HEADER_LEN);
        Ok(Some(frame.freeze()))
    }

    fn find_magic(&self) -> Option<usize> {
        let [hi, lo] = MESHTASTIC_MAGIC.to_be_bytes();
        self.buffer.windows(2).position(|w| w[0] == hi && w[1] == lo)
    }
}

/// Wrap a body with the magic and length header
pub(crate) fn frame(body: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(body.len()).map_err(|_| BridgeError::MessageTooLarge {
        size: body.len(),
        max: u16::MAX as usize,
    })?;
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    framed.extend_from_slice(&MESHTASTIC_MAGIC.to_be_bytes());
    framed.extend_from_slice(&length.to_be_bytes());
    framed.extend_from_slice(body);
    Ok(framed)
}

/// Decode a frame body
pub(crate) fn decode(body: &[u8]) -> Result<DeviceFrame> {
    let (&kind, rest) = body
        .split_first()
        .ok_or_else(|| BridgeError::InvalidPacket("empty frame".into()))?;

    match kind {
        KIND_PACKET => decode_packet(rest).map(DeviceFrame::Packet),
        KIND_LOCAL_INFO => decode_local_info(rest).map(DeviceFrame::LocalInfo),
        other => Err(BridgeError::InvalidPacket(format!(
            "unknown frame kind 0x{:02X}",
            other
        ))),
    }
}

fn decode_packet(mut data: &[u8]) -> Result<RawPacket> {
    if data.len() < PACKET_HEADER_LEN {
        return Err(BridgeError::InvalidPacket(format!(
            "packet header truncated ({} bytes)",
            data.len()
        )));
    }

    let from = data.get_u32();
    let to = data.get_u32();
    let packet_id = data.get_u32();
    let channel = data.get_u8();
    let port_num = MeshtasticPort::from(u32::from(data.get_u8()));
    let hop_limit = data.get_u8();
    let flags = data.get_u8();
    let rx_secs = data.get_u32();

    let rx_time = match rx_secs {
        0 => None,
        secs => DateTime::<Utc>::from_timestamp(i64::from(secs), 0),
    };

    Ok(RawPacket {
        from,
        to,
        packet_id,
        channel,
        port_num,
        payload: Bytes::copy_from_slice(data),
        hop_limit,
        want_ack: flags & FLAG_WANT_ACK != 0,
        rx_time,
    })
}

fn decode_local_info(mut data: &[u8]) -> Result<LinkInfo> {
    if data.len() < LOCAL_INFO_LEN {
        return Err(BridgeError::InvalidPacket(format!(
            "local info truncated ({} bytes)",
            data.len()
        )));
    }

    let node_num = data.get_u32();
    let modem_preset = ModemPreset::from(data.get_u8());
    let lora_channel = data.get_u32();

    let mut channel_names = BTreeMap::new();
    while data.len() >= 2 {
        let index = data.get_u8();
        let len = data.get_u8() as usize;
        if data.len() < len {
            return Err(BridgeError::InvalidPacket(format!(
                "channel {} name truncated",
                index
            )));
        }
        let name = String::from_utf8_lossy(&data[..len]).into_owned();
        data.advance(len);
        if !name.is_empty() {
            channel_names.insert(index, name);
        }
    }

    let gateway = NodeId::new(node_num);
    Ok(LinkInfo {
        gateway_id: gateway.is_unicast().then_some(gateway),
        modem_preset: Some(modem_preset),
        lora_channel: Some(lora_channel),
        channel_names,
    })
}

/// Encode a config request
pub(crate) fn encode_want_config(nonce: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(5);
    body.push(KIND_WANT_CONFIG);
    body.extend_from_slice(&nonce.to_be_bytes());
    body
}

/// Encode an outbound message as a frame body
///
/// Heartbeats become config requests with `packet_id` as the nonce. For
/// packets the source is left as 0; the device fills in its own node number.
pub(crate) fn encode_outbound(message: &OutboundMessage, packet_id: u32) -> Result<Vec<u8>> {
    let (to, port, hop_limit, flags, payload) = match message {
        OutboundMessage::Heartbeat => return Ok(encode_want_config(packet_id)),
        OutboundMessage::Text { text, to } => {
            if text.len() > LORA_MAX_PAYLOAD {
                return Err(BridgeError::MessageTooLarge {
                    size: text.len(),
                    max: LORA_MAX_PAYLOAD,
                });
            }
            let to = to.unwrap_or_else(NodeId::broadcast);
            (to, MeshtasticPort::TextMessage, 3u8, 0u8, text.as_bytes())
        }
        OutboundMessage::Traceroute { to, hop_limit } => (
            *to,
            MeshtasticPort::Traceroute,
            *hop_limit,
            FLAG_WANT_ACK,
            &[][..],
        ),
    };

    let mut body = Vec::with_capacity(1 + PACKET_HEADER_LEN + payload.len());
    body.push(KIND_PACKET);
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&to.num().to_be_bytes());
    body.extend_from_slice(&packet_id.to_be_bytes());
    body.push(0);
    body.push(u32::from(port) as u8);
    body.push(hop_limit);
    body.push(flags);
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(payload);
    Ok(body)
}

/// Encode a received packet the way a device would
///
/// Used by tests and simulators to feed links.
pub(crate) fn encode_packet(packet: &RawPacket) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + PACKET_HEADER_LEN + packet.payload.len());
    body.push(KIND_PACKET);
    body.extend_from_slice(&packet.from.to_be_bytes());
    body.extend_from_slice(&packet.to.to_be_bytes());
    body.extend_from_slice(&packet.packet_id.to_be_bytes());
    body.push(packet.channel);
    body.push(u32::from(packet.port_num) as u8);
    body.push(packet.hop_limit);
    body.push(if packet.want_ack { FLAG_WANT_ACK } else { 0 });
    let rx = packet
        .rx_time
        .and_then(|t| u32::try_from(t.timestamp()).ok())
        .unwrap_or(0);
    body.extend_from_slice(&rx.to_be_bytes());
    body.extend_from_slice(&packet.payload);
    body
}

/// Encode a local info reply the way a device would
pub(crate) fn encode_local_info(info: &LinkInfo) -> Vec<u8> {
    let mut body = vec![KIND_LOCAL_INFO];
    let node = info.gateway_id.map(|id| id.num()).unwrap_or(0);
    body.extend_from_slice(&node.to_be_bytes());
    let preset = match info.modem_preset.unwrap_or_default() {
        ModemPreset::LongFast => 0,
        ModemPreset::LongSlow => 1,
        ModemPreset::VeryLongSlow => 2,
        ModemPreset::MediumSlow => 3,
        ModemPreset::MediumFast => 4,
        ModemPreset::ShortSlow => 5,
        ModemPreset::ShortFast => 6,
        ModemPreset::LongModerate => 7,
        ModemPreset::ShortTurbo => 8,
        ModemPreset::Unknown => 0xFF,
    };
    body.push(preset);
    body.extend_from_slice(&info.lora_channel.unwrap_or(0).to_be_bytes());
    for (index, name) in &info.channel_names {
        let bytes = name.as_bytes();
        let len = bytes.len().min(u8::MAX as usize);
        body.push(*index);
        body.push(len as u8);
        body.extend_from_slice(&bytes[..len]);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_packet() -> RawPacket {
        RawPacket {
            from: 0x1a2b3c4d,
            to: 0xFFFFFFFF,
            packet_id: 42,
            channel: 1,
            port_num: MeshtasticPort::TextMessage,
            payload: Bytes::from_static(b"hello mesh"),
            hop_limit: 3,
            want_ack: false,
            rx_time: DateTime::<Utc>::from_timestamp(1_700_000_000, 0),
        }
    }

    #[test]
    fn test_frame_header() {
        let framed = frame(b"hello").unwrap();
        assert_eq!(&framed[..2], &[0x94, 0xC3]);
        assert_eq!(u16::from_be_bytes([framed[2], framed[3]]), 5);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x94, 0xC3, 0x00, 0x05, b'h']);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(b"ello");
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_skip_garbage_before_magic() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"garbage");
        decoder.extend(&frame(b"test").unwrap());
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"test");
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x94, 0xC3, 0xFF, 0xFF]);
        decoder.extend(&frame(b"ok").unwrap());
        assert!(decoder.next_frame().is_err());
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"ok");
    }

    #[test]
    fn test_decode_packet() {
        let packet = text_packet();
        match decode(&encode_packet(&packet)).unwrap() {
            DeviceFrame::Packet(decoded) => assert_eq!(decoded, packet),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated_packet() {
        assert!(decode(&[KIND_PACKET, 0, 0, 0]).is_err());
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x7F]).is_err());
    }

    #[test]
    fn test_decode_local_info() {
        let mut names = BTreeMap::new();
        names.insert(0, "LongFast".to_string());
        names.insert(2, "Admin".to_string());
        let info = LinkInfo {
            gateway_id: Some(NodeId::new(0xdeadbeef)),
            modem_preset: Some(ModemPreset::MediumFast),
            lora_channel: Some(20),
            channel_names: names,
        };
        match decode(&encode_local_info(&info)).unwrap() {
            DeviceFrame::LocalInfo(decoded) => assert_eq!(decoded, info),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_local_info_without_node_number() {
        let info = LinkInfo {
            modem_preset: Some(ModemPreset::LongFast),
            lora_channel: Some(0),
            ..LinkInfo::default()
        };
        match decode(&encode_local_info(&info)).unwrap() {
            DeviceFrame::LocalInfo(decoded) => assert!(decoded.gateway_id.is_none()),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_encode_text_broadcast_and_direct() {
        let broadcast = OutboundMessage::Text {
            text: "hi".into(),
            to: None,
        };
        let body = encode_outbound(&broadcast, 9).unwrap();
        assert_eq!(&body[5..9], &0xFFFFFFFFu32.to_be_bytes());
        assert_eq!(body[14], 1);
        assert_eq!(&body[21..], b"hi");

        let direct = OutboundMessage::Text {
            text: "hi".into(),
            to: Some(NodeId::new(0x0000abcd)),
        };
        let body = encode_outbound(&direct, 9).unwrap();
        assert_eq!(&body[5..9], &0x0000abcdu32.to_be_bytes());
    }

    #[test]
    fn test_encode_traceroute() {
        let msg = OutboundMessage::Traceroute {
            to: NodeId::new(0x11223344),
            hop_limit: 7,
        };
        let body = encode_outbound(&msg, 1).unwrap();
        assert_eq!(body[14], 70);
        assert_eq!(body[15], 7);
        assert_eq!(body[16] & FLAG_WANT_ACK, FLAG_WANT_ACK);
    }

    #[test]
    fn test_encode_heartbeat() {
        let body = encode_outbound(&OutboundMessage::Heartbeat, 0x01020304).unwrap();
        assert_eq!(body, vec![KIND_WANT_CONFIG, 1, 2, 3, 4]);
    }

    #[test]
    fn test_text_too_large() {
        let msg = OutboundMessage::Text {
            text: "x".repeat(LORA_MAX_PAYLOAD + 1),
            to: None,
        };
        assert!(matches!(
            encode_outbound(&msg, 1),
            Err(BridgeError::MessageTooLarge { .. })
        ));
    }
}
