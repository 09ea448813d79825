//! MQTT 3.1 packet decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_remaining_length, read_string, read_u16, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PubAck, Publish, QoS, ReturnCode, SubAck, Subscribe,
    TopicQos, UnsubAck, Unsubscribe, Will,
};

/// MQTT 3.1 packet decoder.
///
/// Validation here is purely structural. Semantic checks the broker answers
/// on the wire (protocol name and version, client identifier length,
/// wildcard topics in PUBLISH) are left to the connection state machine so
/// it can respond instead of dropping the frame at parse time.
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of the buffer.
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold a complete
    /// packet, otherwise `(packet, bytes_consumed)`.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_remaining_length(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => decode_connect(payload)?,
            2 => decode_connack(flags, payload)?,
            3 => decode_publish(flags, payload)?,
            4 => Packet::PubAck(PubAck {
                message_id: read_u16(payload)?,
            }),
            8 => decode_subscribe(payload)?,
            9 => decode_suback(payload)?,
            10 => decode_unsubscribe(payload)?,
            11 => Packet::UnsubAck(UnsubAck {
                message_id: read_u16(payload)?,
            }),
            12 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingReq
            }
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingResp
            }
            14 => Packet::Disconnect,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_connect(payload: &[u8]) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    // Protocol name and version are carried through verbatim; the broker
    // answers unacceptable revisions with CONNACK code 1.
    let (protocol_name, len) = read_string(&payload[pos..])?;
    pos += len;

    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let protocol_version = payload[pos];
    pos += 1;

    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = payload[pos];
    pos += 1;

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    if will_qos > 2 {
        return Err(DecodeError::InvalidQoS(will_qos));
    }
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    if pos + 2 > payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let keep_alive = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    pos += 2;

    let (client_id, len) = read_string(&payload[pos..])?;
    pos += len;

    let will = if will_flag {
        let (will_topic, len) = read_string(&payload[pos..])?;
        pos += len;
        let (will_message, len) = read_binary(&payload[pos..])?;
        pos += len;
        Some(Will {
            topic: will_topic.to_string(),
            message: Bytes::copy_from_slice(will_message),
            qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, _len) = read_binary(&payload[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        protocol_name: protocol_name.to_string(),
        protocol_version,
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        will,
        username,
        password,
    })))
}

fn decode_connack(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    // First byte is reserved in 3.1.
    let code = payload[1];
    let return_code = ReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?;

    Ok(Packet::ConnAck(ConnAck { return_code }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    let mut pos = 0;

    let (topic, len) = read_string(&payload[pos..])?;
    pos += len;

    let message_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&payload[pos..])?;
        pos += 2;
        Some(id)
    } else {
        None
    };

    let message_payload = Bytes::copy_from_slice(&payload[pos..]);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        message_id,
        payload: message_payload,
    }))
}

fn decode_subscribe(payload: &[u8]) -> Result<Packet, DecodeError> {
    let message_id = read_u16(payload)?;
    let mut pos = 2;

    let mut topics = Vec::new();
    while pos < payload.len() {
        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let qos_byte = payload[pos];
        pos += 1;

        topics.push(TopicQos {
            topic: topic.to_string(),
            qos: QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?,
        });
    }

    if topics.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without topics"));
    }

    Ok(Packet::Subscribe(Subscribe { message_id, topics }))
}

fn decode_suback(payload: &[u8]) -> Result<Packet, DecodeError> {
    let message_id = read_u16(payload)?;

    let mut granted_qos = Vec::with_capacity(payload.len() - 2);
    for &byte in &payload[2..] {
        granted_qos.push(QoS::from_u8(byte).ok_or(DecodeError::InvalidQoS(byte))?);
    }

    Ok(Packet::SubAck(SubAck {
        message_id,
        granted_qos,
    }))
}

fn decode_unsubscribe(payload: &[u8]) -> Result<Packet, DecodeError> {
    let message_id = read_u16(payload)?;
    let mut pos = 2;

    let mut topics = Vec::new();
    while pos < payload.len() {
        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;
        topics.push(topic.to_string());
    }

    if topics.is_empty() {
        return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without topics"));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { message_id, topics }))
}
