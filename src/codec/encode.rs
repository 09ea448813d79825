//! MQTT 3.1 packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_remaining_length, write_string};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// MQTT 3.1 packet encoder.
#[derive(Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => encode_message_id_only(0x40, p.message_id, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_message_id_only(0xB0, p.message_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.protocol_name.len() // protocol name
        + 1  // version byte
        + 1  // connect flags
        + 2  // keep alive
        + 2 + packet.client_id.len();

    if let Some(ref will) = packet.will {
        remaining_length += 2 + will.topic.len();
        remaining_length += 2 + will.message.len();
    }
    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    buf.put_u8(0x10);
    write_remaining_length(buf, remaining_length as u32)?;

    write_string(buf, &packet.protocol_name)?;
    buf.put_u8(packet.protocol_version);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);

    write_string(buf, &packet.client_id)?;
    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.message)?;
    }
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x20);
    buf.put_u8(0x02);
    buf.put_u8(0x00); // reserved
    buf.put_u8(packet.return_code as u8);
    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.topic.len() + packet.payload.len();
    if packet.qos != QoS::AtMostOnce {
        remaining_length += 2;
    }

    let mut first_byte: u8 = 0x30;
    if packet.dup {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }
    buf.put_u8(first_byte);
    write_remaining_length(buf, remaining_length as u32)?;

    write_string(buf, &packet.topic)?;
    if packet.qos != QoS::AtMostOnce {
        buf.put_u16(packet.message_id.unwrap_or(0));
    }
    buf.put_slice(&packet.payload);

    Ok(())
}

/// PUBACK and UNSUBACK share the two-byte message-id shape.
fn encode_message_id_only(
    first_byte: u8,
    message_id: u16,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(0x02);
    buf.put_u16(message_id);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2;
    for tq in &packet.topics {
        remaining_length += 2 + tq.topic.len() + 1;
    }

    // 3.1 sends SUBSCRIBE with the QoS 1 bit set in the fixed header.
    buf.put_u8(0x82);
    write_remaining_length(buf, remaining_length as u32)?;

    buf.put_u16(packet.message_id);
    for tq in &packet.topics {
        write_string(buf, &tq.topic)?;
        buf.put_u8(tq.qos as u8);
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length = 2 + packet.granted_qos.len();

    buf.put_u8(0x90);
    write_remaining_length(buf, remaining_length as u32)?;

    buf.put_u16(packet.message_id);
    for qos in &packet.granted_qos {
        buf.put_u8(*qos as u8);
    }

    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2;
    for topic in &packet.topics {
        remaining_length += 2 + topic.len();
    }

    buf.put_u8(0xA2);
    write_remaining_length(buf, remaining_length as u32)?;

    buf.put_u16(packet.message_id);
    for topic in &packet.topics {
        write_string(buf, topic)?;
    }

    Ok(())
}
