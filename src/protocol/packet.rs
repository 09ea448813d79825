//! MQTT 3.1 packet definitions

use std::sync::Arc;

use bytes::Bytes;

use super::{QoS, ReturnCode};

/// An MQTT 3.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Get packet type as u8
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::ConnAck(_) => 2,
            Packet::Publish(_) => 3,
            Packet::PubAck(_) => 4,
            Packet::Subscribe(_) => 8,
            Packet::SubAck(_) => 9,
            Packet::Unsubscribe(_) => 10,
            Packet::UnsubAck(_) => 11,
            Packet::PingReq => 12,
            Packet::PingResp => 13,
            Packet::Disconnect => 14,
        }
    }
}

/// CONNECT packet (client -> server)
///
/// Protocol name and version are carried verbatim so the broker can answer
/// an unacceptable revision with the proper CONNACK code instead of failing
/// at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name, `MQIsdp` for 3.1
    pub protocol_name: String,
    /// Protocol version byte, 3 for 3.1
    pub protocol_version: u8,
    /// Client identifier
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Will message (optional)
    pub will: Option<Will>,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<Bytes>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_name: super::PROTOCOL_NAME.to_string(),
            protocol_version: super::PROTOCOL_VERSION,
            client_id: String::new(),
            clean_session: true,
            keep_alive: 0,
            will: None,
            username: None,
            password: None,
        }
    }
}

/// Will message configuration carried in CONNECT.
///
/// Decoded and re-encoded faithfully; the broker does not publish wills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub return_code: ReturnCode,
}

/// PUBLISH packet (bidirectional)
///
/// The topic field uses `Arc<str>` so fanning a publication out to many
/// subscribers clones a pointer, not the string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name
    pub topic: Arc<str>,
    /// Message identifier (present only for QoS > 0)
    pub message_id: Option<u16>,
    /// Payload
    pub payload: Bytes,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            message_id: None,
            payload: Bytes::new(),
        }
    }
}

/// PUBACK packet (server -> client for QoS 0/1 publishes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub message_id: u16,
}

/// One requested subscription inside SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicQos {
    pub topic: String,
    pub qos: QoS,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub message_id: u16,
    pub topics: Vec<TopicQos>,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub message_id: u16,
    /// Granted QoS per requested topic, in request order
    pub granted_qos: Vec<QoS>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub topics: Vec<String>,
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub message_id: u16,
}
