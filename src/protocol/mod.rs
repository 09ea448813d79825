//! MQTT 3.1 protocol definitions
//!
//! Core types shared by the broker, the client, and the codec. Only the
//! 3.1 revision of the protocol (`MQIsdp`, version byte 3) is spoken.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError};
pub use packet::*;

/// Protocol name carried in the CONNECT variable header.
pub const PROTOCOL_NAME: &str = "MQIsdp";

/// Protocol version byte for MQTT 3.1.
pub const PROTOCOL_VERSION: u8 = 3;

/// Maximum client identifier length accepted by the broker.
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// CONNACK return codes defined by MQTT 3.1.
///
/// The broker emits `Accepted`, `UnacceptableProtocolVersion` and
/// `IdentifierRejected`; the remaining codes exist so the client side can
/// report whatever a peer broker answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ReturnCode::Accepted),
            1 => Some(ReturnCode::UnacceptableProtocolVersion),
            2 => Some(ReturnCode::IdentifierRejected),
            3 => Some(ReturnCode::ServerUnavailable),
            4 => Some(ReturnCode::BadCredentials),
            5 => Some(ReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ReturnCode::Accepted => "connection accepted",
            ReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ReturnCode::IdentifierRejected => "identifier rejected",
            ReturnCode::ServerUnavailable => "server unavailable",
            ReturnCode::BadCredentials => "bad user name or password",
            ReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(msg)
    }
}
