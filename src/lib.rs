//! chirpmq - a lightweight MQTT 3.1 publish/subscribe broker
//!
//! Implements the 3.1 revision of the protocol (`MQIsdp`, version byte 3):
//! topic routing with `+`/`#` wildcards, retained messages, and
//! single-session-per-identifier semantics, plus a minimal client speaking
//! the same wire format. Publication is QoS 0 only.

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use client::{Client, ClientError};
pub use config::Config;
