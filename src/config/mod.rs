//! Configuration module
//!
//! TOML-based configuration with environment variable overrides
//! (`CHIRPMQ_*` prefix, `__` as the section separator, e.g.
//! `CHIRPMQ_SERVER__BIND`). Every field has a default so an empty file and
//! no file at all are both valid configurations.

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use serde::Deserialize;

use crate::broker::BrokerConfig;


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Underlying loader error (file access, TOML syntax, type mismatch)
    Config(config::ConfigError),
    /// Semantically invalid value
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Dispatch pool configuration
    pub dispatch: DispatchConfig,
    /// Per-connection configuration
    pub connection: ConnectionConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().unwrap(),
        }
    }
}

/// Dispatch pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of dispatch workers. More than one relaxes cross-publisher
    /// delivery ordering; one gives broker-wide FIFO.
    pub workers: usize,
    /// Capacity of the dispatch FIFO
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 100,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Capacity of each connection's outbound job queue
    pub outbound_capacity: usize,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 100,
            max_packet_size: 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, applying `CHIRPMQ_*`
    /// environment overrides on top.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("CHIRPMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.workers == 0 {
            return Err(ConfigError::Validation(
                "dispatch.workers must be at least 1".into(),
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "dispatch.queue_capacity must be at least 1".into(),
            ));
        }
        if self.connection.outbound_capacity == 0 {
            return Err(ConfigError::Validation(
                "connection.outbound_capacity must be at least 1".into(),
            ));
        }
        if self.connection.max_packet_size < 16 {
            return Err(ConfigError::Validation(
                "connection.max_packet_size is too small to hold a packet".into(),
            ));
        }
        Ok(())
    }

    /// Derive the broker runtime configuration.
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            dispatch_workers: self.dispatch.workers,
            dispatch_queue_capacity: self.dispatch.queue_capacity,
            outbound_queue_capacity: self.connection.outbound_capacity,
            max_packet_size: self.connection.max_packet_size,
        }
    }
}
