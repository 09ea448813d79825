//! MQTT 3.1 broker core
//!
//! The [`Broker`] owns the listener, the shared subscription table, the
//! dispatch pool, and the client registry. Each accepted transport gets a
//! reader/writer task pair; publications flow reader -> dispatch pool ->
//! subscriber writer queues without ever blocking the accept loop.

mod connection;
mod dispatch;
mod registry;
mod subscriptions;

pub use connection::{Connection, ConnectionError, Job};
pub use dispatch::{Dispatcher, Post};
pub use registry::ClientRegistry;
pub use subscriptions::SubscriptionTable;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Number of dispatch worker tasks. With more than one worker,
    /// delivery order across distinct publishers is not globally
    /// serialized; run one worker for strict broker-wide FIFO.
    pub dispatch_workers: usize,
    /// Capacity of the dispatch FIFO; publishers block when it is full
    pub dispatch_queue_capacity: usize,
    /// Capacity of each connection's outbound job queue
    pub outbound_queue_capacity: usize,
    /// Maximum accepted packet size
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            dispatch_workers: 2,
            dispatch_queue_capacity: 100,
            outbound_queue_capacity: 100,
            max_packet_size: 1024 * 1024, // 1 MB
        }
    }
}

/// The MQTT broker
pub struct Broker {
    config: BrokerConfig,
    subscriptions: Arc<SubscriptionTable>,
    dispatcher: Dispatcher,
    registry: Arc<ClientRegistry>,
    done: watch::Sender<bool>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let subscriptions = Arc::new(SubscriptionTable::new());
        let dispatcher = dispatch::start(
            config.dispatch_workers,
            config.dispatch_queue_capacity,
            subscriptions.clone(),
        );
        let (done, _) = watch::channel(false);

        Self {
            config,
            subscriptions,
            dispatcher,
            registry: Arc::new(ClientRegistry::new()),
            done,
        }
    }

    /// Bind the configured address and accept connections until the
    /// listener fails.
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener. Returns (and
    /// flips the done signal) when accept fails; connections already
    /// established keep running until their own transports fail.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    connection::spawn(
                        stream,
                        addr,
                        self.subscriptions.clone(),
                        self.dispatcher.clone(),
                        self.registry.clone(),
                        &self.config,
                    );
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    self.done.send_replace(true);
                    return Err(e);
                }
            }
        }
    }

    /// Observe the terminal signal: resolves true once the accept loop has
    /// stopped.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Number of registered client sessions.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of retained messages currently stored.
    pub fn retained_count(&self) -> usize {
        self.subscriptions.retained_len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
