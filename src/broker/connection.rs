//! Per-client connection handling
//!
//! Each accepted transport is driven by two cooperating tasks: a reader
//! that decodes frames and runs the protocol state machine, and a writer
//! that drains a bounded job queue onto the wire. The [`Connection`] handle
//! is what the rest of the broker holds: it exposes the job queue and the
//! lifecycle signals, never the transport itself.
//!
//! Lifecycle: born on accept with an empty identifier, named on CONNECT,
//! registered, then serviced until a read error, DISCONNECT, or protocol
//! violation. The reader closes the job queue on exit; the writer drains
//! whatever is left, shuts the transport down, and purges the connection
//! from the registry and the subscription table before flipping the done
//! signal.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::broker::dispatch::{Dispatcher, Post};
use crate::broker::registry::ClientRegistry;
use crate::broker::subscriptions::SubscriptionTable;
use crate::broker::BrokerConfig;
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PubAck, Publish, QoS, ReturnCode, SubAck, Subscribe,
    UnsubAck, Unsubscribe, MAX_CLIENT_ID_LEN, PROTOCOL_NAME, PROTOCOL_VERSION,
};
use crate::topic;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(io::Error),
    Decode(DecodeError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

/// A unit of work for the writer: a frame to encode, plus an optional
/// receipt the sender can await. The receipt fires after the encode attempt
/// whether or not it succeeded, so waiters never hang on a dying peer.
pub struct Job {
    pub packet: Packet,
    pub receipt: Option<oneshot::Sender<()>>,
}

/// Shared handle to one client connection.
///
/// Identity is `Arc` pointer identity; the subscription table and the
/// client registry compare handles with [`Arc::ptr_eq`].
pub struct Connection {
    addr: SocketAddr,
    /// Client identifier, empty until CONNECT is accepted
    client_id: Mutex<Arc<str>>,
    /// Sender half of the outbound job queue. Taken on close so queued
    /// jobs still drain while new submissions fail fast.
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    /// Flips when either task starts tearing the connection down.
    shutdown: watch::Sender<bool>,
    /// Flips after the writer finished its terminal cleanup.
    done: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(
        addr: SocketAddr,
        outbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Job>) {
        let (jobs_tx, jobs_rx) = mpsc::channel(outbound_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        let conn = Arc::new(Self {
            addr,
            client_id: Mutex::new(Arc::from("")),
            jobs: Mutex::new(Some(jobs_tx)),
            shutdown,
            done,
        });
        (conn, jobs_rx)
    }

    /// Peer address of the underlying transport.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client identifier assigned during CONNECT; empty before that.
    pub fn client_id(&self) -> Arc<str> {
        self.client_id.lock().clone()
    }

    fn set_client_id(&self, id: &str) {
        *self.client_id.lock() = Arc::from(id);
    }

    #[cfg(test)]
    pub(crate) fn set_test_client_id(&self, id: &str) {
        self.set_client_id(id);
    }

    /// Queue a frame for the writer without waiting for the write.
    ///
    /// Blocks while the outbound queue is full; returns false once the
    /// connection has closed, which callers treat as a dropped delivery.
    pub async fn submit(&self, packet: Packet) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        tx.send(Job {
            packet,
            receipt: None,
        })
        .await
        .is_ok()
    }

    /// Queue a frame and return a receipt that resolves once the writer has
    /// attempted to encode it to the transport.
    pub async fn submit_await(&self, packet: Packet) -> Option<oneshot::Receiver<()>> {
        let tx = self.sender()?;
        let (receipt_tx, receipt_rx) = oneshot::channel();
        tx.send(Job {
            packet,
            receipt: Some(receipt_tx),
        })
        .await
        .ok()?;
        Some(receipt_rx)
    }

    /// Observe the terminal-done signal: resolved once the writer has
    /// finished cleanup and the connection is fully gone.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.jobs.lock().clone()
    }

    /// Close the outbound queue and wake both tasks. Already-queued jobs
    /// still reach the wire before the writer exits.
    fn close(&self) {
        self.jobs.lock().take();
        self.shutdown.send_replace(true);
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("client_id", &self.client_id())
            .finish()
    }
}

/// Launch the reader and writer tasks for a freshly accepted transport.
pub(crate) fn spawn(
    stream: TcpStream,
    addr: SocketAddr,
    subscriptions: Arc<SubscriptionTable>,
    dispatcher: Dispatcher,
    registry: Arc<ClientRegistry>,
    config: &BrokerConfig,
) -> Arc<Connection> {
    let (conn, jobs_rx) = Connection::new(addr, config.outbound_queue_capacity);
    let (read_half, write_half) = stream.into_split();

    let reader = Reader {
        conn: conn.clone(),
        stream: read_half,
        decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
        read_buf: BytesMut::with_capacity(4096),
        state: State::Fresh,
        subscriptions: subscriptions.clone(),
        dispatcher,
        registry: registry.clone(),
    };
    tokio::spawn(reader.run());

    let writer = Writer {
        conn: conn.clone(),
        stream: write_half,
        encoder: Encoder::new(),
        write_buf: BytesMut::with_capacity(4096),
        jobs: jobs_rx,
        subscriptions,
        registry,
    };
    tokio::spawn(writer.run());

    conn
}

/// Reader-side protocol state.
enum State {
    /// Waiting for CONNECT
    Fresh,
    /// CONNECT accepted, identifier registered
    Named,
}

/// What the state machine decided about the connection after a frame.
enum Flow {
    Continue,
    Close,
}

struct Reader {
    conn: Arc<Connection>,
    stream: OwnedReadHalf,
    decoder: Decoder,
    read_buf: BytesMut,
    state: State,
    subscriptions: Arc<SubscriptionTable>,
    dispatcher: Dispatcher,
    registry: Arc<ClientRegistry>,
}

impl Reader {
    async fn run(mut self) {
        if let Err(e) = self.read_loop().await {
            debug!(addr = %self.conn.addr, "reader: {}", e);
        }
        // Closing the queue lets the writer drain and run the terminal
        // cleanup (registry removal, subscription purge).
        self.conn.close();
        debug!(addr = %self.conn.addr, "reader: done");
    }

    async fn read_loop(&mut self) -> Result<(), ConnectionError> {
        let mut closed = self.conn.closed();
        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => return Ok(()),
                        Ok(_) => {
                            while let Some((packet, consumed)) =
                                self.decoder.decode(&self.read_buf)?
                            {
                                self.read_buf.advance(consumed);
                                match self.handle_packet(packet).await? {
                                    Flow::Continue => {}
                                    Flow::Close => return Ok(()),
                                }
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                // The writer tears the connection down on write errors and
                // after DISCONNECT; stop reading when that happens.
                _ = closed.changed() => return Ok(()),
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::Connect(connect) => match self.state {
                State::Fresh => self.handle_connect(*connect).await,
                State::Named => {
                    warn!(client_id = %self.conn.client_id(), "duplicate CONNECT");
                    Ok(Flow::Close)
                }
            },
            Packet::Publish(publish) => match self.state {
                State::Named => self.handle_publish(publish).await,
                State::Fresh => Ok(Flow::Close),
            },
            Packet::Subscribe(subscribe) => match self.state {
                State::Named => self.handle_subscribe(subscribe).await,
                State::Fresh => Ok(Flow::Close),
            },
            Packet::Unsubscribe(unsubscribe) => match self.state {
                State::Named => self.handle_unsubscribe(unsubscribe).await,
                State::Fresh => Ok(Flow::Close),
            },
            Packet::PingReq => match self.state {
                State::Named => {
                    self.conn.submit(Packet::PingResp).await;
                    Ok(Flow::Continue)
                }
                State::Fresh => Ok(Flow::Close),
            },
            Packet::Disconnect => Ok(Flow::Close),
            other => {
                warn!(
                    addr = %self.conn.addr,
                    packet_type = other.packet_type(),
                    "unexpected packet from client"
                );
                Ok(Flow::Close)
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<Flow, ConnectionError> {
        let mut code = ReturnCode::Accepted;

        if connect.protocol_name != PROTOCOL_NAME || connect.protocol_version != PROTOCOL_VERSION {
            info!(
                addr = %self.conn.addr,
                protocol = %connect.protocol_name,
                version = connect.protocol_version,
                "rejecting connection"
            );
            code = ReturnCode::UnacceptableProtocolVersion;
        }

        if connect.client_id.is_empty() || connect.client_id.len() > MAX_CLIENT_ID_LEN {
            code = ReturnCode::IdentifierRejected;
        }

        if code == ReturnCode::Accepted {
            self.conn.set_client_id(&connect.client_id);

            // One session per identifier: tell any prior connection to go
            // away and wait until its writer has flushed the DISCONNECT.
            if let Some(displaced) = self.registry.register(self.conn.clone()) {
                debug!(client_id = %connect.client_id, "displacing existing session");
                if let Some(receipt) = displaced.submit_await(Packet::Disconnect).await {
                    let _ = receipt.await;
                }
            }
        }

        self.conn
            .submit(Packet::ConnAck(ConnAck { return_code: code }))
            .await;

        if code != ReturnCode::Accepted {
            return Ok(Flow::Close);
        }

        debug!(client_id = %connect.client_id, addr = %self.conn.addr, "session established");
        self.state = State::Named;
        Ok(Flow::Continue)
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<Flow, ConnectionError> {
        if publish.qos != QoS::AtMostOnce {
            warn!(
                client_id = %self.conn.client_id(),
                qos = publish.qos as u8,
                "no support for this QoS level"
            );
            return Ok(Flow::Close);
        }

        let message_id = publish.message_id;
        if topic::is_wildcard(&publish.topic) {
            debug!(
                client_id = %self.conn.client_id(),
                topic = %publish.topic,
                "ignoring PUBLISH with wildcard topic"
            );
        } else {
            // Blocks when the dispatch queue is full: backpressure to this
            // publisher only.
            self.dispatcher
                .submit(Post {
                    from: self.conn.clone(),
                    publish,
                })
                .await;
        }

        self.conn
            .submit(Packet::PubAck(PubAck {
                message_id: message_id.unwrap_or(0),
            }))
            .await;
        Ok(Flow::Continue)
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<Flow, ConnectionError> {
        let mut granted_qos = Vec::with_capacity(subscribe.topics.len());
        for tq in &subscribe.topics {
            self.subscriptions.add(&tq.topic, &self.conn);
            granted_qos.push(QoS::AtLeastOnce);
            debug!(client_id = %self.conn.client_id(), filter = %tq.topic, "subscribed");
        }

        self.conn
            .submit(Packet::SubAck(SubAck {
                message_id: subscribe.message_id,
                granted_qos,
            }))
            .await;

        // Replay retained messages after the SUBACK, one pass per filter.
        for tq in &subscribe.topics {
            for publish in self.subscriptions.retained_for(&tq.topic) {
                self.conn.submit(Packet::Publish(publish)).await;
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<Flow, ConnectionError> {
        for filter in &unsubscribe.topics {
            self.subscriptions.unsubscribe(filter, &self.conn);
            debug!(client_id = %self.conn.client_id(), filter = %filter, "unsubscribed");
        }

        self.conn
            .submit(Packet::UnsubAck(UnsubAck {
                message_id: unsubscribe.message_id,
            }))
            .await;
        Ok(Flow::Continue)
    }
}

struct Writer {
    conn: Arc<Connection>,
    stream: OwnedWriteHalf,
    encoder: Encoder,
    write_buf: BytesMut,
    jobs: mpsc::Receiver<Job>,
    subscriptions: Arc<SubscriptionTable>,
    registry: Arc<ClientRegistry>,
}

impl Writer {
    async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            let result = self.write_packet(&job.packet).await;

            // Fire the receipt regardless of outcome so a task blocked in
            // submit_await always makes progress.
            if let Some(receipt) = job.receipt {
                let _ = receipt.send(());
            }

            match result {
                Ok(()) => {
                    if matches!(job.packet, Packet::Disconnect) {
                        debug!(client_id = %self.conn.client_id(), "writer: sent DISCONNECT");
                        break;
                    }
                }
                Err(e) if is_benign_disconnect(&e) => {
                    // Clients regularly disappear before we flush their acks.
                    debug!(client_id = %self.conn.client_id(), "writer: {}", e);
                    break;
                }
                Err(e) => {
                    warn!(client_id = %self.conn.client_id(), "writer: {}", e);
                    break;
                }
            }
        }

        // Terminal cleanup. Shutting the transport down unblocks the
        // reader; the registry entry and every subscription reference are
        // gone before the done signal flips.
        self.conn.close();
        let _ = self.stream.shutdown().await;
        self.registry.deregister(&self.conn);
        self.subscriptions.unsubscribe_all(&self.conn);
        self.conn.done.send_replace(true);
        debug!(addr = %self.conn.addr, "writer: done");
    }

    async fn write_packet(&mut self, packet: &Packet) -> io::Result<()> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&self.write_buf).await
    }
}

/// Write failures that just mean the peer went away first.
fn is_benign_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
