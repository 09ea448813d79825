//! Minimal MQTT 3.1 client
//!
//! Speaks the same wire protocol as the broker: a reader task routes
//! incoming frames, a writer task drains an outbound job queue. PUBLISH
//! frames arrive through [`Client::recv`]; SUBSCRIBE, UNSUBSCRIBE and
//! PINGREQ wait for their acknowledgements. Only QoS 0 publication is
//! offered, matching the broker.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::broker::Job;
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Connect, DecodeError, Packet, Publish, QoS, ReturnCode, SubAck, Subscribe, TopicQos, UnsubAck,
    Unsubscribe,
};

/// Client error types
#[derive(Debug)]
pub enum ClientError {
    /// Transport failure
    Io(io::Error),
    /// Frame could not be decoded
    Decode(DecodeError),
    /// Broker refused the connection
    Refused(ReturnCode),
    /// The connection closed under the operation
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "IO error: {}", e),
            ClientError::Decode(e) => write!(f, "decode error: {}", e),
            ClientError::Refused(code) => write!(f, "connection refused: {}", code),
            ClientError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

const QUEUE_LENGTH: usize = 100;

/// Shared state between the client's reader and writer tasks.
#[derive(Debug)]
struct Shared {
    out: Mutex<Option<mpsc::Sender<Job>>>,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.out.lock().clone()
    }

    fn close(&self) {
        self.out.lock().take();
        self.shutdown.send_replace(true);
    }
}

/// An MQTT 3.1 client connection.
#[derive(Debug)]
pub struct Client {
    client_id: String,
    shared: Arc<Shared>,
    incoming: mpsc::Receiver<Publish>,
    acks: mpsc::Receiver<Packet>,
    next_message_id: u16,
}

impl Client {
    /// Connect to a broker and complete the CONNECT/CONNACK handshake with
    /// the clean-session flag set. Without an explicit identifier a random
    /// one is generated.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        client_id: Option<&str>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let client_id = client_id
            .map(str::to_owned)
            .unwrap_or_else(|| format!("chirpmq-{:08x}", rand_id() as u32));

        let (out_tx, out_rx) = mpsc::channel(QUEUE_LENGTH);
        let (incoming_tx, incoming) = mpsc::channel(QUEUE_LENGTH);
        let (acks_tx, acks) = mpsc::channel(16);
        let (shutdown, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            out: Mutex::new(Some(out_tx)),
            shutdown,
            done,
        });

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(read_task(read_half, shared.clone(), incoming_tx, acks_tx));
        tokio::spawn(write_task(write_half, shared.clone(), out_rx));

        let mut client = Self {
            client_id,
            shared,
            incoming,
            acks,
            next_message_id: 0,
        };

        client
            .send_sync(Packet::Connect(Box::new(Connect {
                client_id: client.client_id.clone(),
                clean_session: true,
                ..Connect::default()
            })))
            .await?;

        match client.acks.recv().await {
            Some(Packet::ConnAck(ack)) if ack.return_code == ReturnCode::Accepted => Ok(client),
            Some(Packet::ConnAck(ack)) => Err(ClientError::Refused(ack.return_code)),
            _ => Err(ClientError::Closed),
        }
    }

    /// The identifier this session connected with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue a QoS 0 publication. Resolves once the frame is queued, not
    /// when it is written.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.send(Packet::Publish(Publish {
            retain,
            topic: Arc::from(topic),
            payload: payload.into(),
            ..Publish::default()
        }))
        .await
    }

    /// Subscribe to one or more topic filters and wait for the SUBACK.
    pub async fn subscribe(&mut self, filters: &[&str]) -> Result<SubAck, ClientError> {
        let message_id = self.next_message_id();
        self.send(Packet::Subscribe(Subscribe {
            message_id,
            topics: filters
                .iter()
                .map(|f| TopicQos {
                    topic: (*f).to_string(),
                    qos: QoS::AtMostOnce,
                })
                .collect(),
        }))
        .await?;

        loop {
            match self.acks.recv().await {
                Some(Packet::SubAck(ack)) if ack.message_id == message_id => return Ok(ack),
                Some(_) => continue,
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Unsubscribe from topic filters and wait for the UNSUBACK.
    pub async fn unsubscribe(&mut self, filters: &[&str]) -> Result<UnsubAck, ClientError> {
        let message_id = self.next_message_id();
        self.send(Packet::Unsubscribe(Unsubscribe {
            message_id,
            topics: filters.iter().map(|f| (*f).to_string()).collect(),
        }))
        .await?;

        loop {
            match self.acks.recv().await {
                Some(Packet::UnsubAck(ack)) if ack.message_id == message_id => return Ok(ack),
                Some(_) => continue,
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Send a PINGREQ and wait for the PINGRESP.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.send(Packet::PingReq).await?;
        loop {
            match self.acks.recv().await {
                Some(Packet::PingResp) => return Ok(()),
                Some(_) => continue,
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Next incoming PUBLISH, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Publish> {
        self.incoming.recv().await
    }

    /// Observe the terminal-done signal of this connection.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.shared.done.subscribe()
    }

    /// Send DISCONNECT, then wait until the frame is flushed and the
    /// connection has closed.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        self.send_sync(Packet::Disconnect).await?;
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|d| *d).await;
        Ok(())
    }

    fn next_message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        self.next_message_id
    }

    async fn send(&self, packet: Packet) -> Result<(), ClientError> {
        let tx = self.shared.sender().ok_or(ClientError::Closed)?;
        tx.send(Job {
            packet,
            receipt: None,
        })
        .await
        .map_err(|_| ClientError::Closed)
    }

    /// Queue a frame and block until the writer has put it on the wire.
    async fn send_sync(&self, packet: Packet) -> Result<(), ClientError> {
        let tx = self.shared.sender().ok_or(ClientError::Closed)?;
        let (receipt_tx, receipt_rx) = oneshot::channel();
        tx.send(Job {
            packet,
            receipt: Some(receipt_tx),
        })
        .await
        .map_err(|_| ClientError::Closed)?;
        receipt_rx.await.map_err(|_| ClientError::Closed)
    }
}

async fn read_task(
    mut stream: OwnedReadHalf,
    shared: Arc<Shared>,
    incoming: mpsc::Sender<Publish>,
    acks: mpsc::Sender<Packet>,
) {
    let decoder = Decoder::new();
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut closed = shared.shutdown.subscribe();

    'outer: loop {
        tokio::select! {
            result = stream.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("client reader: {}", e);
                        break;
                    }
                }

                loop {
                    let (packet, consumed) = match decoder.decode(&read_buf) {
                        Ok(Some(decoded)) => decoded,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("client reader: {}", e);
                            break 'outer;
                        }
                    };
                    read_buf.advance(consumed);

                    match packet {
                        Packet::Publish(publish) => {
                            if incoming.send(publish).await.is_err() {
                                break 'outer;
                            }
                        }
                        Packet::ConnAck(_)
                        | Packet::SubAck(_)
                        | Packet::UnsubAck(_)
                        | Packet::PingResp => {
                            if acks.send(packet).await.is_err() {
                                break 'outer;
                            }
                        }
                        Packet::Disconnect => break 'outer,
                        other => {
                            debug!(packet_type = other.packet_type(), "client reader: ignoring");
                        }
                    }
                }
            }
            _ = closed.changed() => break,
        }
    }

    shared.close();
    debug!("client reader: done");
}

async fn write_task(mut stream: OwnedWriteHalf, shared: Arc<Shared>, mut jobs: mpsc::Receiver<Job>) {
    let encoder = Encoder::new();
    let mut write_buf = BytesMut::with_capacity(4096);

    while let Some(job) = jobs.recv().await {
        write_buf.clear();
        let result = match encoder.encode(&job.packet, &mut write_buf) {
            Ok(()) => stream.write_all(&write_buf).await,
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };

        if let Some(receipt) = job.receipt {
            let _ = receipt.send(());
        }

        if let Err(e) = result {
            debug!("client writer: {}", e);
            break;
        }
        if matches!(job.packet, Packet::Disconnect) {
            break;
        }
    }

    shared.close();
    let _ = stream.shutdown().await;
    shared.done.send_replace(true);
    debug!("client writer: done");
}

/// Random identifier suffix without pulling in an RNG dependency.
fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish()
}
