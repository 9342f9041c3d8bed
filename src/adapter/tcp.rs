//! A reference broker and [`RemoteClient`] speaking a small framed protocol
//! over TCP.
//!
//! Frames are postcard-encoded, COBS-framed and zero-delimited on the wire.
//! The client batches publishes through a write buffer, so it pairs with
//! [`RemoteAdapter`](crate::adapter::remote::RemoteAdapter)'s periodic
//! flush; subscribe and unsubscribe are flushed before returning.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::adapter::remote::RemoteClient;
use crate::util::Stopper;
use crate::{BoxError, Message};

const MAX_FRAME: usize = 1024 * 1024;
const RECEIVED_DEPTH: usize = 64;
const COMMAND_DEPTH: usize = 64;
const CONN_DEPTH: usize = 64;

/// Errors of the TCP wire itself.
#[derive(Debug, ThisError)]
pub enum TcpError {
    #[error("connection closed")]
    Closed,
    #[error("frame exceeds the 1 MiB limit")]
    Oversized,
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Publish { topic: String, payload: Vec<u8> },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Deliver { topic: String, payload: Vec<u8> },
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let raw = postcard::to_stdvec(frame).expect("allocations should never fail");
    let mut out = cobs::encode_vec(&raw);
    out.push(0);
    out
}

/// Accumulates bytes off a reader and yields whole frames.
struct FrameReader<T> {
    rx: T,
    buf: Vec<u8>,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    fn new(rx: T) -> Self {
        Self { rx, buf: Vec::new() }
    }

    async fn next(&mut self) -> Result<Frame, TcpError> {
        let mut rx_buf = [0u8; 1024];
        'frame: loop {
            if self.buf.len() > MAX_FRAME {
                self.buf.clear();
                return Err(TcpError::Oversized);
            }

            // Do we have a whole frame already?
            if let Some(pos) = self.buf.iter().position(|b| *b == 0) {
                let mut rest = self.buf.split_off(pos + 1);
                core::mem::swap(&mut self.buf, &mut rest);

                let Ok(raw) = cobs::decode_vec(&rest) else {
                    warn!(discarded = rest.len(), "discarding bad frame (cobs)");
                    continue 'frame;
                };
                match postcard::from_bytes(&raw) {
                    Ok(frame) => return Ok(frame),
                    Err(_) => {
                        warn!(discarded = raw.len(), "discarding bad frame (postcard)");
                        continue 'frame;
                    }
                }
            }

            let Ok(used) = self.rx.read(&mut rx_buf).await else {
                return Err(TcpError::Closed);
            };
            if used == 0 {
                return Err(TcpError::Closed);
            }
            self.buf.extend_from_slice(&rx_buf[..used]);
        }
    }
}

enum Command {
    /// Write into the buffer without flushing.
    Write(Frame),
    /// Write, flush, and acknowledge.
    WriteFlush(Frame, oneshot::Sender<Result<(), BoxError>>),
    /// Flush buffered writes and acknowledge.
    Flush(oneshot::Sender<Result<(), BoxError>>),
}

/// A [`RemoteClient`] over one TCP connection to a [`TcpBroker`].
pub struct TcpClient {
    commands: mpsc::Sender<Command>,
    stopper: Stopper,
}

impl TcpClient {
    /// Connect to a broker. Returns the client plus its receive queue and
    /// its asynchronous error queue, ready to hand to
    /// [`RemoteAdapter::new`](crate::adapter::remote::RemoteAdapter::new).
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
    ) -> std::io::Result<(TcpClient, mpsc::Receiver<Message>, mpsc::Receiver<BoxError>)> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        let (rx_half, tx_half) = split(stream);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_DEPTH);
        let (received_tx, received_rx) = mpsc::channel(RECEIVED_DEPTH);
        let (errors_tx, errors_rx) = mpsc::channel(RECEIVED_DEPTH);
        let stopper = Stopper::new();

        tokio::spawn(client_write_worker(tx_half, commands_rx, stopper.clone()));
        tokio::spawn(client_read_worker(
            rx_half,
            peer,
            received_tx,
            errors_tx,
            stopper.clone(),
        ));

        Ok((
            TcpClient {
                commands: commands_tx,
                stopper,
            },
            received_rx,
            errors_rx,
        ))
    }

    async fn request(&self, frame: Frame) -> Result<(), BoxError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::WriteFlush(frame, ack_tx))
            .await
            .map_err(|_| TcpError::Closed)?;
        ack_rx.await.map_err(|_| TcpError::Closed)?
    }
}

#[async_trait]
impl RemoteClient for TcpClient {
    async fn publish(&self, message: &Message) -> Result<(), BoxError> {
        self.commands
            .send(Command::Write(Frame::Publish {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
            }))
            .await
            .map_err(|_| TcpError::Closed.into())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BoxError> {
        self.request(Frame::Subscribe {
            topic: topic.to_string(),
        })
        .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BoxError> {
        self.request(Frame::Unsubscribe {
            topic: topic.to_string(),
        })
        .await
    }

    async fn flush(&self) -> Result<(), BoxError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| TcpError::Closed)?;
        ack_rx.await.map_err(|_| TcpError::Closed)?
    }

    async fn close(&self) {
        self.stopper.stop();
    }
}

async fn client_write_worker(
    tx: WriteHalf<TcpStream>,
    mut commands: mpsc::Receiver<Command>,
    stopper: Stopper,
) {
    let mut tx = BufWriter::new(tx);
    loop {
        tokio::select! {
            biased;
            _ = stopper.wait_stopped() => {
                let _ = tx.shutdown().await;
                return;
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    let _ = tx.shutdown().await;
                    return;
                };
                match cmd {
                    Command::Write(frame) => {
                        if let Err(e) = tx.write_all(&encode_frame(&frame)).await {
                            warn!(error = %e, "tcp write failed, closing");
                            stopper.stop();
                            return;
                        }
                    }
                    Command::WriteFlush(frame, ack) => {
                        let res = async {
                            tx.write_all(&encode_frame(&frame)).await?;
                            tx.flush().await
                        }
                        .await;
                        let failed = res.is_err();
                        let _ = ack.send(res.map_err(BoxError::from));
                        if failed {
                            stopper.stop();
                            return;
                        }
                    }
                    Command::Flush(ack) => {
                        let res = tx.flush().await;
                        let failed = res.is_err();
                        let _ = ack.send(res.map_err(BoxError::from));
                        if failed {
                            stopper.stop();
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn client_read_worker(
    rx: ReadHalf<TcpStream>,
    peer: SocketAddr,
    received: mpsc::Sender<Message>,
    errors: mpsc::Sender<BoxError>,
    stopper: Stopper,
) {
    let mut reader = FrameReader::new(rx);
    loop {
        tokio::select! {
            biased;
            _ = stopper.wait_stopped() => return,
            frame = reader.next() => {
                match frame {
                    Ok(Frame::Deliver { topic, payload }) => {
                        if received.send(Message { topic, payload }).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => warn!(%peer, "unexpected frame from broker"),
                    Err(e) => {
                        if !stopper.is_stopped() {
                            let _ = errors.try_send(e.into());
                        }
                        stopper.stop();
                        return;
                    }
                }
            }
        }
    }
}

/// A minimal topic-aware message broker.
///
/// Every connection may publish to any topic and subscribe to any set of
/// topics; each publish is fanned out to every connection currently
/// subscribed, including the publisher itself. A connection whose outbound
/// queue is full misses the message.
pub struct TcpBroker {
    local_addr: SocketAddr,
    stopper: Stopper,
}

struct BrokerState {
    conns: StdMutex<HashMap<u64, ConnHandle>>,
    next_id: AtomicU64,
}

struct ConnHandle {
    frames: mpsc::Sender<Frame>,
    topics: HashSet<String>,
}

impl TcpBroker {
    /// Bind and start accepting connections.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let stopper = Stopper::new();
        let state = Arc::new(BrokerState {
            conns: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });
        tokio::spawn(accept_worker(listener, state, stopper.clone()));
        Ok(Self {
            local_addr,
            stopper,
        })
    }

    /// The address the broker is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop all connections.
    pub fn close(&self) {
        self.stopper.stop();
    }
}

async fn accept_worker(listener: TcpListener, state: Arc<BrokerState>, stopper: Stopper) {
    loop {
        tokio::select! {
            biased;
            _ = stopper.wait_stopped() => return,
            res = listener.accept() => {
                let Ok((stream, peer)) = res else { continue };
                let id = state.next_id.fetch_add(1, Ordering::Relaxed);
                let (rx_half, tx_half) = split(stream);
                let (frames_tx, frames_rx) = mpsc::channel(CONN_DEPTH);
                state.conns.lock().unwrap().insert(
                    id,
                    ConnHandle {
                        frames: frames_tx,
                        topics: HashSet::new(),
                    },
                );
                debug!(%peer, id, "connection accepted");
                tokio::spawn(conn_write_worker(tx_half, frames_rx, stopper.clone()));
                tokio::spawn(conn_read_worker(rx_half, id, Arc::clone(&state), stopper.clone()));
            }
        }
    }
}

async fn conn_write_worker(
    tx: WriteHalf<TcpStream>,
    mut frames: mpsc::Receiver<Frame>,
    stopper: Stopper,
) {
    let mut tx = BufWriter::new(tx);
    loop {
        tokio::select! {
            biased;
            _ = stopper.wait_stopped() => {
                let _ = tx.shutdown().await;
                return;
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    let _ = tx.shutdown().await;
                    return;
                };
                if tx.write_all(&encode_frame(&frame)).await.is_err()
                    || tx.flush().await.is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn conn_read_worker(
    rx: ReadHalf<TcpStream>,
    id: u64,
    state: Arc<BrokerState>,
    stopper: Stopper,
) {
    let mut reader = FrameReader::new(rx);
    loop {
        tokio::select! {
            biased;
            _ = stopper.wait_stopped() => break,
            frame = reader.next() => {
                match frame {
                    Ok(Frame::Publish { topic, payload }) => {
                        let conns = state.conns.lock().unwrap();
                        for conn in conns.values() {
                            if conn.topics.contains(&topic) {
                                let _ = conn.frames.try_send(Frame::Deliver {
                                    topic: topic.clone(),
                                    payload: payload.clone(),
                                });
                            }
                        }
                    }
                    Ok(Frame::Subscribe { topic }) => {
                        if let Some(conn) = state.conns.lock().unwrap().get_mut(&id) {
                            conn.topics.insert(topic);
                        }
                    }
                    Ok(Frame::Unsubscribe { topic }) => {
                        if let Some(conn) = state.conns.lock().unwrap().get_mut(&id) {
                            conn.topics.remove(&topic);
                        }
                    }
                    Ok(Frame::Deliver { .. }) => {
                        warn!(id, "unexpected deliver frame from a client");
                    }
                    Err(_) => break,
                }
            }
        }
    }
    state.conns.lock().unwrap().remove(&id);
    debug!(id, "connection closed");
}
