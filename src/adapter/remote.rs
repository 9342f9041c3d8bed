//! An [`Adapter`] that drives a remote broker through a client object.
//!
//! The wrapper is generic over [`RemoteClient`], which models the part of a
//! broker client library the facade cares about: publish, subscribe and
//! unsubscribe calls, an explicit flush for clients that buffer writes, and
//! close. The client additionally hands over two queues at construction
//! time: its inbound message stream and its asynchronous error stream. The
//! wrapper bridges both into the facade's pipe, applies a per-call timeout
//! to every client call, and runs a periodic flush.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, timeout, Instant};
use tracing::trace;

use crate::adapter::{Adapter, Pipe};
use crate::util::Stopper;
use crate::{BoxError, Error, Message};

/// Configuration of a [`RemoteAdapter`].
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Upper bound on any single client call (publish, subscribe,
    /// unsubscribe, flush).
    pub call_timeout: Duration,
    /// How often the wrapper asks the client to flush buffered writes.
    pub flush_interval: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Errors produced by the wrapper itself rather than the client.
#[derive(Debug, ThisError)]
pub enum RemoteError {
    #[error("remote backend call timed out")]
    Timeout,
}

/// The slice of a broker client library the adapter needs.
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    /// Send one message to the broker. May buffer; [`flush`](Self::flush)
    /// forces buffered messages out.
    async fn publish(&self, message: &Message) -> Result<(), BoxError>;

    /// Ask the broker to deliver messages for `topic` on the receive queue
    /// supplied at construction.
    async fn subscribe(&self, topic: &str) -> Result<(), BoxError>;

    /// The inverse of [`subscribe`](Self::subscribe).
    async fn unsubscribe(&self, topic: &str) -> Result<(), BoxError>;

    /// Force out any buffered writes.
    async fn flush(&self) -> Result<(), BoxError>;

    /// Tear down the connection.
    async fn close(&self);
}

/// Adapter wrapping a [`RemoteClient`].
pub struct RemoteAdapter<T: RemoteClient> {
    client: Arc<T>,
    config: RemoteConfig,
    // Handed to the worker on start.
    inbound: StdMutex<Option<(mpsc::Receiver<Message>, mpsc::Receiver<BoxError>)>>,
    stopper: Stopper,
}

impl<T: RemoteClient> RemoteAdapter<T> {
    /// Wrap `client`, taking ownership of its receive queue and its
    /// asynchronous error queue.
    pub fn new(
        client: T,
        received: mpsc::Receiver<Message>,
        client_errors: mpsc::Receiver<BoxError>,
    ) -> Self {
        Self::with_config(client, received, client_errors, RemoteConfig::default())
    }

    pub fn with_config(
        client: T,
        received: mpsc::Receiver<Message>,
        client_errors: mpsc::Receiver<BoxError>,
        config: RemoteConfig,
    ) -> Self {
        Self {
            client: Arc::new(client),
            config,
            inbound: StdMutex::new(Some((received, client_errors))),
            stopper: Stopper::new(),
        }
    }
}

#[async_trait]
impl<T: RemoteClient> Adapter for RemoteAdapter<T> {
    fn start(&self, pipe: Pipe) {
        let (received, client_errors) = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .expect("BUG: remote adapter started more than once");
        tokio::spawn(remote_worker(
            Arc::clone(&self.client),
            self.config.clone(),
            self.stopper.clone(),
            pipe,
            received,
            client_errors,
        ));
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BoxError> {
        match timeout(self.config.call_timeout, self.client.subscribe(topic)).await {
            Ok(res) => res,
            Err(_) => Err(RemoteError::Timeout.into()),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BoxError> {
        match timeout(self.config.call_timeout, self.client.unsubscribe(topic)).await {
            Ok(res) => res,
            Err(_) => Err(RemoteError::Timeout.into()),
        }
    }

    async fn stop(&self) {
        if self.stopper.is_stopped() {
            return;
        }
        self.stopper.stop();
        self.client.close().await;
    }
}

async fn remote_worker<T: RemoteClient>(
    client: Arc<T>,
    config: RemoteConfig,
    stopper: Stopper,
    pipe: Pipe,
    mut received: mpsc::Receiver<Message>,
    mut client_errors: mpsc::Receiver<BoxError>,
) {
    let Pipe {
        mut outgoing,
        delivered,
        errors,
    } = pipe;
    let mut flush = interval_at(
        Instant::now() + config.flush_interval,
        config.flush_interval,
    );
    let mut client_errors_open = true;
    loop {
        tokio::select! {
            biased;
            _ = stopper.wait_stopped() => return,
            msg = outgoing.recv() => {
                let Some(msg) = msg else { return };
                match timeout(config.call_timeout, client.publish(&msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => report(&errors, Error::Adapter(e)),
                    Err(_) => report(&errors, Error::Adapter(RemoteError::Timeout.into())),
                }
            }
            msg = received.recv() => {
                // The client's receive queue closing means the connection is
                // gone for good; the error queue will have said why.
                let Some(msg) = msg else { return };
                match delivered.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => report(&errors, Error::SlowConsumer),
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            err = client_errors.recv(), if client_errors_open => {
                match err {
                    Some(e) => report(&errors, Error::Adapter(e)),
                    None => client_errors_open = false,
                }
            }
            _ = flush.tick() => {
                match timeout(config.call_timeout, client.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => report(&errors, Error::Adapter(e)),
                    Err(_) => report(&errors, Error::Adapter(RemoteError::Timeout.into())),
                }
            }
        }
    }
}

fn report(errors: &mpsc::Sender<Error>, err: Error) {
    if errors.try_send(err).is_err() {
        trace!("error queue full; discarding");
    }
}
