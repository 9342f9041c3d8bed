//! The contract between the facade and a backend driver.
//!
//! An adapter owns all backend-specific plumbing (connections, wire formats,
//! broker clients). The facade talks to it exclusively through the three
//! queues of a [`Pipe`], handed over once at start-up, plus the
//! subscribe/unsubscribe control calls.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{BoxError, Error, Message};

pub mod in_memory;
pub mod remote;
pub mod tcp;

/// The channel triple linking a facade to one adapter.
///
/// The facade owns the lifetime of all three queues; an adapter never closes
/// them. Capacities come from the facade's [`Config`](crate::Config).
pub struct Pipe {
    /// Messages the application published, to be forwarded to the backend.
    pub outgoing: mpsc::Receiver<Message>,
    /// Messages arriving from the backend, to be fanned out to subscribers.
    ///
    /// Pushes must use `try_send`: when this queue is full the adapter drops
    /// the message and reports [`Error::SlowConsumer`] instead of waiting.
    pub delivered: mpsc::Sender<Message>,
    /// Asynchronous adapter errors, surfaced to the application via
    /// [`PubSub::errors`](crate::PubSub::errors). Pushes must use `try_send`;
    /// errors are advisory and are dropped when the queue is full.
    pub errors: mpsc::Sender<Error>,
}

/// A backend driver: something that can carry [`Message`]s between
/// processes and maintain per-topic subscriptions.
///
/// The facade guarantees that `subscribe` is only called when a topic gains
/// its first local subscriber and `unsubscribe` only when it loses its last
/// one, so implementations do not need their own refcounting.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Take ownership of the pipe and spawn whatever workers the backend
    /// needs. Called exactly once; once it returns, the adapter must be
    /// ready to drain `outgoing` and feed `delivered`.
    ///
    /// # Panics
    ///
    /// Implementations panic when started twice; that is a programming
    /// error, not a runtime condition.
    fn start(&self, pipe: Pipe);

    /// Ask the backend to deliver messages for `topic`.
    async fn subscribe(&self, topic: &str) -> Result<(), BoxError>;

    /// Ask the backend to stop delivering messages for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), BoxError>;

    /// Halt workers and release backend resources. Must be idempotent; the
    /// facade may call it again after close.
    async fn stop(&self);
}
