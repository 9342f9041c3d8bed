//! Broker-agnostic publish/subscribe for typed values.
//!
//! `postbus` sits between application code and a message broker. Published
//! values are serialized with a pluggable [`Codec`], carried as opaque bytes
//! by a swappable backend [`Adapter`](adapter::Adapter), and handed back as
//! typed values on per-subscriber [`tokio::sync::mpsc`] channels. Any number
//! of local subscribers to the same topic share a single backend
//! subscription; the backend is subscribed to a topic exactly while at least
//! one local subscriber wants it.
//!
//! Delivery is best-effort and never blocks the fan-out path: a subscriber
//! that stops draining its channel loses messages, and a
//! [`Error::SlowConsumer`] notice is published on the error stream instead.
//!
//! ```no_run
//! use postbus::adapter::in_memory::{Broker, InMemoryAdapter};
//! use postbus::PubSub;
//! use tokio::sync::mpsc;
//!
//! # async fn demo() {
//! let broker = Broker::new();
//! let pubsub = PubSub::new(InMemoryAdapter::new(&broker));
//!
//! let (tx, mut rx) = mpsc::channel::<String>(16);
//! let subscription = pubsub.subscribe("room:123", tx).await.unwrap();
//!
//! pubsub.publish("room:123", "hello").await.unwrap();
//! let greeting = rx.recv().await.unwrap();
//!
//! subscription.unsubscribe().await.unwrap();
//! pubsub.close().await;
//! # let _ = greeting;
//! # }
//! ```

pub mod adapter;
pub mod codec;
mod pubsub;
mod util;

#[cfg(feature = "json")]
pub use codec::Json;
pub use codec::{Codec, CodecError, Postcard};
pub use pubsub::{
    Config, Error, PubSub, PublishError, SubscribeError, Subscription, UnsubscribeError,
};

/// An opaque backend error, passed through the facade unchanged.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A topic plus an opaque serialized payload, as carried between the facade
/// and an adapter. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The topic this message was published to. Restrictions on topic names
    /// (length, allowed characters) are up to the concrete backend.
    pub topic: String,
    /// The serialized payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message from a topic and an already-encoded payload.
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}
