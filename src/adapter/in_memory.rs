//! A process-local bus, mainly aimed at testing.
//!
//! A [`Broker`] fans every published message out to every registered
//! adapter; each [`InMemoryAdapter`] filters against its own topic set
//! before handing messages to its facade. Broadcast is linear in the number
//! of adapters; this is a fixture, not an optimized router.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::adapter::{Adapter, Pipe};
use crate::util::Stopper;
use crate::{BoxError, Error, Message};

const BROKER_DEPTH: usize = 10;
const NOTICE_DEPTH: usize = 10;

/// Errors returned by the in-memory adapter's control calls.
///
/// The facade only issues subscribe/unsubscribe on refcount transitions, so
/// hitting either of these means the adapter was driven by hand.
#[derive(Debug, ThisError)]
pub enum InMemoryError {
    #[error("already subscribed")]
    AlreadySubscribed,
    #[error("not subscribed")]
    NotSubscribed,
}

/// A shared in-process message broker.
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    adapters: StdRwLock<HashMap<u64, mpsc::Sender<Message>>>,
    next_id: AtomicU64,
    messages_tx: mpsc::Sender<Message>,
    stopper: Stopper,
}

impl Broker {
    /// Create a broker and spawn its fan-out worker. Must be called within a
    /// Tokio runtime.
    pub fn new() -> Self {
        let (messages_tx, messages_rx) = mpsc::channel(BROKER_DEPTH);
        let inner = Arc::new(BrokerInner {
            adapters: StdRwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            messages_tx,
            stopper: Stopper::new(),
        });
        tokio::spawn(broker_worker(Arc::clone(&inner), messages_rx));
        Self { inner }
    }

    /// Stop the broker and its worker. Registered adapters stop receiving
    /// messages but stay registered until they are stopped themselves.
    pub fn close(&self) {
        self.inner.stopper.stop();
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerInner {
    fn register(&self, id: u64, notices: mpsc::Sender<Message>) {
        let mut adapters = self.adapters.write().unwrap();
        if adapters.insert(id, notices).is_some() {
            panic!("BUG: the same adapter was registered more than once");
        }
    }

    fn unregister(&self, id: u64) {
        let mut adapters = self.adapters.write().unwrap();
        if adapters.remove(&id).is_none() {
            panic!("BUG: unregistering an adapter that is not registered");
        }
    }
}

async fn broker_worker(inner: Arc<BrokerInner>, mut messages: mpsc::Receiver<Message>) {
    loop {
        tokio::select! {
            biased;
            _ = inner.stopper.wait_stopped() => return,
            msg = messages.recv() => {
                let Some(msg) = msg else { return };
                let notice_queues: Vec<_> =
                    inner.adapters.read().unwrap().values().cloned().collect();
                for queue in notice_queues {
                    // An adapter that went away mid-broadcast just misses out.
                    let _ = queue.send(msg.clone()).await;
                }
            }
        }
    }
}

/// An [`Adapter`] that moves messages through a shared [`Broker`].
pub struct InMemoryAdapter {
    shared: Arc<AdapterShared>,
}

struct AdapterShared {
    broker: Arc<BrokerInner>,
    id: u64,
    topics: StdRwLock<HashSet<String>>,
    notices_tx: mpsc::Sender<Message>,
    notices_rx: StdMutex<Option<mpsc::Receiver<Message>>>,
    stopper: Stopper,
}

impl InMemoryAdapter {
    /// Create an adapter attached to `broker`. Registration with the broker
    /// happens in [`start`](Adapter::start).
    pub fn new(broker: &Broker) -> Self {
        let (notices_tx, notices_rx) = mpsc::channel(NOTICE_DEPTH);
        let id = broker.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::new(AdapterShared {
                broker: Arc::clone(&broker.inner),
                id,
                topics: StdRwLock::new(HashSet::new()),
                notices_tx,
                notices_rx: StdMutex::new(Some(notices_rx)),
                stopper: Stopper::new(),
            }),
        }
    }
}

#[async_trait]
impl Adapter for InMemoryAdapter {
    fn start(&self, pipe: Pipe) {
        let notices = self
            .shared
            .notices_rx
            .lock()
            .unwrap()
            .take()
            .expect("BUG: in-memory adapter started more than once");
        self.shared
            .broker
            .register(self.shared.id, self.shared.notices_tx.clone());
        tokio::spawn(adapter_worker(Arc::clone(&self.shared), notices, pipe));
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BoxError> {
        let mut topics = self.shared.topics.write().unwrap();
        if !topics.insert(topic.to_string()) {
            return Err(InMemoryError::AlreadySubscribed.into());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BoxError> {
        let mut topics = self.shared.topics.write().unwrap();
        if !topics.remove(topic) {
            return Err(InMemoryError::NotSubscribed.into());
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.shared.stopper.is_stopped() {
            return;
        }
        self.shared.stopper.stop();
        self.shared.broker.unregister(self.shared.id);
    }
}

async fn adapter_worker(
    shared: Arc<AdapterShared>,
    mut notices: mpsc::Receiver<Message>,
    pipe: Pipe,
) {
    let Pipe {
        mut outgoing,
        delivered,
        errors,
    } = pipe;
    loop {
        tokio::select! {
            biased;
            _ = shared.stopper.wait_stopped() => return,
            msg = notices.recv() => {
                let Some(msg) = msg else { return };
                if !shared.topics.read().unwrap().contains(&msg.topic) {
                    continue;
                }
                match delivered.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        if errors.try_send(Error::SlowConsumer).is_err() {
                            trace!("error queue full; discarding");
                        }
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            msg = outgoing.recv() => {
                let Some(msg) = msg else { return };
                if shared.broker.messages_tx.send(msg).await.is_err() {
                    // The broker worker is gone; nothing left to publish to.
                    return;
                }
            }
        }
    }
}
