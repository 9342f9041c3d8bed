//! The facade: typed publish/subscribe over one adapter.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error as ThisError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::adapter::{Adapter, Pipe};
use crate::codec::{Codec, CodecError, Postcard};
use crate::util::Stopper;
use crate::{BoxError, Message};

/// Queue capacities of a [`PubSub`]. All depths must be at least 1.
///
/// The per-subscriber flow-control knob is the capacity of the sink channel
/// passed to [`PubSub::subscribe`], not anything here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the queue between `publish` and the adapter.
    pub outgoing_depth: usize,
    /// Capacity of the queue between the adapter and the dispatcher.
    pub delivered_depth: usize,
    /// Capacity of the asynchronous error queue.
    pub error_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            outgoing_depth: 100,
            delivered_depth: 100,
            error_depth: 100,
        }
    }
}

/// Asynchronous errors, reported through [`PubSub::errors`].
#[derive(Debug, ThisError)]
pub enum Error {
    /// A sink (or the inbound delivery queue) was full; the message was
    /// discarded for that consumer.
    #[error("consumer is too slow; message discarded")]
    SlowConsumer,
    /// A delivered payload failed to decode for one sink; that sink was
    /// skipped.
    #[error("failed to decode delivered message")]
    Decode(#[source] CodecError),
    /// An error reported by the adapter: backend publish failures, flush
    /// failures, connection trouble. Passed through opaquely.
    #[error("adapter error: {0}")]
    Adapter(#[source] BoxError),
}

/// Errors returned synchronously from [`PubSub::publish`].
#[derive(Debug, ThisError)]
pub enum PublishError {
    /// The value could not be encoded; nothing was enqueued.
    #[error(transparent)]
    Encode(#[from] CodecError),
    /// The facade is closed.
    #[error("pubsub is closed")]
    Closed,
}

/// Errors returned synchronously from [`PubSub::subscribe`].
#[derive(Debug, ThisError)]
pub enum SubscribeError {
    /// The sink's receiver was already dropped, so it can never observe a
    /// message.
    #[error("sink must be a channel somebody is receiving on")]
    ClosedSink,
    /// The backend refused the subscription; the registration was rolled
    /// back.
    #[error("backend refused subscription: {0}")]
    Backend(#[source] BoxError),
    /// The facade is closed.
    #[error("pubsub is closed")]
    Closed,
}

/// Errors returned from [`Subscription::unsubscribe`].
#[derive(Debug, ThisError)]
pub enum UnsubscribeError {
    /// The backend refused to drop the subscription.
    #[error("backend refused unsubscription: {0}")]
    Backend(#[source] BoxError),
}

enum Delivery {
    Sent,
    Full,
    Gone,
    Failed(CodecError),
}

type DeliverFn = Box<dyn Fn(&[u8]) -> Delivery + Send + Sync>;

/// One registered (topic, sink) pair.
struct SinkEntry {
    id: u64,
    /// The original `mpsc::Sender<T>`, kept only to recognize a channel
    /// being subscribed to the same topic twice.
    sink: Box<dyn Any + Send + Sync>,
    deliver: DeliverFn,
}

pub(crate) struct Shared {
    adapter: Box<dyn Adapter>,
    subs: RwLock<HashMap<String, Vec<Arc<SinkEntry>>>>,
    errors_tx: mpsc::Sender<Error>,
    stopper: Stopper,
    next_id: AtomicU64,
}

impl Shared {
    fn report(&self, err: Error) {
        if self.errors_tx.try_send(err).is_err() {
            trace!("error queue full; discarding");
        }
    }
}

/// A typed publish/subscribe facade over one backend adapter.
///
/// Values published here are encoded with the codec `C`, carried as bytes
/// by the adapter, and decoded once per subscriber on delivery. The facade
/// keeps the backend subscribed to exactly the set of topics that currently
/// have at least one local subscriber.
pub struct PubSub<C: Codec = Postcard> {
    shared: Arc<Shared>,
    codec: Arc<C>,
    outgoing_tx: mpsc::Sender<Message>,
    errors_rx: StdMutex<Option<mpsc::Receiver<Error>>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl PubSub {
    /// Create a facade with the default codec and configuration, start the
    /// adapter, and spawn the dispatcher. Must be called within a Tokio
    /// runtime.
    pub fn new(adapter: impl Adapter) -> Self {
        Self::with_codec(adapter, Postcard, Config::default())
    }

    /// Like [`new`](Self::new) with custom queue depths.
    pub fn with_config(adapter: impl Adapter, config: Config) -> Self {
        Self::with_codec(adapter, Postcard, config)
    }
}

impl<C: Codec> PubSub<C> {
    /// Create a facade with a custom codec.
    pub fn with_codec(adapter: impl Adapter, codec: C, config: Config) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_depth);
        let (delivered_tx, delivered_rx) = mpsc::channel(config.delivered_depth);
        let (errors_tx, errors_rx) = mpsc::channel(config.error_depth);

        let shared = Arc::new(Shared {
            adapter: Box::new(adapter),
            subs: RwLock::new(HashMap::new()),
            errors_tx,
            stopper: Stopper::new(),
            next_id: AtomicU64::new(0),
        });

        shared.adapter.start(Pipe {
            outgoing: outgoing_rx,
            delivered: delivered_tx,
            errors: shared.errors_tx.clone(),
        });
        let dispatcher = tokio::spawn(dispatcher_worker(Arc::clone(&shared), delivered_rx));

        Self {
            shared,
            codec: Arc::new(codec),
            outgoing_tx,
            errors_rx: StdMutex::new(Some(errors_rx)),
            dispatcher: StdMutex::new(Some(dispatcher)),
        }
    }

    /// Publish `value` to `topic`.
    ///
    /// Encoding failures are returned directly and enqueue nothing. Once
    /// encoding succeeds, this waits for room on the outgoing queue; the
    /// future is cancel-safe, so dropping it (for example from inside
    /// [`tokio::time::timeout`]) guarantees the message was either fully
    /// enqueued or not at all. Everything after the enqueue, including
    /// backend send failures, is reported through [`errors`](Self::errors).
    pub async fn publish<T>(&self, topic: &str, value: &T) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized,
    {
        let payload = self.codec.encode(value)?;
        let msg = Message::new(topic, payload);
        tokio::select! {
            biased;
            _ = self.shared.stopper.wait_stopped() => Err(PublishError::Closed),
            res = self.outgoing_tx.send(msg) => res.map_err(|_| PublishError::Closed),
        }
    }

    /// Bind `sink` to `topic`: every message published to `topic` (by this
    /// process or any other connected to the same backend) is decoded as a
    /// fresh `T` and offered to the sink.
    ///
    /// Each sink gets its own decoded value; nothing is shared between
    /// subscribers of one topic. Delivery uses `try_send`: size the sink's
    /// channel for the burstiness you expect, because a full sink drops the
    /// message and reports [`Error::SlowConsumer`].
    ///
    /// Subscribing the same channel to the same topic twice is accepted and
    /// has no additional effect.
    pub async fn subscribe<T>(
        &self,
        topic: &str,
        sink: mpsc::Sender<T>,
    ) -> Result<Subscription, SubscribeError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if self.shared.stopper.is_stopped() {
            return Err(SubscribeError::Closed);
        }
        if sink.is_closed() {
            return Err(SubscribeError::ClosedSink);
        }

        let mut subs = self.shared.subs.write().await;
        let entries = subs.entry(topic.to_string()).or_default();

        if let Some(existing) = entries.iter().find(|entry| {
            entry
                .sink
                .downcast_ref::<mpsc::Sender<T>>()
                .is_some_and(|registered| registered.same_channel(&sink))
        }) {
            return Ok(Subscription {
                topic: topic.to_string(),
                id: existing.id,
                shared: Arc::clone(&self.shared),
            });
        }

        let was_first = entries.is_empty();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let deliver: DeliverFn = {
            let codec = Arc::clone(&self.codec);
            let sink = sink.clone();
            Box::new(move |payload: &[u8]| {
                // Decode into a value owned by this sink alone so that
                // subscribers of one topic can never observe each other's
                // data, however mutable the decoded structure is.
                let value = match codec.decode::<T>(payload) {
                    Ok(value) => value,
                    Err(e) => return Delivery::Failed(e),
                };
                match sink.try_send(value) {
                    Ok(()) => Delivery::Sent,
                    Err(TrySendError::Full(_)) => Delivery::Full,
                    Err(TrySendError::Closed(_)) => Delivery::Gone,
                }
            })
        };
        entries.push(Arc::new(SinkEntry {
            id,
            sink: Box::new(sink),
            deliver,
        }));

        if was_first {
            // The backend call happens with the registry still locked.
            // Releasing first would admit an interleaving where another
            // caller removes the last sink and unsubscribes before this
            // subscribe lands, wedging the backend in the wrong state.
            if let Err(e) = self.shared.adapter.subscribe(topic).await {
                let entries = subs.get_mut(topic).expect("inserted above");
                entries.retain(|entry| entry.id != id);
                if entries.is_empty() {
                    subs.remove(topic);
                }
                return Err(SubscribeError::Backend(e));
            }
        }

        Ok(Subscription {
            topic: topic.to_string(),
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// The asynchronous error stream: slow consumers, decode failures,
    /// adapter trouble. Bounded and lossy; when it is full, further errors
    /// are discarded, and not reading it is fine.
    ///
    /// Returns the receiver on the first call and `None` afterwards.
    pub fn errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.errors_rx.lock().unwrap().take()
    }

    /// Shut down: stop accepting publishes, let the dispatcher finish its
    /// current message, then stop the adapter. Idempotent. Publish and
    /// subscribe return `Closed` errors afterwards.
    pub async fn close(&self) {
        self.shared.stopper.stop();
        let dispatcher = self.dispatcher.lock().unwrap().take();
        if let Some(handle) = dispatcher {
            if handle.await.is_err() {
                warn!("dispatcher exited abnormally");
            }
            self.shared.adapter.stop().await;
        }
    }
}

impl<C: Codec> fmt::Debug for PubSub<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub").finish_non_exhaustive()
    }
}

async fn dispatcher_worker(shared: Arc<Shared>, mut delivered: mpsc::Receiver<Message>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.stopper.wait_stopped() => return,
            msg = delivered.recv() => {
                let Some(msg) = msg else { return };
                fan_out(&shared, &msg).await;
            }
        }
    }
}

/// Deliver one message to every sink subscribed to its topic.
///
/// The whole fan-out runs under the registry's read lock: `unsubscribe`
/// takes the write lock, so once it has returned, no delivery to the
/// removed sink can still be in flight.
async fn fan_out(shared: &Shared, msg: &Message) {
    let subs = shared.subs.read().await;
    let Some(entries) = subs.get(&msg.topic) else {
        return;
    };
    let snapshot = entries.clone();
    for entry in &snapshot {
        match (entry.deliver)(&msg.payload) {
            Delivery::Sent => {}
            // The receiver went away without unsubscribing; nothing to tell.
            Delivery::Gone => {}
            Delivery::Full => shared.report(Error::SlowConsumer),
            Delivery::Failed(e) => shared.report(Error::Decode(e)),
        }
    }
}

/// A live (topic, sink) binding, created by [`PubSub::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe). The handle stays valid after the
/// facade is closed, at which point unsubscribing is a no-op on the backend.
pub struct Subscription {
    topic: String,
    id: u64,
    shared: Arc<Shared>,
}

impl Subscription {
    /// The topic this subscription is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove the binding. After this returns, no further message will be
    /// delivered to the sink through this subscription. Unsubscribing twice
    /// is a no-op returning success.
    pub async fn unsubscribe(&self) -> Result<(), UnsubscribeError> {
        let mut subs = self.shared.subs.write().await;
        let Some(entries) = subs.get_mut(&self.topic) else {
            return Ok(());
        };
        entries.retain(|entry| entry.id != self.id);
        if entries.is_empty() {
            subs.remove(&self.topic);
            // Same reasoning as in subscribe: the backend must observe the
            // transition while the registry is still locked.
            self.shared
                .adapter
                .unsubscribe(&self.topic)
                .await
                .map_err(UnsubscribeError::Backend)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use serde::Serializer;
    use tokio::time::timeout;

    use super::*;

    /// An adapter that records control calls and lets tests inject
    /// deliveries by hand.
    #[derive(Default)]
    struct RecordingAdapter {
        calls: StdMutex<Vec<String>>,
        fail_next_subscribe: AtomicBool,
        pipe: StdMutex<Option<Pipe>>,
    }

    impl RecordingAdapter {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn delivered(&self) -> mpsc::Sender<Message> {
            self.pipe
                .lock()
                .unwrap()
                .as_ref()
                .expect("adapter not started")
                .delivered
                .clone()
        }
    }

    #[async_trait]
    impl Adapter for Arc<RecordingAdapter> {
        fn start(&self, pipe: Pipe) {
            *self.pipe.lock().unwrap() = Some(pipe);
        }

        async fn subscribe(&self, topic: &str) -> Result<(), BoxError> {
            if self.fail_next_subscribe.swap(false, Ordering::SeqCst) {
                return Err(Box::new(std::io::Error::other("backend refused")));
            }
            self.calls.lock().unwrap().push(format!("subscribe {topic}"));
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), BoxError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("unsubscribe {topic}"));
            Ok(())
        }

        async fn stop(&self) {}
    }

    #[tokio::test]
    async fn backend_sees_only_refcount_transitions() {
        let adapter = Arc::new(RecordingAdapter::default());
        let pubsub = PubSub::new(Arc::clone(&adapter));

        let (tx_a, _rx_a) = mpsc::channel::<i32>(4);
        let (tx_b, _rx_b) = mpsc::channel::<i32>(4);
        let sub_a = pubsub.subscribe("t", tx_a).await.unwrap();
        let sub_b = pubsub.subscribe("t", tx_b).await.unwrap();
        assert_eq!(adapter.calls(), vec!["subscribe t"]);

        sub_a.unsubscribe().await.unwrap();
        assert_eq!(adapter.calls(), vec!["subscribe t"]);

        sub_b.unsubscribe().await.unwrap();
        assert_eq!(adapter.calls(), vec!["subscribe t", "unsubscribe t"]);

        pubsub.close().await;
    }

    #[tokio::test]
    async fn unsubscribe_twice_is_a_no_op() {
        let adapter = Arc::new(RecordingAdapter::default());
        let pubsub = PubSub::new(Arc::clone(&adapter));

        let (tx, _rx) = mpsc::channel::<i32>(4);
        let sub = pubsub.subscribe("t", tx).await.unwrap();
        sub.unsubscribe().await.unwrap();
        sub.unsubscribe().await.unwrap();
        assert_eq!(adapter.calls(), vec!["subscribe t", "unsubscribe t"]);

        pubsub.close().await;
    }

    #[tokio::test]
    async fn failed_backend_subscribe_rolls_the_insert_back() {
        let adapter = Arc::new(RecordingAdapter::default());
        adapter.fail_next_subscribe.store(true, Ordering::SeqCst);
        let pubsub = PubSub::new(Arc::clone(&adapter));

        let (tx, _rx) = mpsc::channel::<i32>(4);
        let err = pubsub.subscribe("t", tx.clone()).await.unwrap_err();
        assert!(matches!(err, SubscribeError::Backend(_)));

        // The topic must be gone from the registry: a retry is again the
        // first subscriber and reaches the backend again.
        pubsub.subscribe("t", tx).await.unwrap();
        assert_eq!(adapter.calls(), vec!["subscribe t"]);

        pubsub.close().await;
    }

    #[tokio::test]
    async fn duplicate_channel_subscription_has_no_extra_effect() {
        let adapter = Arc::new(RecordingAdapter::default());
        let pubsub = PubSub::new(Arc::clone(&adapter));

        let (tx, mut rx) = mpsc::channel::<i32>(4);
        let _sub_a = pubsub.subscribe("t", tx.clone()).await.unwrap();
        let _sub_b = pubsub.subscribe("t", tx).await.unwrap();
        assert_eq!(adapter.calls(), vec!["subscribe t"]);

        let payload = Postcard.encode(&7i32).unwrap();
        adapter
            .delivered()
            .send(Message::new("t", payload))
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(first, 7);
        assert!(
            timeout(Duration::from_millis(10), rx.recv()).await.is_err(),
            "one delivery expected for a doubly-subscribed channel"
        );

        pubsub.close().await;
    }

    #[tokio::test]
    async fn closed_sink_is_rejected() {
        let adapter = Arc::new(RecordingAdapter::default());
        let pubsub = PubSub::new(Arc::clone(&adapter));

        let (tx, rx) = mpsc::channel::<i32>(4);
        drop(rx);
        let err = pubsub.subscribe("t", tx).await.unwrap_err();
        assert!(matches!(err, SubscribeError::ClosedSink));

        pubsub.close().await;
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refuses to serialize"))
        }
    }

    #[tokio::test]
    async fn encode_errors_return_synchronously() {
        let adapter = Arc::new(RecordingAdapter::default());
        let pubsub = PubSub::new(Arc::clone(&adapter));

        let err = pubsub.publish("t", &Unserializable).await.unwrap_err();
        assert!(matches!(err, PublishError::Encode(_)));

        pubsub.close().await;
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let adapter = Arc::new(RecordingAdapter::default());
        let pubsub = PubSub::new(Arc::clone(&adapter));
        pubsub.close().await;
        pubsub.close().await;

        let err = pubsub.publish("t", &1i32).await.unwrap_err();
        assert!(matches!(err, PublishError::Closed));

        let (tx, _rx) = mpsc::channel::<i32>(4);
        let err = pubsub.subscribe("t", tx).await.unwrap_err();
        assert!(matches!(err, SubscribeError::Closed));
    }

    /// Encodes with postcard but refuses every decode.
    struct BrokenDecode;

    impl Codec for BrokenDecode {
        fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
        where
            T: Serialize + ?Sized,
        {
            Postcard.encode(value)
        }

        fn decode<T>(&self, _bytes: &[u8]) -> Result<T, CodecError>
        where
            T: DeserializeOwned,
        {
            Err(CodecError::new(std::io::Error::other("decode refused")))
        }
    }

    #[tokio::test]
    async fn decode_failure_skips_the_sink_and_reports() {
        let adapter = Arc::new(RecordingAdapter::default());
        let pubsub = PubSub::with_codec(Arc::clone(&adapter), BrokenDecode, Config::default());
        let mut errors = pubsub.errors().expect("first take");
        assert!(pubsub.errors().is_none());

        let (tx, mut rx) = mpsc::channel::<i32>(4);
        let _sub = pubsub.subscribe("t", tx).await.unwrap();

        adapter
            .delivered()
            .send(Message::new("t", vec![1, 2, 3]))
            .await
            .unwrap();

        let err = timeout(Duration::from_secs(1), errors.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert!(matches!(err, Error::Decode(_)));
        assert!(
            timeout(Duration::from_millis(10), rx.recv()).await.is_err(),
            "sink must be skipped on decode failure"
        );

        pubsub.close().await;
    }
}
