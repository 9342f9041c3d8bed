use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot stop signal shared by a facade (or adapter) and its workers.
///
/// Cloning is cheap; every clone observes the same signal. Stopping is
/// permanent.
#[derive(Clone)]
pub(crate) struct Stopper {
    tx: Arc<watch::Sender<bool>>,
}

impl Stopper {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once [`stop`](Self::stop) has been called, immediately if it
    /// already was.
    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` can only fail if every
        // Stopper clone is gone, in which case nobody can observe us anyway.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
