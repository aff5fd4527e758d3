//! Fire-and-forget persistence.
//!
//! Store writes triggered by a dispatch run as tracked background tasks. The
//! response path never awaits them; their result is only logged. A session
//! drains its writer with a timeout when it closes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use navi_store::StoreError;

#[derive(Clone, Default)]
pub struct PersistWriter {
    tracker: TaskTracker,
    pending: Arc<AtomicUsize>,
    failures: Arc<AtomicU64>,
}

impl PersistWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a write. Failures are logged at warn and counted, never returned.
    pub fn spawn<F, T>(&self, op: &'static str, write: F)
    where
        F: Future<Output = Result<T, StoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let pending = Arc::clone(&self.pending);
        let failures = Arc::clone(&self.failures);
        pending.fetch_add(1, Ordering::Relaxed);
        drop(self.tracker.spawn(async move {
            match write.await {
                Ok(_) => debug!(op, "persisted"),
                Err(e) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(op, error = %e, "persistence write failed");
                }
            }
            pending.fetch_sub(1, Ordering::Relaxed);
        }));
    }

    /// Wait for all writes spawned so far. Returns `false` on timeout.
    pub async fn drain_with_timeout(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();
        drained
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PersistWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistWriter")
            .field("pending_count", &self.pending_count())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}
