//! Ordered Publish Queue
//!
//! One worker per synchronizer owns the local player's record. Ops run in
//! submission order; a failed op is retried once, after the retry delay,
//! before the next op starts, so a late retry never overwrites a newer write.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::store::{RealtimeStore, StoreError, StorePath};

/// One store mutation of the local player's data.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOp {
    /// Replace the value at `path`.
    Write {
        /// Target.
        path: StorePath,
        /// New value.
        value: Value,
    },
    /// Merge `patch` into `path`.
    Merge {
        /// Target.
        path: StorePath,
        /// Relative-path patch.
        patch: Value,
    },
    /// Remove `path`.
    Remove {
        /// Target.
        path: StorePath,
    },
    /// Ask the store to remove `path` if this client drops.
    RemoveOnDisconnect {
        /// Target.
        path: StorePath,
    },
}

impl PublishOp {
    fn name(&self) -> &'static str {
        match self {
            PublishOp::Write { .. } => "write",
            PublishOp::Merge { .. } => "merge",
            PublishOp::Remove { .. } => "remove",
            PublishOp::RemoveOnDisconnect { .. } => "on_disconnect_remove",
        }
    }

    fn path(&self) -> &StorePath {
        match self {
            PublishOp::Write { path, .. }
            | PublishOp::Merge { path, .. }
            | PublishOp::Remove { path }
            | PublishOp::RemoveOnDisconnect { path } => path,
        }
    }

    async fn apply(&self, store: &dyn RealtimeStore) -> Result<(), StoreError> {
        match self {
            PublishOp::Write { path, value } => store.write(path, value.clone()).await,
            PublishOp::Merge { path, patch } => store.merge(path, patch.clone()).await,
            PublishOp::Remove { path } => store.remove(path).await,
            PublishOp::RemoveOnDisconnect { path } => {
                if !store.on_disconnect_remove(path).await? {
                    debug!(%path, "Store has no disconnect hook; relying on staleness");
                }
                Ok(())
            }
        }
    }
}

enum Job {
    Op(PublishOp),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle for enqueueing ops.
#[derive(Clone)]
pub struct PublishQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl PublishQueue {
    /// Enqueue `op`. Never blocks; dropped silently once the worker is gone.
    pub fn enqueue(&self, op: PublishOp) {
        if self.tx.send(Job::Op(op)).is_err() {
            debug!("Publish queue closed, dropping op");
        }
    }

    /// Wait until every op enqueued before this call has been attempted.
    ///
    /// Returns `false` when the worker is gone or `timeout` passes first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Job::Flush(ack)).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, done).await, Ok(Ok(())))
    }
}

/// The worker plus its queue handle. Dropping it stops the worker.
pub struct Publisher {
    queue: PublishQueue,
    worker: JoinHandle<()>,
}

impl Publisher {
    /// Start a worker publishing to `store`.
    pub fn spawn(store: Arc<dyn RealtimeStore>, retry_delay: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Op(op) => {
                        publish_with_retry(store.as_ref(), &op, retry_delay).await;
                    }
                    Job::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self {
            queue: PublishQueue { tx },
            worker,
        }
    }

    /// Handle for enqueueing.
    pub fn queue(&self) -> PublishQueue {
        self.queue.clone()
    }

    /// Enqueue `op`.
    pub fn enqueue(&self, op: PublishOp) {
        self.queue.enqueue(op);
    }

    /// Wait for the queue to drain, bounded by `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.queue.flush(timeout).await
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Attempt `op`, retrying once after `retry_delay`. Returns whether it landed.
pub async fn publish_with_retry(store: &dyn RealtimeStore, op: &PublishOp, retry_delay: Duration) -> bool {
    let first = match op.apply(store).await {
        Ok(()) => return true,
        Err(e) => e,
    };
    warn!(op = op.name(), path = %op.path(), "Publish failed, retrying: {}", first);
    tokio::time::sleep(retry_delay).await;

    match op.apply(store).await {
        Ok(()) => {
            debug!(op = op.name(), path = %op.path(), "Publish retry succeeded");
            true
        }
        Err(e) => {
            error!(op = op.name(), path = %op.path(), "Publish failed after retry: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn path(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_ops_apply_in_order() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::spawn(store.clone(), Duration::from_millis(1));
        let p = path("online_players/p1");

        publisher.enqueue(PublishOp::Write { path: p.clone(), value: json!({"a": 1}) });
        publisher.enqueue(PublishOp::Merge { path: p.clone(), patch: json!({"b": 2}) });
        assert!(publisher.flush(Duration::from_secs(1)).await);
        assert_eq!(store.snapshot(&p), Some(json!({"a": 1, "b": 2})));

        publisher.enqueue(PublishOp::Remove { path: p.clone() });
        assert!(publisher.flush(Duration::from_secs(1)).await);
        assert_eq!(store.snapshot(&p), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_retry_after_delay() {
        let store = Arc::new(MemoryStore::new());
        let p = path("online_players/p1");
        let op = PublishOp::Write { path: p.clone(), value: json!({"a": 1}) };

        store.fail_next_writes(1);
        let started = tokio::time::Instant::now();
        assert!(publish_with_retry(store.as_ref(), &op, Duration::from_millis(250)).await);
        assert_eq!(started.elapsed(), Duration::from_millis(250));
        assert_eq!(store.snapshot(&p), Some(json!({"a": 1})));

        store.fail_next_writes(2);
        assert!(!publish_with_retry(store.as_ref(), &op, Duration::from_millis(250)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_completes_before_next_op() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::spawn(store.clone(), Duration::from_millis(250));
        let p = path("online_players/p1");

        store.fail_next_writes(1);
        publisher.enqueue(PublishOp::Write { path: p.clone(), value: json!({"x": 1}) });
        publisher.enqueue(PublishOp::Write { path: p.clone(), value: json!({"x": 2}) });
        assert!(publisher.flush(Duration::from_secs(1)).await);

        assert_eq!(store.snapshot(&p), Some(json!({"x": 2})));
    }

    #[tokio::test]
    async fn test_flush_fails_after_worker_stops() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::spawn(store, Duration::from_millis(1));
        let queue = publisher.queue();
        drop(publisher);
        tokio::task::yield_now().await;
        assert!(!queue.flush(Duration::from_millis(50)).await);
    }
}
