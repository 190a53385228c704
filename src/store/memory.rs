//! In-Memory Realtime Store
//!
//! The whole tree lives behind one mutex. Every mutation resolves server
//! timestamps, applies the change, then pushes the new value to each
//! subscriber whose path overlaps the changed path and whose value changed.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::clock::{Clock, ServerClock, SystemClock};
use crate::store::tree;
use crate::store::{RealtimeStore, StoreError, StorePath, Subscription, SubscriptionHandle};

struct Subscriber {
    path: StorePath,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

#[derive(Default)]
struct StoreInner {
    root: Value,
    subscribers: BTreeMap<SubscriptionHandle, Subscriber>,
}

/// In-process realtime store.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    clock: ServerClock,
    next_handle: AtomicU64,
    /// Remaining mutations to fail with `Unavailable`.
    injected_failures: AtomicUsize,
}

impl MemoryStore {
    /// Empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Empty store on an explicit clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            clock: ServerClock::new(clock),
            next_handle: AtomicU64::new(1),
            injected_failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` write/merge/remove calls fail as unavailable.
    pub fn fail_next_writes(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Synchronous read, for inspection.
    pub fn snapshot(&self, path: &StorePath) -> Option<Value> {
        tree::get(&self.lock().root, path.segments()).cloned()
    }

    /// Store a value exactly as given, bypassing timestamp resolution.
    ///
    /// Lets tests seed records with chosen `lastUpdated` values.
    pub fn seed(&self, path: &StorePath, value: Value) {
        self.mutate(path, |root| tree::set(root, path.segments(), value));
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_injected_failure(&self) -> Result<(), StoreError> {
        let failed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    /// Apply `change` to the tree and notify affected subscribers.
    fn mutate<F>(&self, changed: &StorePath, change: F)
    where
        F: FnOnce(&mut Value),
    {
        let mut inner = self.lock();

        let before: Vec<(SubscriptionHandle, Option<Value>)> = inner
            .subscribers
            .iter()
            .filter(|(_, sub)| sub.path.overlaps(changed))
            .map(|(handle, sub)| (*handle, tree::get(&inner.root, sub.path.segments()).cloned()))
            .collect();

        change(&mut inner.root);

        let mut closed = Vec::new();
        for (handle, old) in before {
            let Some(sub) = inner.subscribers.get(&handle) else {
                continue;
            };
            let new = tree::get(&inner.root, sub.path.segments()).cloned();
            if new == old {
                continue;
            }
            trace!(subscription = handle.0, path = %sub.path, "delivering change");
            if sub.tx.send(new).is_err() {
                closed.push(handle);
            }
        }
        for handle in closed {
            inner.subscribers.remove(&handle);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn write(&self, path: &StorePath, mut value: Value) -> Result<(), StoreError> {
        self.take_injected_failure()?;
        tree::resolve_server_values(&mut value, self.clock.next_timestamp());
        self.mutate(path, |root| tree::set(root, path.segments(), value));
        Ok(())
    }

    async fn merge(&self, path: &StorePath, partial: Value) -> Result<(), StoreError> {
        let Value::Object(children) = partial else {
            return Err(StoreError::InvalidValue("merge expects an object".into()));
        };
        let mut updates = Vec::with_capacity(children.len());
        for (key, value) in children {
            updates.push((path.child(&key)?, value));
        }

        self.take_injected_failure()?;
        let timestamp = self.clock.next_timestamp();
        self.mutate(path, |root| {
            for (child, mut value) in updates {
                tree::resolve_server_values(&mut value, timestamp);
                tree::set(root, child.segments(), value);
            }
        });
        Ok(())
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        Ok(self.snapshot(path))
    }

    async fn remove(&self, path: &StorePath) -> Result<(), StoreError> {
        self.take_injected_failure()?;
        self.mutate(path, |root| {
            tree::remove(root, path.segments());
        });
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (tx, updates) = mpsc::unbounded_channel();

        let mut inner = self.lock();
        let initial = tree::get(&inner.root, path.segments()).cloned();
        // Receiver is alive, the initial send cannot fail.
        let _ = tx.send(initial);
        inner.subscribers.insert(handle, Subscriber { path: path.clone(), tx });

        Ok(Subscription { handle, updates })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), StoreError> {
        match self.lock().subscribers.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(StoreError::UnknownSubscription(handle.0)),
        }
    }

    async fn server_time(&self) -> Result<i64, StoreError> {
        Ok(self.clock.now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::store::server_timestamp;
    use serde_json::json;

    fn path(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(1_000);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let (store, _) = store();
        let p = path("online_players/p1");

        store.write(&p, json!({"displayName": "ana"})).await.unwrap();
        assert_eq!(store.read(&p).await.unwrap(), Some(json!({"displayName": "ana"})));

        store.remove(&p).await.unwrap();
        assert_eq!(store.read(&p).await.unwrap(), None);
        assert_eq!(store.read(&path("online_players")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_merge_is_non_destructive() {
        let (store, _) = store();
        let p = path("online_players/p1");
        store
            .write(&p, json!({"displayName": "ana", "position": {"x": 1, "y": 1}}))
            .await
            .unwrap();

        store.merge(&p, json!({"chatMessage": "hola", "position/x": 2})).await.unwrap();
        assert_eq!(
            store.snapshot(&p),
            Some(json!({"displayName": "ana", "position": {"x": 2, "y": 1}, "chatMessage": "hola"}))
        );

        store.merge(&p, json!({"chatMessage": null})).await.unwrap();
        assert!(store.snapshot(&p).unwrap().get("chatMessage").is_none());
    }

    #[tokio::test]
    async fn test_merge_rejects_non_object() {
        let (store, _) = store();
        let result = store.merge(&path("a"), json!(5)).await;
        assert!(matches!(result, Err(StoreError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_server_timestamps_strictly_increase() {
        let (store, _) = store();
        let p = path("online_players/p1");
        let mut seen = Vec::new();
        for _ in 0..5 {
            store.merge(&p, json!({"lastUpdated": server_timestamp()})).await.unwrap();
            seen.push(store.snapshot(&p).unwrap()["lastUpdated"].as_i64().unwrap());
        }
        assert!(seen.windows(2).all(|w| w[1] > w[0]), "{seen:?}");
        assert_eq!(seen[0], 1_000);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_and_changes() {
        let (store, _) = store();
        let collection = path("online_players");
        store.write(&path("online_players/p1"), json!({"a": 1})).await.unwrap();

        let mut sub = store.subscribe(&collection).await.unwrap();
        assert_eq!(sub.updates.recv().await.unwrap(), Some(json!({"p1": {"a": 1}})));

        store.write(&path("online_players/p2"), json!({"b": 2})).await.unwrap();
        assert_eq!(
            sub.updates.recv().await.unwrap(),
            Some(json!({"p1": {"a": 1}, "p2": {"b": 2}}))
        );

        // Unrelated and no-op writes are not delivered.
        store.write(&path("users/p1"), json!({"username": "ana"})).await.unwrap();
        store.write(&path("online_players/p2"), json!({"b": 2})).await.unwrap();
        assert!(sub.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_empty_path_delivers_none() {
        let (store, _) = store();
        let mut sub = store.subscribe(&path("online_players")).await.unwrap();
        assert_eq!(sub.updates.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let (store, _) = store();
        let mut sub = store.subscribe(&path("online_players")).await.unwrap();
        let _ = sub.updates.recv().await;

        store.unsubscribe(sub.handle).await.unwrap();
        assert_eq!(store.subscriber_count(), 0);
        assert!(sub.updates.recv().await.is_none());
        assert!(matches!(
            store.unsubscribe(sub.handle).await,
            Err(StoreError::UnknownSubscription(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (store, _) = store();
        let p = path("online_players/p1");
        store.fail_next_writes(1);
        assert!(matches!(store.write(&p, json!({"a": 1})).await, Err(StoreError::Unavailable(_))));
        store.write(&p, json!({"a": 1})).await.unwrap();
        assert!(store.snapshot(&p).is_some());
    }

    #[tokio::test]
    async fn test_server_time_tracks_clock() {
        let (store, clock) = store();
        clock.advance(250);
        assert_eq!(store.server_time().await.unwrap(), 1_250);
        assert!(!store.on_disconnect_remove(&path("a")).await.unwrap());
    }
}
