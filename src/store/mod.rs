//! Shared Realtime Store
//!
//! The key-value realtime store every client shares. Presence only needs a
//! small surface: write, merge, read, remove, subscribe (full value on every
//! change, including the initial value), unsubscribe, and a server timestamp.
//!
//! - `memory`: in-process store, used directly by tests and by the relay
//! - `protocol`: JSON messages of the WebSocket relay
//! - `relay`: development backend serving a `MemoryStore` over WebSocket
//! - `remote`: `RealtimeStore` client for the relay

pub mod memory;
pub mod path;
pub mod protocol;
pub mod relay;
pub mod remote;
pub mod tree;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use path::StorePath;
pub use relay::{RelayError, RelayServer};
pub use remote::RemoteStore;
pub use tree::server_timestamp;

/// Collection holding one `PlayerRecord` per online identity.
pub const ONLINE_PLAYERS: &str = "online_players";

/// Collection holding one persisted profile per identity.
pub const USERS: &str = "users";

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Store is unreachable (network blip, injected failure).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// No reply within the request timeout.
    #[error("store request timed out")]
    Timeout,
    /// Connection to the store closed.
    #[error("store connection closed")]
    Disconnected,
    /// Malformed path.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// Value not acceptable for the operation.
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// The caller may not write this path.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Unknown subscription handle.
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Handle to an active subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

/// An active subscription: the handle plus the delivery channel.
///
/// Each delivery is the complete value at the subscribed path (`None` when
/// nothing is stored there). The channel closes when the subscription ends.
#[derive(Debug)]
pub struct Subscription {
    /// Handle for `unsubscribe`.
    pub handle: SubscriptionHandle,
    /// Full-value deliveries, starting with the current value.
    pub updates: mpsc::UnboundedReceiver<Option<Value>>,
}

/// Key-value realtime store.
///
/// Values may contain the [`server_timestamp`] sentinel, which the store
/// replaces with a timestamp that strictly increases across writes.
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// Replace the value at `path`. Writing `null` removes it.
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    /// Update the children named by `partial`'s keys (relative paths), leaving
    /// other children untouched. A `null` child removes that child.
    async fn merge(&self, path: &StorePath, partial: Value) -> Result<(), StoreError>;

    /// Current value at `path`.
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError>;

    /// Remove the value at `path`.
    async fn remove(&self, path: &StorePath) -> Result<(), StoreError> {
        self.write(path, Value::Null).await
    }

    /// Subscribe to full-value deliveries at `path`.
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError>;

    /// End a subscription. Its delivery channel closes.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), StoreError>;

    /// The store's current time (ms since epoch).
    async fn server_time(&self) -> Result<i64, StoreError>;

    /// Ask the store to remove `path` when this client's connection drops.
    ///
    /// Returns `false` when the store has no notion of a client connection.
    async fn on_disconnect_remove(&self, _path: &StorePath) -> Result<bool, StoreError> {
        Ok(false)
    }
}

/// Path of one player's live record.
pub fn player_path(identity: &str) -> Result<StorePath, StoreError> {
    StorePath::parse(ONLINE_PLAYERS)?.child(identity)
}

/// Path of one player's persisted profile.
pub fn profile_path(identity: &str) -> Result<StorePath, StoreError> {
    StorePath::parse(USERS)?.child(identity)
}
