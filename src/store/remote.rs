//! Relay Client
//!
//! `RealtimeStore` over a WebSocket connection to a `RelayServer`. Requests
//! are correlated to replies by id; subscriptions are registered under their
//! request id before the request is sent, so no snapshot is missed.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::store::protocol::{RelayMessage, RelayOp, RelayRequest};
use crate::store::{RealtimeStore, StoreError, StorePath, Subscription, SubscriptionHandle};

type PendingMap = HashMap<u64, oneshot::Sender<RelayMessage>>;
type SubscriberMap = HashMap<u64, mpsc::UnboundedSender<Option<Value>>>;

#[derive(Default)]
struct Shared {
    pending: Mutex<PendingMap>,
    subscriptions: Mutex<SubscriberMap>,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscriptions(&self) -> MutexGuard<'_, SubscriberMap> {
        self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Route one relay message to its waiter or subscription.
    fn dispatch(&self, msg: RelayMessage) {
        match msg {
            RelayMessage::Snapshot { subscription, value } => {
                let mut subs = self.subscriptions();
                let delivered = subs.get(&subscription).map(|tx| tx.send(value).is_ok());
                if delivered == Some(false) {
                    subs.remove(&subscription);
                }
            }
            RelayMessage::Shutdown { reason } => {
                info!(%reason, "Relay shutting down");
            }
            msg => match msg.reply_id() {
                Some(id) => {
                    if let Some(waiter) = self.pending().remove(&id) {
                        let _ = waiter.send(msg);
                    } else {
                        debug!(id, "Reply for unknown request");
                    }
                }
                None => warn!(?msg, "Uncorrelated relay message"),
            },
        }
    }

    /// Fail all waiters and end all subscriptions.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending().clear();
        self.subscriptions().clear();
    }
}

/// Store client connected to a relay.
pub struct RemoteStore {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    request_timeout: Duration,
    identity: String,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteStore {
    /// Connect to `url` and authenticate with `token`.
    pub async fn connect(url: &str, token: &str, request_timeout: Duration) -> Result<Self, StoreError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Shared::default());

        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayMessage::from_json(&text) {
                        Ok(msg) => reader_shared.dispatch(msg),
                        Err(e) => warn!("Undecodable relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
            debug!("Relay connection closed");
            reader_shared.close();
        });

        let mut store = Self {
            shared,
            outgoing,
            next_id: AtomicU64::new(1),
            request_timeout,
            identity: String::new(),
            reader,
            writer,
        };

        let reply = store.request(RelayOp::Auth { token: token.to_string() }).await?;
        match reply {
            RelayMessage::Authenticated { identity, .. } => {
                info!(%identity, "Connected to relay at {}", url);
                store.identity = identity;
                Ok(store)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Identity the relay accepted for this connection.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request(&self, op: RelayOp) -> Result<RelayMessage, StoreError> {
        self.request_with_id(self.allocate_id(), op).await
    }

    async fn request_with_id(&self, id: u64, op: RelayOp) -> Result<RelayMessage, StoreError> {
        let text = RelayRequest { id, op }
            .to_json()
            .map_err(|e| StoreError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        if self.is_closed() || self.outgoing.send(text).is_err() {
            self.shared.pending().remove(&id);
            return Err(StoreError::Disconnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(RelayMessage::Error { code, message, .. })) => Err(code.into_store_error(message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(StoreError::Timeout)
            }
        }
    }

    async fn request_ok(&self, op: RelayOp) -> Result<(), StoreError> {
        match self.request(op).await? {
            RelayMessage::Ok { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(msg: &RelayMessage) -> StoreError {
    StoreError::Protocol(format!("unexpected reply: {:?}", msg))
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl RealtimeStore for RemoteStore {
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        self.request_ok(RelayOp::Write { path: path.clone(), value }).await
    }

    async fn merge(&self, path: &StorePath, partial: Value) -> Result<(), StoreError> {
        self.request_ok(RelayOp::Merge { path: path.clone(), value: partial }).await
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        match self.request(RelayOp::Read { path: path.clone() }).await? {
            RelayMessage::Value { value, .. } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn remove(&self, path: &StorePath) -> Result<(), StoreError> {
        self.request_ok(RelayOp::Remove { path: path.clone() }).await
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        let id = self.allocate_id();
        let (tx, updates) = mpsc::unbounded_channel();
        self.shared.subscriptions().insert(id, tx);

        let result = self.request_with_id(id, RelayOp::Subscribe { path: path.clone() }).await;
        match result {
            Ok(RelayMessage::Ok { .. }) => Ok(Subscription { handle: SubscriptionHandle(id), updates }),
            Ok(other) => {
                self.shared.subscriptions().remove(&id);
                Err(unexpected(&other))
            }
            Err(e) => {
                self.shared.subscriptions().remove(&id);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), StoreError> {
        if self.shared.subscriptions().remove(&handle.0).is_none() {
            return Err(StoreError::UnknownSubscription(handle.0));
        }
        self.request_ok(RelayOp::Unsubscribe { subscription: handle.0 }).await
    }

    async fn server_time(&self) -> Result<i64, StoreError> {
        match self.request(RelayOp::ServerTime).await? {
            RelayMessage::ServerTime { server_time, .. } => Ok(server_time),
            other => Err(unexpected(&other)),
        }
    }

    async fn on_disconnect_remove(&self, path: &StorePath) -> Result<bool, StoreError> {
        match self.request(RelayOp::OnDisconnectRemove { path: path.clone() }).await? {
            RelayMessage::Registered { .. } => Ok(true),
            other => Err(unexpected(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_routes_replies_and_snapshots() {
        let shared = Shared::default();
        let (tx, mut rx) = oneshot::channel();
        shared.pending().insert(5, tx);
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        shared.subscriptions().insert(2, sub_tx);

        shared.dispatch(RelayMessage::Snapshot { subscription: 2, value: Some(json!({"a": 1})) });
        shared.dispatch(RelayMessage::Ok { id: 5 });

        assert_eq!(sub_rx.try_recv().unwrap(), Some(json!({"a": 1})));
        assert!(matches!(rx.try_recv().unwrap(), RelayMessage::Ok { id: 5 }));
        assert!(shared.pending().is_empty());
    }

    #[test]
    fn test_close_fails_waiters() {
        let shared = Shared::default();
        let (tx, mut rx) = oneshot::channel();
        shared.pending().insert(1, tx);
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        shared.subscriptions().insert(2, sub_tx);

        shared.close();

        assert!(shared.closed.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
        assert!(matches!(sub_rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RemoteStore::connect(&format!("ws://{}", addr), "token", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
