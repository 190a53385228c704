//! WebSocket Store Relay
//!
//! Development backend: serves one shared `MemoryStore` to many clients over
//! WebSocket. Clients authenticate with an identity token first; afterwards
//! they may read and subscribe anywhere but write only their own records
//! (`online_players/{sub}` and `users/{sub}`).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::RelayConfig;
use crate::identity::token::{validate_token, AuthConfig};
use crate::store::protocol::{ErrorCode, RelayMessage, RelayOp, RelayRequest};
use crate::store::{
    MemoryStore, RealtimeStore, StoreError, StorePath, SubscriptionHandle, ONLINE_PLAYERS, USERS,
};

/// Collections whose `{identity}` children only that identity may write.
const OWNED_COLLECTIONS: [&str; 2] = [ONLINE_PLAYERS, USERS];

/// Grace period for flushing queued messages when a connection closes.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Failed to bind or inspect the listener.
    #[error("Failed to bind: {0}")]
    Bind(#[from] std::io::Error),

    /// No token verification key configured.
    #[error("Relay requires AUTH_SECRET or AUTH_PUBLIC_KEY_PEM")]
    AuthNotConfigured,
}

/// Connected client bookkeeping.
struct ConnectedClient {
    /// Identity (after auth).
    identity: Option<String>,
    /// Connection time.
    connected_at: Instant,
}

/// Shared state cloned into every connection task.
#[derive(Clone)]
struct RelayContext {
    store: Arc<MemoryStore>,
    auth: AuthConfig,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
}

/// The relay server.
pub struct RelayServer {
    /// Relay configuration.
    config: RelayConfig,
    /// Backing store shared by all connections.
    store: Arc<MemoryStore>,
    /// Connected clients.
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a relay over `store`.
    pub fn new(config: RelayConfig, store: Arc<MemoryStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        if !self.config.auth.is_configured() {
            return Err(RelayError::AuthNotConfigured);
        }
        info!("Relay listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = RelayContext {
            store: self.store.clone(),
            auth: self.config.auth.clone(),
            clients: self.clients.clone(),
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<RelayMessage>(64);

            ctx.clients.write().await.insert(addr, ConnectedClient {
                identity: None,
                connected_at: Instant::now(),
            });

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let mut conn = Connection::new(addr, msg_tx);

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match RelayRequest::from_json(&text) {
                                    Ok(request) => conn.handle_request(request, &ctx).await,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        conn.send(RelayMessage::Error {
                                            id: None,
                                            code: ErrorCode::InvalidMessage,
                                            message: format!("Invalid message format: {}", e),
                                        }).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        conn.send(RelayMessage::Shutdown {
                            reason: "Relay shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            conn.close(&ctx.store).await;
            if tokio::time::timeout(FLUSH_GRACE, sender_task).await.is_err() {
                debug!("Sender for {} did not flush in time", addr);
            }

            if let Some(client) = ctx.clients.write().await.remove(&addr) {
                info!(
                    identity = client.identity.as_deref().unwrap_or("-"),
                    secs = client.connected_at.elapsed().as_secs(),
                    "Client {} cleaned up",
                    addr
                );
            }
        });
    }

    /// Shutdown the relay.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

/// Whether `identity` may write `path`.
fn may_write(identity: &str, path: &StorePath) -> bool {
    match path.segments() {
        [collection, owner, ..] => {
            OWNED_COLLECTIONS.contains(&collection.as_str()) && owner == identity
        }
        _ => false,
    }
}

/// A failed request, sent back as an `error` message.
struct Rejection {
    code: ErrorCode,
    message: String,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<StoreError> for Rejection {
    fn from(err: StoreError) -> Self {
        Self::new(ErrorCode::from_store_error(&err), err.to_string())
    }
}

/// One subscription forwarded to the socket.
struct Forwarder {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

/// Per-connection state, owned by the connection task.
struct Connection {
    addr: SocketAddr,
    identity: Option<String>,
    /// Keyed by the `subscribe` request id.
    subscriptions: BTreeMap<u64, Forwarder>,
    /// Paths removed when the connection closes.
    disconnect_paths: Vec<StorePath>,
    outgoing: mpsc::Sender<RelayMessage>,
}

impl Connection {
    fn new(addr: SocketAddr, outgoing: mpsc::Sender<RelayMessage>) -> Self {
        Self {
            addr,
            identity: None,
            subscriptions: BTreeMap::new(),
            disconnect_paths: Vec::new(),
            outgoing,
        }
    }

    async fn send(&self, msg: RelayMessage) {
        let _ = self.outgoing.send(msg).await;
    }

    async fn handle_request(&mut self, request: RelayRequest, ctx: &RelayContext) {
        let id = request.id;
        match self.dispatch(id, request.op, ctx).await {
            Ok(Some(reply)) => self.send(reply).await,
            Ok(None) => {}
            Err(rejection) => {
                self.send(RelayMessage::Error {
                    id: Some(id),
                    code: rejection.code,
                    message: rejection.message,
                })
                .await
            }
        }
    }

    async fn dispatch(
        &mut self,
        id: u64,
        op: RelayOp,
        ctx: &RelayContext,
    ) -> Result<Option<RelayMessage>, Rejection> {
        let Some(identity) = self.identity.clone() else {
            return match op {
                RelayOp::Auth { token } => self.authenticate(id, &token, ctx).await.map(Some),
                _ => Err(Rejection::new(ErrorCode::AuthFailed, "Must authenticate first")),
            };
        };

        if let Some(path) = op.written_path() {
            if !may_write(&identity, path) {
                warn!(%identity, %path, "Rejected write from {}", self.addr);
                return Err(Rejection::new(
                    ErrorCode::PermissionDenied,
                    format!("{} may not write {}", identity, path),
                ));
            }
        }

        let store = &ctx.store;
        let reply = match op {
            RelayOp::Auth { .. } => {
                return Err(Rejection::new(ErrorCode::InvalidMessage, "Already authenticated"));
            }
            RelayOp::Write { path, value } => {
                store.write(&path, value).await?;
                RelayMessage::Ok { id }
            }
            RelayOp::Merge { path, value } => {
                store.merge(&path, value).await?;
                RelayMessage::Ok { id }
            }
            RelayOp::Remove { path } => {
                store.remove(&path).await?;
                RelayMessage::Ok { id }
            }
            RelayOp::Read { path } => RelayMessage::Value { id, value: store.read(&path).await? },
            RelayOp::ServerTime => RelayMessage::ServerTime { id, server_time: store.server_time().await? },
            RelayOp::OnDisconnectRemove { path } => {
                if !self.disconnect_paths.contains(&path) {
                    self.disconnect_paths.push(path);
                }
                RelayMessage::Registered { id }
            }
            RelayOp::Subscribe { path } => {
                self.subscribe(id, &path, store).await?;
                return Ok(None);
            }
            RelayOp::Unsubscribe { subscription } => {
                let Some(forwarder) = self.subscriptions.remove(&subscription) else {
                    return Err(StoreError::UnknownSubscription(subscription).into());
                };
                forwarder.task.abort();
                let _ = store.unsubscribe(forwarder.handle).await;
                RelayMessage::Ok { id }
            }
        };
        Ok(Some(reply))
    }

    async fn authenticate(
        &mut self,
        id: u64,
        token: &str,
        ctx: &RelayContext,
    ) -> Result<RelayMessage, Rejection> {
        let claims = validate_token(token, &ctx.auth).map_err(|e| {
            warn!("Auth failed for {}: {}", self.addr, e);
            Rejection::new(ErrorCode::AuthFailed, e.to_string())
        })?;

        if let Some(client) = ctx.clients.write().await.get_mut(&self.addr) {
            client.identity = Some(claims.sub.clone());
        }
        info!(identity = %claims.sub, "Client {} authenticated", self.addr);
        self.identity = Some(claims.sub.clone());
        Ok(RelayMessage::Authenticated { id, identity: claims.sub })
    }

    /// Acknowledge, then forward every delivery as a `snapshot`.
    async fn subscribe(&mut self, id: u64, path: &StorePath, store: &MemoryStore) -> Result<(), Rejection> {
        if self.subscriptions.contains_key(&id) {
            return Err(Rejection::new(ErrorCode::InvalidMessage, "Subscription id already in use"));
        }
        let mut subscription = store.subscribe(path).await?;
        self.send(RelayMessage::Ok { id }).await;

        let outgoing = self.outgoing.clone();
        let task = tokio::spawn(async move {
            while let Some(value) = subscription.updates.recv().await {
                if outgoing.send(RelayMessage::Snapshot { subscription: id, value }).await.is_err() {
                    break;
                }
            }
        });
        debug!(subscription = id, %path, "Client {} subscribed", self.addr);
        self.subscriptions.insert(id, Forwarder { handle: subscription.handle, task });
        Ok(())
    }

    /// Run disconnect removals and drop all subscriptions.
    async fn close(self, store: &MemoryStore) {
        for (_, forwarder) in self.subscriptions {
            forwarder.task.abort();
            let _ = store.unsubscribe(forwarder.handle).await;
        }
        for path in &self.disconnect_paths {
            match store.remove(path).await {
                Ok(()) => debug!(%path, "Removed on disconnect of {}", self.addr),
                Err(e) => warn!(%path, "Disconnect removal failed for {}: {}", self.addr, e),
            }
        }
    }
}
