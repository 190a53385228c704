//! Session Supervisor
//!
//! Follows the identity service: a new identity ends the running session and
//! starts one for the newcomer, signing out ends it. Player commands are
//! routed to whichever session is active.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::PresenceConfig;
use crate::core::clock::Clock;
use crate::core::grid::Facing;
use crate::game::map::TileMap;
use crate::identity::{Identity, IdentityService};
use crate::presence::session::{PlayerSession, SessionStatus};
use crate::store::{RealtimeStore, RemoteStore, StoreError};

/// Opens a store connection for a signed-in identity.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Store to publish through as `identity`.
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn RealtimeStore>, StoreError>;
}

/// Every identity shares one in-process store.
pub struct SharedStore(pub Arc<dyn RealtimeStore>);

#[async_trait]
impl StoreConnector for SharedStore {
    async fn connect(&self, _identity: &Identity) -> Result<Arc<dyn RealtimeStore>, StoreError> {
        Ok(self.0.clone())
    }
}

/// One relay connection per identity, authenticated with its token.
pub struct RelayConnector {
    /// Relay WebSocket URL.
    pub url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

#[async_trait]
impl StoreConnector for RelayConnector {
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn RealtimeStore>, StoreError> {
        let store = RemoteStore::connect(&self.url, &identity.token, self.request_timeout).await?;
        Ok(Arc::new(store))
    }
}

/// Input for the active session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Directional input.
    Move(Facing),
    /// Chat bubble text.
    Chat(String),
    /// Report the active session's status (`None` when signed out).
    Status(oneshot::Sender<Option<SessionStatus>>),
}

/// Runs presence sessions for whoever is signed in.
pub struct PresenceClient {
    identity: Arc<dyn IdentityService>,
    connector: Arc<dyn StoreConnector>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
    map: Arc<TileMap>,
}

impl PresenceClient {
    /// Create a client.
    pub fn new(
        identity: Arc<dyn IdentityService>,
        connector: Arc<dyn StoreConnector>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
        map: Arc<TileMap>,
    ) -> Self {
        Self {
            identity,
            connector,
            clock,
            config,
            map,
        }
    }

    /// Supervise sessions until `commands` closes or the identity service
    /// goes away; the active session is ended either way.
    pub async fn run(self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut identities = self.identity.watch();
        let mut session: Option<PlayerSession> = None;

        let initial = identities.borrow_and_update().clone();
        self.switch(&mut session, initial).await;

        loop {
            tokio::select! {
                changed = identities.changed() => {
                    if changed.is_err() {
                        debug!("Identity service closed");
                        break;
                    }
                    let next = identities.borrow_and_update().clone();
                    self.switch(&mut session, next).await;
                }
                command = commands.recv() => match command {
                    Some(command) => Self::route(session.as_mut(), command),
                    None => break,
                },
            }
        }

        if let Some(active) = session.take() {
            active.end().await;
        }
    }

    async fn switch(&self, session: &mut Option<PlayerSession>, next: Option<Identity>) {
        let current = session.as_ref().map(|s| s.identity().id.clone());
        if current == next.as_ref().map(|i| i.id.clone()) {
            return;
        }

        if let Some(previous) = session.take() {
            previous.end().await;
        }
        let Some(identity) = next else {
            info!("Signed out, no active session");
            return;
        };

        let store = match self.connector.connect(&identity).await {
            Ok(store) => store,
            Err(e) => {
                error!(identity = %identity.id, "Could not connect store: {}", e);
                return;
            }
        };
        let id = identity.id.clone();
        match PlayerSession::start(identity, store, self.clock.clone(), self.config.clone(), self.map.clone()).await {
            Ok(started) => *session = Some(started),
            Err(e) => error!(identity = %id, "Could not start session: {}", e),
        }
    }

    fn route(session: Option<&mut PlayerSession>, command: SessionCommand) {
        let Some(active) = session else {
            match command {
                SessionCommand::Status(reply) => {
                    let _ = reply.send(None);
                }
                command => debug!(?command, "No active session, dropping command"),
            }
            return;
        };

        match command {
            SessionCommand::Move(direction) => {
                active.handle_move(direction);
            }
            SessionCommand::Chat(text) => {
                if let Err(e) = active.send_chat(&text) {
                    warn!(identity = %active.identity().id, "Chat rejected: {}", e);
                }
            }
            SessionCommand::Status(reply) => {
                let _ = reply.send(Some(active.status()));
            }
        }
    }
}
