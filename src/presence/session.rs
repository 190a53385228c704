//! Player Session
//!
//! One signed-in player: movement gating, the presence synchronizer and the
//! persisted profile, wired together for the lifetime of a sign-in.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PresenceConfig;
use crate::core::clock::Clock;
use crate::core::grid::{Facing, GridPos};
use crate::core::timer::TaskSlot;
use crate::game::map::TileMap;
use crate::game::movement::{MoveOutcome, MovementController};
use crate::identity::Identity;
use crate::presence::profile::{ProfileStore, DEFAULT_SPAWN};
use crate::presence::synchronizer::{LocalPlayer, PresenceError, PresenceSynchronizer, StatePublisher};
use crate::presence::view::PresenceSnapshot;
use crate::store::RealtimeStore;

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Local identity.
    pub identity: String,
    /// Local cell.
    pub position: GridPos,
    /// Local facing.
    pub facing: Facing,
    /// Whether the local player is between steps.
    pub is_moving: bool,
    /// Visible remote players.
    pub remote: PresenceSnapshot,
}

/// A running session for one identity.
pub struct PlayerSession {
    identity: Identity,
    config: PresenceConfig,
    map: Arc<TileMap>,
    movement: MovementController,
    sync: PresenceSynchronizer,
    state: StatePublisher,
    profiles: ProfileStore,
    idle: TaskSlot,
    /// When the local player counts as stopped, while moving.
    idle_deadline: Option<Instant>,
}

impl PlayerSession {
    /// Load the profile, publish the initial record and subscribe to others.
    pub async fn start(
        identity: Identity,
        store: Arc<dyn RealtimeStore>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
        map: Arc<TileMap>,
    ) -> Result<Self, PresenceError> {
        let profiles = ProfileStore::new(store.clone(), &identity.id)?;
        let profile = profiles.load_or_create(&identity).await;

        let position = if map.is_walkable(profile.position) {
            profile.position
        } else {
            warn!(identity = %identity.id, position = %profile.position, "Saved position not walkable, respawning");
            DEFAULT_SPAWN
        };
        let facing = profile.last_direction;

        let display_name = if profile.username.is_empty() {
            identity.display_name.clone()
        } else {
            profile.username.clone()
        };

        let mut sync = PresenceSynchronizer::start(
            store,
            clock,
            config.clone(),
            LocalPlayer {
                identity: identity.id.clone(),
                display_name,
                position,
                facing,
            },
        )?;

        let watched = identity.id.clone();
        let subscribed = sync
            .subscribe_remote_states(move |snapshot| {
                debug!(identity = %watched, visible = snapshot.len(), "Remote players changed");
            })
            .await;
        if let Err(e) = subscribed {
            sync.teardown().await;
            return Err(e);
        }

        info!(identity = %identity.id, %position, "Session started");
        Ok(Self {
            movement: MovementController::with_cooldowns(
                position,
                facing,
                config.step_cooldown(),
                config.turn_cooldown(),
            ),
            state: sync.state_publisher(),
            identity,
            config,
            map,
            sync,
            profiles,
            idle: TaskSlot::new(),
            idle_deadline: None,
        })
    }

    /// The signed-in identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Local cell.
    pub fn position(&self) -> GridPos {
        self.movement.position()
    }

    /// Local facing.
    pub fn facing(&self) -> Facing {
        self.movement.facing()
    }

    /// Whether the local player is between steps.
    pub fn is_moving(&self) -> bool {
        self.idle_deadline.is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Apply one directional input and publish the result.
    pub fn handle_move(&mut self, direction: Facing) -> MoveOutcome {
        let now = Instant::now();
        let outcome = self.movement.handle_input(direction, &self.map, now.into_std());
        let (position, facing) = (self.position(), self.facing());

        match outcome {
            MoveOutcome::Stepped { .. } => {
                self.state.publish_local_state(position, facing, true);
                self.arm_idle(now + self.config.idle_after());
            }
            MoveOutcome::Turned => {
                let moving = self.is_moving();
                self.state.publish_local_state(position, facing, moving);
                if let (true, Some(deadline)) = (moving, self.idle_deadline) {
                    // Keep the stop deadline; the stop must carry the new facing.
                    self.arm_idle(deadline);
                }
            }
            MoveOutcome::Unchanged => {}
        }
        outcome
    }

    /// At `deadline`: publish `isMoving=false` and save the profile.
    fn arm_idle(&mut self, deadline: Instant) {
        let state = self.state.clone();
        let profiles = self.profiles.clone();
        let (position, facing) = (self.position(), self.facing());
        self.idle_deadline = Some(deadline);
        self.idle.arm(deadline.saturating_duration_since(Instant::now()), async move {
            state.publish_local_state(position, facing, false);
            if let Err(e) = profiles.save_position(position, facing).await {
                warn!("Could not save profile: {}", e);
            }
        });
    }

    /// Show a chat bubble. Returns the text as published.
    pub fn send_chat(&mut self, text: &str) -> Result<String, PresenceError> {
        self.sync.publish_chat_message(text)
    }

    /// Visible remote players, updated on every change.
    pub fn remote_states(&self) -> watch::Receiver<PresenceSnapshot> {
        self.sync.remote_states()
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            identity: self.identity.id.clone(),
            position: self.position(),
            facing: self.facing(),
            is_moving: self.is_moving(),
            remote: self.sync.remote_states().borrow().clone(),
        }
    }

    /// End the session and delete the presence record.
    ///
    /// A stop that has not fired yet is saved to the profile first.
    pub async fn end(mut self) {
        if self.idle.is_active() {
            self.idle.cancel();
            if let Err(e) = self.profiles.save_position(self.position(), self.facing()).await {
                warn!("Could not save profile: {}", e);
            }
        }
        info!(identity = %self.identity.id, position = %self.position(), "Session ending");
        self.sync.teardown().await;
    }
}
