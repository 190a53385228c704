//! Presence Synchronizer
//!
//! Publishes one local player's record and maintains the derived view of
//! every other player.
//!
//! ```text
//!   publish_* ──► PublishQueue ──► worker ──► store: online_players/{id}
//!   keep-alive task ─┘   chat-clear task ─┘
//!
//!   store: online_players ──► ingest task ──► PresenceView ──► callback
//!                                 ▲  sleeps to next deadline    └─► watch
//! ```
//!
//! Store errors never reach callers of the publish operations; the worker
//! logs them after its single retry.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::config::PresenceConfig;
use crate::core::clock::Clock;
use crate::core::grid::{Facing, GridPos};
use crate::core::timer::TaskSlot;
use crate::presence::publisher::{PublishOp, PublishQueue, Publisher};
use crate::presence::record;
use crate::presence::view::{PresenceSnapshot, PresenceView};
use crate::store::{
    player_path, RealtimeStore, StoreError, StorePath, SubscriptionHandle, ONLINE_PLAYERS,
};

/// Presence errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Chat text was empty after trimming.
    #[error("chat message is empty")]
    EmptyChatMessage,
    /// `subscribe_remote_states` was already called.
    #[error("remote states are already subscribed")]
    AlreadySubscribed,
    /// Store failure outside the publish path.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Callback receiving every changed snapshot of remote players.
pub type SnapshotCallback = Box<dyn Fn(&PresenceSnapshot) + Send + Sync>;

/// Who the local player is and where they start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlayer {
    /// Identity handle.
    pub identity: String,
    /// Published display name.
    pub display_name: String,
    /// Starting cell.
    pub position: GridPos,
    /// Starting facing.
    pub facing: Facing,
}

/// Cloneable publisher of the local record's state fields.
#[derive(Clone)]
pub struct StatePublisher {
    queue: PublishQueue,
    path: StorePath,
}

impl StatePublisher {
    /// Merge position, facing and the movement flag.
    pub fn publish_local_state(&self, position: GridPos, facing: Facing, is_moving: bool) {
        self.queue.enqueue(PublishOp::Merge {
            path: self.path.clone(),
            patch: record::state_patch(position, facing, is_moving),
        });
    }

    /// Refresh only `lastUpdated`.
    pub fn publish_keep_alive(&self) {
        self.queue.enqueue(PublishOp::Merge {
            path: self.path.clone(),
            patch: record::keep_alive_patch(),
        });
    }

    fn publish_chat(&self, text: Option<&str>) {
        self.queue.enqueue(PublishOp::Merge {
            path: self.path.clone(),
            patch: record::chat_patch(text),
        });
    }
}

/// Trim `text` and cut it to `max_len` chars.
pub fn normalize_chat(text: &str, max_len: usize) -> Result<String, PresenceError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(PresenceError::EmptyChatMessage);
    }
    Ok(trimmed.chars().take(max_len).collect())
}

/// Publishes the local record and derives the remote view.
pub struct PresenceSynchronizer {
    identity: String,
    config: PresenceConfig,
    store: Arc<dyn RealtimeStore>,
    clock: Arc<dyn Clock>,
    publisher: Publisher,
    state: StatePublisher,
    keep_alive: TaskSlot,
    chat_clear: TaskSlot,
    ingest: TaskSlot,
    subscription: Option<SubscriptionHandle>,
    snapshots: watch::Sender<PresenceSnapshot>,
}

impl PresenceSynchronizer {
    /// Publish the initial record and start the keep-alive.
    ///
    /// The initial write replaces any leftover record; the store is then
    /// asked to remove the record if this client drops.
    #[instrument(skip_all, fields(identity = %local.identity))]
    pub fn start(
        store: Arc<dyn RealtimeStore>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
        local: LocalPlayer,
    ) -> Result<Self, PresenceError> {
        let path = player_path(&local.identity)?;
        let publisher = Publisher::spawn(store.clone(), config.retry_delay());
        let state = StatePublisher { queue: publisher.queue(), path: path.clone() };

        publisher.enqueue(PublishOp::Write {
            path: path.clone(),
            value: record::initial_value(&local.display_name, local.position, local.facing),
        });
        publisher.enqueue(PublishOp::RemoveOnDisconnect { path });

        let mut keep_alive = TaskSlot::new();
        let ticker = state.clone();
        let period = config.keep_alive();
        keep_alive.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                ticker.publish_keep_alive();
            }
        });

        info!(position = %local.position, facing = %local.facing, "Presence started");
        let (snapshots, _) = watch::channel(PresenceSnapshot::default());

        Ok(Self {
            identity: local.identity,
            config,
            store,
            clock,
            publisher,
            state,
            keep_alive,
            chat_clear: TaskSlot::new(),
            ingest: TaskSlot::new(),
            subscription: None,
            snapshots,
        })
    }

    /// Local identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Cloneable handle publishing state fields of the local record.
    pub fn state_publisher(&self) -> StatePublisher {
        self.state.clone()
    }

    /// Merge position, facing and the movement flag. Returns immediately.
    pub fn publish_local_state(&self, position: GridPos, facing: Facing, is_moving: bool) {
        self.state.publish_local_state(position, facing, is_moving);
    }

    /// Refresh `lastUpdated` only.
    pub fn publish_keep_alive(&self) {
        self.state.publish_keep_alive();
    }

    /// Show a chat bubble, cleared after the display duration.
    ///
    /// Replaces any pending clear. Returns the text as published.
    pub fn publish_chat_message(&mut self, text: &str) -> Result<String, PresenceError> {
        let text = normalize_chat(text, self.config.chat_max_len)?;
        self.state.publish_chat(Some(&text));

        let clear = self.state.clone();
        self.chat_clear.arm(self.config.chat_duration(), async move {
            clear.publish_chat(None);
        });
        debug!(identity = %self.identity, chars = text.chars().count(), "Chat published");
        Ok(text)
    }

    /// Start ingesting the player collection.
    ///
    /// `callback` runs (on the ingest task) with every snapshot that differs
    /// from the previous one; the same snapshots feed [`Self::remote_states`].
    #[instrument(skip_all, fields(identity = %self.identity))]
    pub async fn subscribe_remote_states<F>(&mut self, callback: F) -> Result<(), PresenceError>
    where
        F: Fn(&PresenceSnapshot) + Send + Sync + 'static,
    {
        if self.subscription.is_some() {
            return Err(PresenceError::AlreadySubscribed);
        }

        let offset = self.estimate_server_offset().await;
        let subscription = self.store.subscribe(&StorePath::parse(ONLINE_PLAYERS)?).await?;
        self.subscription = Some(subscription.handle);

        let mut view = PresenceView::new(&self.identity, self.config.staleness(), self.config.smoothing());
        view.set_server_offset(offset);
        self.ingest.spawn(run_ingest(
            view,
            subscription.updates,
            self.clock.clone(),
            Box::new(callback),
            self.snapshots.clone(),
        ));
        Ok(())
    }

    /// Latest snapshot of visible remote players, updated on every change.
    pub fn remote_states(&self) -> watch::Receiver<PresenceSnapshot> {
        self.snapshots.subscribe()
    }

    /// `server - local` in ms, measured against the midpoint of the request.
    async fn estimate_server_offset(&self) -> i64 {
        let before = self.clock.now_millis();
        match self.store.server_time().await {
            Ok(server) => {
                let after = self.clock.now_millis();
                let offset = server - (before + (after - before) / 2);
                debug!(offset, "Estimated server clock offset");
                offset
            }
            Err(e) => {
                warn!("Server time unavailable, assuming no offset: {}", e);
                0
            }
        }
    }

    /// End the session: stop timers and ingest, then delete the record
    /// behind any pending writes, waiting at most the flush timeout.
    #[instrument(skip_all, fields(identity = %self.identity))]
    pub async fn teardown(mut self) {
        self.keep_alive.cancel();
        self.chat_clear.cancel();
        self.ingest.cancel();

        if let Some(handle) = self.subscription.take() {
            if let Err(e) = self.store.unsubscribe(handle).await {
                debug!("Unsubscribe failed: {}", e);
            }
        }

        self.publisher.enqueue(PublishOp::Remove { path: self.state.path.clone() });
        if self.publisher.flush(self.config.teardown_timeout()).await {
            info!("Presence ended");
        } else {
            warn!("Presence ended before pending writes drained");
        }
    }
}

async fn run_ingest(
    mut view: PresenceView,
    mut updates: mpsc::UnboundedReceiver<Option<serde_json::Value>>,
    clock: Arc<dyn Clock>,
    callback: SnapshotCallback,
    snapshots: watch::Sender<PresenceSnapshot>,
) {
    let mut last = PresenceSnapshot::default();
    let mut subscribed = true;
    loop {
        let now = clock.now_millis();
        let wake = view
            .next_deadline(now)
            .map(|deadline| Duration::from_millis(u64::try_from(deadline - now).unwrap_or(0)));

        tokio::select! {
            delivery = updates.recv(), if subscribed => match delivery {
                Some(value) => view.apply_delivery(value.as_ref(), clock.now_millis()),
                None => {
                    // Tracked players keep aging out on their deadlines.
                    warn!(tracked = view.tracked_count(), "Player subscription closed, no further deliveries");
                    subscribed = false;
                }
            },
            _ = sleep_or_forever(wake) => {}
        }

        let now = clock.now_millis();
        view.poll_timers(now);
        let snapshot = view.snapshot(now);
        if snapshot != last {
            callback(&snapshot);
            snapshots.send_replace(snapshot.clone());
            last = snapshot;
        }
    }
}

async fn sleep_or_forever(wake: Option<Duration>) {
    match wake {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
