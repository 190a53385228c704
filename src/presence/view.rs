//! Remote Presence View
//!
//! The locally derived picture of everyone else. Each delivery of the
//! `online_players` collection replaces the tracked set; per identity the
//! view keeps the last applied record, a motion smoother and the displayed
//! facing. Liveness is computed against the estimated server clock.
//!
//! All methods take `now` in local milliseconds.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::core::grid::Facing;
use crate::presence::record::PlayerRecord;
use crate::presence::smoothing::MotionSmoother;

/// One remote player as seen locally.
///
/// Equality covers what is displayed; `record.last_updated` is left out, so
/// a keep-alive alone does not produce a new snapshot.
#[derive(Debug, Clone, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteView {
    /// The player's identity.
    pub identity: String,
    /// Last applied record.
    pub record: PlayerRecord,
    /// Smoothed movement flag.
    pub display_moving: bool,
    /// Direction of travel derived from consecutive positions.
    pub display_facing: Facing,
    /// Silent for longer than the staleness threshold.
    pub inferred_stale: bool,
}

impl PartialEq for RemoteView {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&self.record, &other.record);
        self.identity == other.identity
            && self.display_moving == other.display_moving
            && self.display_facing == other.display_facing
            && self.inferred_stale == other.inferred_stale
            && a.display_name == b.display_name
            && a.position == b.position
            && a.facing == b.facing
            && a.is_moving == b.is_moving
            && a.chat_message == b.chat_message
    }
}

/// Immutable set of visible remote players, keyed by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
    players: BTreeMap<String, RemoteView>,
}

impl PresenceSnapshot {
    /// Visible player by identity.
    pub fn get(&self, identity: &str) -> Option<&RemoteView> {
        self.players.get(identity)
    }

    /// Whether `identity` is visible.
    pub fn contains(&self, identity: &str) -> bool {
        self.players.contains_key(identity)
    }

    /// Number of visible players.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Whether nobody else is visible.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Visible players in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &RemoteView> {
        self.players.values()
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    record: PlayerRecord,
    smoother: MotionSmoother,
    display_facing: Facing,
}

/// Derived view of all remote players.
#[derive(Debug)]
pub struct PresenceView {
    local_identity: String,
    staleness_ms: i64,
    smoothing: Duration,
    /// Estimated `server clock - local clock`.
    server_offset_ms: i64,
    players: BTreeMap<String, Tracked>,
}

impl PresenceView {
    /// Empty view for the player `local_identity`.
    pub fn new(local_identity: impl Into<String>, staleness: Duration, smoothing: Duration) -> Self {
        Self {
            local_identity: local_identity.into(),
            staleness_ms: i64::try_from(staleness.as_millis()).unwrap_or(i64::MAX),
            smoothing,
            server_offset_ms: 0,
            players: BTreeMap::new(),
        }
    }

    /// Set the estimated server clock offset.
    pub fn set_server_offset(&mut self, offset_ms: i64) {
        self.server_offset_ms = offset_ms;
    }

    /// Estimated server clock offset.
    pub fn server_offset(&self) -> i64 {
        self.server_offset_ms
    }

    /// Number of tracked remote players, stale ones included.
    pub fn tracked_count(&self) -> usize {
        self.players.len()
    }

    /// Ingest one full delivery of the player collection.
    pub fn apply_delivery(&mut self, delivery: Option<&Value>, now: i64) {
        let Some(entries) = delivery.and_then(Value::as_object) else {
            self.players.clear();
            return;
        };

        self.players.retain(|identity, _| entries.contains_key(identity));

        for (identity, value) in entries {
            if *identity == self.local_identity {
                continue;
            }
            match PlayerRecord::from_store(value) {
                Some(record) => self.apply_record(identity, record, now),
                None => {
                    debug!(%identity, "Dropping undecodable player record");
                    self.players.remove(identity);
                }
            }
        }
    }

    fn apply_record(&mut self, identity: &str, record: PlayerRecord, now: i64) {
        let Some(tracked) = self.players.get_mut(identity) else {
            self.players.insert(
                identity.to_string(),
                Tracked {
                    display_facing: record.facing,
                    record,
                    smoother: MotionSmoother::new(self.smoothing),
                },
            );
            return;
        };

        if record.last_updated <= tracked.record.last_updated {
            trace!(%identity, last_updated = record.last_updated, "Ignoring record that is not newer");
            return;
        }

        let from = tracked.record.position;
        if record.position != from {
            tracked.smoother.moved(now);
            tracked.display_facing = from.travel_direction(record.position).unwrap_or(record.facing);
        } else if !tracked.smoother.is_moving(now) {
            // A turn in place while standing still.
            tracked.display_facing = record.facing;
        }
        tracked.record = record;
    }

    /// Apply elapsed time to every smoother.
    pub fn poll_timers(&mut self, now: i64) {
        for tracked in self.players.values_mut() {
            tracked.smoother.poll(now);
        }
    }

    fn is_stale(&self, record: &PlayerRecord, now: i64) -> bool {
        let server_now = now.saturating_add(self.server_offset_ms);
        server_now.saturating_sub(record.last_updated) > self.staleness_ms
    }

    /// The tracked view of `identity`, stale or not.
    pub fn remote(&self, identity: &str, now: i64) -> Option<RemoteView> {
        self.players
            .get(identity)
            .map(|tracked| self.view_of(identity, tracked, now))
    }

    fn view_of(&self, identity: &str, tracked: &Tracked, now: i64) -> RemoteView {
        RemoteView {
            identity: identity.to_string(),
            record: tracked.record.clone(),
            display_moving: tracked.smoother.is_moving(now),
            display_facing: tracked.display_facing,
            inferred_stale: self.is_stale(&tracked.record, now),
        }
    }

    /// Visible (non-stale) players at `now`.
    pub fn snapshot(&self, now: i64) -> PresenceSnapshot {
        let players = self
            .players
            .iter()
            .map(|(identity, tracked)| self.view_of(identity, tracked, now))
            .filter(|view| !view.inferred_stale)
            .map(|view| (view.identity.clone(), view))
            .collect();
        PresenceSnapshot { players }
    }

    /// Earliest future instant (local ms) at which the snapshot can change
    /// without a new delivery.
    pub fn next_deadline(&self, now: i64) -> Option<i64> {
        self.players
            .values()
            .flat_map(|tracked| {
                let stale_at = tracked
                    .record
                    .last_updated
                    .saturating_add(self.staleness_ms)
                    .saturating_add(1)
                    .saturating_sub(self.server_offset_ms);
                [tracked.smoother.deadline(), Some(stale_at)]
            })
            .flatten()
            .filter(|deadline| *deadline > now)
            .min()
    }
}
