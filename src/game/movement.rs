//! Local Movement Gating
//!
//! Turns directional input into at most one step per cooldown. The state
//! machine is `Idle -> Cooling -> Idle`:
//!
//! - An accepted step starts a full step cooldown.
//! - A blocked step turns in place and starts the shorter turn cooldown;
//!   bumping an obstacle already faced changes nothing.
//! - Input while cooling only updates the facing.
//!
//! Pacing is therefore independent of the keyboard's repeat rate.

use std::time::{Duration, Instant};

use crate::core::grid::{Facing, GridPos};
use crate::game::map::TileMap;

/// Default cooldown after a step.
pub const STEP_COOLDOWN: Duration = Duration::from_millis(150);

/// Default cooldown after a turn without displacement.
pub const TURN_COOLDOWN: Duration = Duration::from_millis(75);

/// Cooldown state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownState {
    /// Ready to accept a step.
    Idle,
    /// Throttled until the given instant.
    Cooling {
        /// When input is accepted again.
        until: Instant,
    },
}

/// Result of one directional input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Moved one cell.
    Stepped {
        /// Previous cell.
        from: GridPos,
        /// New cell.
        to: GridPos,
    },
    /// Facing changed, position did not.
    Turned,
    /// Nothing changed.
    Unchanged,
}

impl MoveOutcome {
    /// Whether anything worth publishing changed.
    pub fn is_change(&self) -> bool {
        !matches!(self, MoveOutcome::Unchanged)
    }
}

/// Movement state of the local player.
#[derive(Clone, Debug)]
pub struct MovementController {
    position: GridPos,
    facing: Facing,
    state: CooldownState,
    step_cooldown: Duration,
    turn_cooldown: Duration,
}

impl MovementController {
    /// Start idle at `position` facing `facing`, with the default cooldowns.
    pub fn new(position: GridPos, facing: Facing) -> Self {
        Self::with_cooldowns(position, facing, STEP_COOLDOWN, TURN_COOLDOWN)
    }

    /// Start idle with explicit cooldowns.
    pub fn with_cooldowns(
        position: GridPos,
        facing: Facing,
        step_cooldown: Duration,
        turn_cooldown: Duration,
    ) -> Self {
        Self {
            position,
            facing,
            state: CooldownState::Idle,
            step_cooldown,
            turn_cooldown,
        }
    }

    /// Current cell.
    pub fn position(&self) -> GridPos {
        self.position
    }

    /// Current facing.
    pub fn facing(&self) -> Facing {
        self.facing
    }

    /// Cooldown state as of `now`. A lapsed cooldown reads as `Idle`.
    pub fn state(&self, now: Instant) -> CooldownState {
        match self.state {
            CooldownState::Cooling { until } if now < until => self.state,
            _ => CooldownState::Idle,
        }
    }

    /// Apply one directional input at `now`.
    pub fn handle_input(&mut self, direction: Facing, map: &TileMap, now: Instant) -> MoveOutcome {
        let turned = self.facing != direction;
        self.facing = direction;

        if let CooldownState::Cooling { .. } = self.state(now) {
            return if turned { MoveOutcome::Turned } else { MoveOutcome::Unchanged };
        }

        let target = self.position.step(direction);
        if map.is_walkable(target) {
            let from = self.position;
            self.position = target;
            self.state = CooldownState::Cooling { until: now + self.step_cooldown };
            MoveOutcome::Stepped { from, to: target }
        } else if turned {
            self.state = CooldownState::Cooling { until: now + self.turn_cooldown };
            MoveOutcome::Turned
        } else {
            // Bumping an obstacle while already facing it.
            MoveOutcome::Unchanged
        }
    }
}
