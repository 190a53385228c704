//! Movement Smoothing
//!
//! Remote positions arrive as discrete jumps. A smoother turns them into a
//! steady "moving" flag: each position change starts (or restarts) a window,
//! and the flag drops once a full window passes without another change.
//!
//! Times are local milliseconds; the smoother owns no timer. Whoever drives
//! it sleeps until [`MotionSmoother::deadline`] and then calls `poll`.

use std::time::Duration;

/// Smoother state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionState {
    /// No recent position change.
    Still,
    /// Position changed recently; moving until `until` (exclusive).
    Moving {
        /// Local ms at which the flag drops.
        until: i64,
    },
}

/// Per-identity movement smoother.
#[derive(Clone, Debug)]
pub struct MotionSmoother {
    window_ms: i64,
    state: MotionState,
}

impl MotionSmoother {
    /// Smoother with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            state: MotionState::Still,
        }
    }

    /// Current state, without applying elapsed time.
    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Record a position change at `now`.
    pub fn moved(&mut self, now: i64) {
        self.state = MotionState::Moving { until: now.saturating_add(self.window_ms) };
    }

    /// Displayed flag at `now`.
    pub fn is_moving(&self, now: i64) -> bool {
        matches!(self.state, MotionState::Moving { until } if now < until)
    }

    /// Apply elapsed time. Returns whether the state changed.
    pub fn poll(&mut self, now: i64) -> bool {
        match self.state {
            MotionState::Moving { until } if now >= until => {
                self.state = MotionState::Still;
                true
            }
            _ => false,
        }
    }

    /// When the flag will drop, if moving.
    pub fn deadline(&self) -> Option<i64> {
        match self.state {
            MotionState::Moving { until } => Some(until),
            MotionState::Still => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(600);

    #[test]
    fn test_window_boundaries() {
        let mut smoother = MotionSmoother::new(WINDOW);
        assert!(!smoother.is_moving(0));

        smoother.moved(1_000);
        assert!(smoother.is_moving(1_000));
        assert!(smoother.is_moving(1_599));
        assert!(!smoother.is_moving(1_600));
        assert!(!smoother.is_moving(1_601));
    }

    #[test]
    fn test_new_change_restarts_window() {
        let mut smoother = MotionSmoother::new(WINDOW);
        smoother.moved(0);
        smoother.moved(400);
        assert!(smoother.is_moving(900));
        assert_eq!(smoother.deadline(), Some(1_000));
    }

    #[test]
    fn test_poll_settles_once() {
        let mut smoother = MotionSmoother::new(WINDOW);
        smoother.moved(0);
        assert!(!smoother.poll(599));
        assert!(smoother.poll(600));
        assert!(!smoother.poll(700));
        assert_eq!(smoother.state(), MotionState::Still);
        assert_eq!(smoother.deadline(), None);
    }
}
