//! Clocks
//!
//! Millisecond clocks used for server timestamps and liveness ages.
//! All presence arithmetic is done in milliseconds since the Unix epoch.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time (ms).
    fn now_millis(&self) -> i64;
}

/// Wall clock anchored once, then advanced by the tokio monotonic clock.
///
/// Never jumps backward, and follows `tokio::time::pause()` in tests.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
    epoch_millis: i64,
}

impl SystemClock {
    /// Anchor to the current wall-clock time.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            epoch_millis: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Anchor to an explicit epoch time.
    pub fn anchored_at(epoch_millis: i64) -> Self {
        Self {
            origin: Instant::now(),
            epoch_millis,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.epoch_millis.saturating_add(elapsed)
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Start at `millis`.
    pub fn new(millis: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(millis)),
        }
    }

    /// Move forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to `millis`.
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Issues server timestamps that strictly increase across every write.
#[derive(Debug)]
pub struct ServerClock {
    clock: Arc<dyn Clock>,
    last: Mutex<i64>,
}

impl ServerClock {
    /// Wrap a time source.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(i64::MIN),
        }
    }

    /// Current time without reserving a timestamp.
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Reserve the next write timestamp: `max(now, last + 1)`.
    pub fn next_timestamp(&self) -> i64 {
        let now = self.clock.now_millis();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ts = if *last == i64::MIN { now } else { now.max(*last + 1) };
        *last = ts;
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_clock_strictly_increases_when_time_stands_still() {
        let manual = ManualClock::new(1_000);
        let server = ServerClock::new(Arc::new(manual.clone()));

        let a = server.next_timestamp();
        let b = server.next_timestamp();
        let c = server.next_timestamp();
        assert_eq!(a, 1_000);
        assert!(b > a && c > b);

        manual.advance(500);
        assert_eq!(server.next_timestamp(), 1_500);
    }

    #[test]
    fn test_server_clock_ignores_backward_jumps() {
        let manual = ManualClock::new(10_000);
        let server = ServerClock::new(Arc::new(manual.clone()));
        let first = server.next_timestamp();

        manual.set(5_000);
        assert!(server.next_timestamp() > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_paused_time() {
        let clock = SystemClock::anchored_at(42_000);
        assert_eq!(clock.now_millis(), 42_000);

        tokio::time::advance(std::time::Duration::from_millis(1_250)).await;
        assert_eq!(clock.now_millis(), 43_250);
    }
}
