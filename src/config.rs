//! Configuration
//!
//! Presence timings and relay settings. Defaults match the shipped game;
//! every value can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::identity::token::AuthConfig;

/// Presence timings and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Silence after which a remote record is hidden (ms).
    pub staleness_ms: u64,
    /// Keep-alive publish interval (ms).
    pub keep_alive_ms: u64,
    /// Remote movement smoothing window (ms).
    pub smoothing_ms: u64,
    /// Delay before the single publish retry (ms).
    pub retry_delay_ms: u64,
    /// How long a chat bubble stays up (ms).
    pub chat_duration_ms: u64,
    /// Maximum chat length in chars.
    pub chat_max_len: usize,
    /// Cooldown after a step (ms).
    pub step_cooldown_ms: u64,
    /// Cooldown after a turn without displacement (ms).
    pub turn_cooldown_ms: u64,
    /// Quiet time after the last step before the local player counts as idle (ms).
    pub idle_after_ms: u64,
    /// Upper bound on the teardown flush (ms).
    pub teardown_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            staleness_ms: 10_000,
            keep_alive_ms: 3_000,
            smoothing_ms: 600,
            retry_delay_ms: 250,
            chat_duration_ms: 5_000,
            chat_max_len: 100,
            step_cooldown_ms: 150,
            turn_cooldown_ms: 75,
            idle_after_ms: 250,
            teardown_timeout_ms: 2_000,
        }
    }
}

impl PresenceConfig {
    /// Defaults overridden by `PRESENCE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            staleness_ms: env_or("PRESENCE_STALENESS_MS", defaults.staleness_ms),
            keep_alive_ms: env_or("PRESENCE_KEEPALIVE_MS", defaults.keep_alive_ms),
            smoothing_ms: env_or("PRESENCE_SMOOTHING_MS", defaults.smoothing_ms),
            retry_delay_ms: env_or("PRESENCE_RETRY_DELAY_MS", defaults.retry_delay_ms),
            chat_duration_ms: env_or("PRESENCE_CHAT_DURATION_MS", defaults.chat_duration_ms),
            chat_max_len: env_or("PRESENCE_CHAT_MAX_LEN", defaults.chat_max_len),
            step_cooldown_ms: env_or("PRESENCE_STEP_COOLDOWN_MS", defaults.step_cooldown_ms),
            turn_cooldown_ms: env_or("PRESENCE_TURN_COOLDOWN_MS", defaults.turn_cooldown_ms),
            idle_after_ms: env_or("PRESENCE_IDLE_AFTER_MS", defaults.idle_after_ms),
            teardown_timeout_ms: env_or("PRESENCE_TEARDOWN_TIMEOUT_MS", defaults.teardown_timeout_ms),
        }
    }

    /// Staleness threshold.
    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    /// Keep-alive interval. Never zero.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms.max(1))
    }

    /// Smoothing window.
    pub fn smoothing(&self) -> Duration {
        Duration::from_millis(self.smoothing_ms)
    }

    /// Publish retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Chat display duration.
    pub fn chat_duration(&self) -> Duration {
        Duration::from_millis(self.chat_duration_ms)
    }

    /// Step cooldown.
    pub fn step_cooldown(&self) -> Duration {
        Duration::from_millis(self.step_cooldown_ms)
    }

    /// Turn cooldown.
    pub fn turn_cooldown(&self) -> Duration {
        Duration::from_millis(self.turn_cooldown_ms)
    }

    /// Idle-after delay.
    pub fn idle_after(&self) -> Duration {
        Duration::from_millis(self.idle_after_ms)
    }

    /// Teardown flush timeout.
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Token validation.
    pub auth: AuthConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9040)),
            max_connections: 256,
            auth: AuthConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `PRESENCE_RELAY_*` and `AUTH_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("PRESENCE_RELAY_ADDR", defaults.bind_addr),
            max_connections: env_or("PRESENCE_RELAY_MAX_CONNECTIONS", defaults.max_connections),
            auth: AuthConfig::from_env(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(key, %raw, "Ignoring invalid setting: {}", e);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_defaults() {
        let config = PresenceConfig::default();
        assert_eq!(config.staleness(), Duration::from_secs(10));
        assert_eq!(config.keep_alive(), Duration::from_secs(3));
        assert_eq!(config.smoothing(), Duration::from_millis(600));
        assert_eq!(config.chat_max_len, 100);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PresenceConfig = serde_json::from_str(r#"{"staleness_ms": 4000}"#).unwrap();
        assert_eq!(config.staleness_ms, 4_000);
        assert_eq!(config.retry_delay_ms, 250);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PRESENCE_TEST_ONLY_VALUE", "42");
        assert_eq!(env_or("PRESENCE_TEST_ONLY_VALUE", 7u64), 42);
        std::env::set_var("PRESENCE_TEST_ONLY_VALUE", "many");
        assert_eq!(env_or("PRESENCE_TEST_ONLY_VALUE", 7u64), 7);
        std::env::remove_var("PRESENCE_TEST_ONLY_VALUE");
        assert_eq!(env_or("PRESENCE_TEST_ONLY_VALUE", 7u64), 7);
    }

    #[test]
    fn test_relay_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr.port(), 9040);
        assert!(!config.auth.is_configured());
    }
}
