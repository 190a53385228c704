//! Persisted Player Profiles
//!
//! `users/{identity}`: read once when a session starts to seed the spawn
//! point, written back only when the player comes to rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::grid::{Facing, GridPos};
use crate::identity::Identity;
use crate::store::{profile_path, RealtimeStore, StoreError, StorePath};

/// Spawn cell for a profile created on first sign-in.
pub const DEFAULT_SPAWN: GridPos = GridPos::new(5, 5);

/// Spawn facing for a profile created on first sign-in.
pub const DEFAULT_FACING: Facing = Facing::Down;

fn default_spawn() -> GridPos {
    DEFAULT_SPAWN
}

/// Per-identity persisted data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerProfile {
    /// Display name.
    #[serde(default)]
    pub username: String,
    /// Account email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Profile creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Where the player last came to rest.
    #[serde(default = "default_spawn")]
    pub position: GridPos,
    /// Facing at rest.
    #[serde(default)]
    pub last_direction: Facing,
}

impl PlayerProfile {
    /// Fresh profile for `identity` at the default spawn.
    pub fn new_for(identity: &Identity) -> Self {
        Self {
            username: identity.display_name.clone(),
            email: Some(identity.email.clone()).filter(|email| !email.is_empty()),
            created_at: Some(Utc::now()),
            position: DEFAULT_SPAWN,
            last_direction: DEFAULT_FACING,
        }
    }
}

/// Access to one identity's profile.
#[derive(Clone)]
pub struct ProfileStore {
    store: Arc<dyn RealtimeStore>,
    path: StorePath,
}

impl ProfileStore {
    /// Profile access for `identity`.
    pub fn new(store: Arc<dyn RealtimeStore>, identity: &str) -> Result<Self, StoreError> {
        Ok(Self { store, path: profile_path(identity)? })
    }

    /// Stored profile, if any.
    pub async fn load(&self) -> Result<Option<PlayerProfile>, StoreError> {
        match self.store.read(&self.path).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::InvalidValue(format!("profile at {}: {}", self.path, e))),
            None => Ok(None),
        }
    }

    /// Stored profile, or a new default one (written back).
    ///
    /// Store failures fall back to the default profile without writing.
    pub async fn load_or_create(&self, identity: &Identity) -> PlayerProfile {
        match self.load().await {
            Ok(Some(profile)) => {
                debug!(identity = %identity.id, position = %profile.position, "Profile loaded");
                profile
            }
            Ok(None) => {
                let profile = PlayerProfile::new_for(identity);
                match serde_json::to_value(&profile) {
                    Ok(value) => match self.store.write(&self.path, value).await {
                        Ok(()) => info!(identity = %identity.id, "Profile created"),
                        Err(e) => warn!(identity = %identity.id, "Could not create profile: {}", e),
                    },
                    Err(e) => warn!(identity = %identity.id, "Could not encode profile: {}", e),
                }
                profile
            }
            Err(e) => {
                warn!(identity = %identity.id, "Profile unavailable, using defaults: {}", e);
                PlayerProfile::new_for(identity)
            }
        }
    }

    /// Persist the resting position and facing.
    pub async fn save_position(&self, position: GridPos, facing: Facing) -> Result<(), StoreError> {
        self.store
            .merge(&self.path, json!({ "position": position, "lastDirection": facing }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn identity() -> Identity {
        Identity {
            id: "p1".into(),
            display_name: "ana".into(),
            email: "ana@example.com".into(),
            token: String::new(),
        }
    }

    #[tokio::test]
    async fn test_first_load_creates_default() {
        let store = Arc::new(MemoryStore::new());
        let profiles = ProfileStore::new(store.clone(), "p1").unwrap();

        let profile = profiles.load_or_create(&identity()).await;
        assert_eq!(profile.position, GridPos::new(5, 5));
        assert_eq!(profile.last_direction, Facing::Down);

        let stored = store.snapshot(&profile_path("p1").unwrap()).unwrap();
        assert_eq!(stored["username"], "ana");
        assert_eq!(stored["position"], json!({"x": 5, "y": 5}));
        assert_eq!(stored["lastDirection"], "down");
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = Arc::new(MemoryStore::new());
        let profiles = ProfileStore::new(store, "p1").unwrap();
        profiles.load_or_create(&identity()).await;

        profiles.save_position(GridPos::new(8, 3), Facing::Up).await.unwrap();
        let loaded = profiles.load().await.unwrap().unwrap();
        assert_eq!(loaded.position, GridPos::new(8, 3));
        assert_eq!(loaded.last_direction, Facing::Up);
        assert_eq!(loaded.username, "ana");
    }

    #[tokio::test]
    async fn test_sparse_profile_uses_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&profile_path("p1").unwrap(), json!({"username": "ana"}));
        let profiles = ProfileStore::new(store, "p1").unwrap();

        let loaded = profiles.load().await.unwrap().unwrap();
        assert_eq!(loaded.position, DEFAULT_SPAWN);
        assert_eq!(loaded.last_direction, Facing::Down);
    }

    #[tokio::test]
    async fn test_corrupt_profile_falls_back() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&profile_path("p1").unwrap(), json!({"position": "nowhere"}));
        let profiles = ProfileStore::new(store, "p1").unwrap();

        assert!(matches!(profiles.load().await, Err(StoreError::InvalidValue(_))));
        assert_eq!(profiles.load_or_create(&identity()).await.position, DEFAULT_SPAWN);
    }
}
