//! # Chapita Presence
//!
//! Multiplayer presence for the Chapita pixel-art world: each client publishes
//! its own player to a shared realtime store and derives who else is online,
//! where they stand and whether they are walking.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CHAPITA PRESENCE                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Grid, clocks, task slots                  │
//! │  game/           - Tile map and movement cooldowns           │
//! │                                                              │
//! │  store/          - Shared realtime store                     │
//! │  ├── memory.rs   - In-process store                          │
//! │  ├── relay.rs    - WebSocket relay hosting a memory store    │
//! │  └── remote.rs   - Relay client                              │
//! │                                                              │
//! │  identity/       - Sign-in and JWT tokens                    │
//! │                                                              │
//! │  presence/       - Publish, subscribe, derive                │
//! │  ├── publisher.rs    - Ordered publish queue                 │
//! │  ├── view.rs         - Liveness and motion smoothing         │
//! │  ├── synchronizer.rs - Local player surface                  │
//! │  └── supervisor.rs   - Sessions per signed-in identity       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Trust
//!
//! Positions are client-authoritative. The relay only checks that a client
//! writes its own records.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod identity;
pub mod presence;
pub mod store;

// Re-export commonly used types
pub use config::{PresenceConfig, RelayConfig};
pub use core::grid::{Facing, GridPos};
pub use identity::{Identity, IdentityError, IdentityService};
pub use presence::{PresenceClient, PresenceSnapshot, PresenceSynchronizer, PlayerSession};
pub use store::{RealtimeStore, StoreError, StorePath};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
