//! Game Logic Module
//!
//! Local-only gameplay rules: the tile map and input-driven movement gating.
//! Positions produced here are published verbatim by the presence layer.

pub mod map;
pub mod movement;

// Re-export key types
pub use map::{MapError, Tile, TileMap};
pub use movement::{CooldownState, MoveOutcome, MovementController};
