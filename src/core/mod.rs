//! Core primitives.
//!
//! Grid coordinates, millisecond clocks and cancelable task slots shared by the
//! movement, store and presence layers.

pub mod clock;
pub mod grid;
pub mod timer;

// Re-export core types
pub use clock::{Clock, ManualClock, ServerClock, SystemClock};
pub use grid::{Facing, GridPos};
pub use timer::TaskSlot;
