//! Presence Layer
//!
//! Publishes the local player to `online_players/{identity}` and turns the
//! full collection deliveries into a view of who else is around.
//!
//! - `record`: the shared record and its lenient decoding
//! - `smoothing` / `view`: per-remote motion smoothing and liveness
//! - `publisher`: ordered single-writer queue with one retry
//! - `synchronizer`: the local player's publish and subscribe surface
//! - `profile`, `session`, `supervisor`: one sign-in at a time

pub mod profile;
pub mod publisher;
pub mod record;
pub mod session;
pub mod smoothing;
pub mod supervisor;
pub mod synchronizer;
pub mod view;

pub use profile::{PlayerProfile, ProfileStore, DEFAULT_FACING, DEFAULT_SPAWN};
pub use publisher::{PublishOp, PublishQueue, Publisher};
pub use record::PlayerRecord;
pub use session::{PlayerSession, SessionStatus};
pub use smoothing::{MotionSmoother, MotionState};
pub use supervisor::{PresenceClient, RelayConnector, SessionCommand, SharedStore, StoreConnector};
pub use synchronizer::{LocalPlayer, PresenceError, PresenceSynchronizer, StatePublisher};
pub use view::{PresenceSnapshot, PresenceView, RemoteView};
