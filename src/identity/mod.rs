//! Identity Service
//!
//! Accounts and sign-in state. Presence consumes only the current identity
//! and its change notifications; sign-up and sign-in exist so a client (or
//! the demo) can obtain one.
//!
//! - `token`: JWTs issued on sign-in and validated by the relay
//! - `memory`: in-process service with salted password hashes

pub mod memory;
pub mod token;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

pub use memory::MemoryIdentityService;
pub use token::{AuthConfig, AuthError, TokenClaims};

/// Minimum accepted password length, in chars.
pub const MIN_PASSWORD_LEN: usize = 6;

/// An authenticated player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque stable handle, unique per account.
    pub id: String,
    /// Label chosen at sign-up.
    pub display_name: String,
    /// Account email.
    pub email: String,
    /// Token presented to the store.
    pub token: String,
}

/// Identity service errors. Display text is meant for the player.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// A required field was blank.
    #[error("please fill in all fields")]
    MissingField,
    /// Email is not plausibly an address.
    #[error("'{0}' is not a valid email address")]
    InvalidEmail(String),
    /// Password below the minimum length.
    #[error("password must be at least {} characters", MIN_PASSWORD_LEN)]
    WeakPassword,
    /// An account already uses this email.
    #[error("an account already exists for {0}")]
    EmailInUse(String),
    /// Unknown email or wrong password.
    #[error("wrong email or password")]
    InvalidCredentials,
    /// Token could not be issued.
    #[error("could not issue session token: {0}")]
    Token(#[from] AuthError),
}

/// Account and session-state service.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Create an account and sign it in.
    async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> Result<Identity, IdentityError>;

    /// Sign an existing account in.
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, IdentityError>;

    /// End the current session. No-op when signed out.
    async fn sign_out(&self);

    /// Currently signed-in identity.
    fn current_identity(&self) -> Option<Identity>;

    /// Change notifications. The receiver starts at the current identity.
    fn watch(&self) -> watch::Receiver<Option<Identity>>;
}
