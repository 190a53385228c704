//! In-Memory Identity Service

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::identity::token::{issue_token, TokenClaims};
use crate::identity::{Identity, IdentityError, IdentityService, MIN_PASSWORD_LEN};

/// Token lifetime.
const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Account {
    id: String,
    display_name: String,
    email: String,
    salt: String,
    password_hash: String,
}

/// Accounts kept in memory. Tokens are HS256-signed with `secret`, so a relay
/// configured with the same secret accepts them.
pub struct MemoryIdentityService {
    secret: String,
    issuer: Option<String>,
    /// Keyed by normalized email.
    accounts: Mutex<HashMap<String, Account>>,
    current: watch::Sender<Option<Identity>>,
}

impl MemoryIdentityService {
    /// Service signing tokens with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            secret: secret.into(),
            issuer: None,
            accounts: Mutex::new(HashMap::new()),
            current,
        }
    }

    /// Set the `iss` claim of issued tokens.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    fn accounts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn issue(&self, account: &Account) -> Result<Identity, IdentityError> {
        let claims = TokenClaims {
            iss: self.issuer.clone(),
            name: Some(account.display_name.clone()),
            ..TokenClaims::new(account.id.clone(), TOKEN_TTL)
        };
        Ok(Identity {
            id: account.id.clone(),
            display_name: account.display_name.clone(),
            email: account.email.clone(),
            token: issue_token(&claims, &self.secret)?,
        })
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl IdentityService for MemoryIdentityService {
    async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> Result<Identity, IdentityError> {
        let email = normalize_email(email);
        let display_name = display_name.trim();
        if email.is_empty() || password.is_empty() || display_name.is_empty() {
            return Err(IdentityError::MissingField);
        }
        if !is_plausible_email(&email) {
            return Err(IdentityError::InvalidEmail(email));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(IdentityError::WeakPassword);
        }

        let identity = {
            let mut accounts = self.accounts();
            if accounts.contains_key(&email) {
                return Err(IdentityError::EmailInUse(email));
            }
            let salt = Uuid::new_v4().simple().to_string();
            let account = Account {
                id: Uuid::new_v4().simple().to_string(),
                display_name: display_name.to_string(),
                email: email.clone(),
                password_hash: hash_password(&salt, password),
                salt,
            };
            let identity = self.issue(&account)?;
            accounts.insert(email, account);
            identity
        };

        info!(identity = %identity.id, "Account created");
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, IdentityError> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(IdentityError::MissingField);
        }

        let identity = {
            let accounts = self.accounts();
            let account = accounts.get(&email).ok_or(IdentityError::InvalidCredentials)?;
            if hash_password(&account.salt, password) != account.password_hash {
                debug!(identity = %account.id, "Wrong password");
                return Err(IdentityError::InvalidCredentials);
            }
            self.issue(account)?
        };

        info!(identity = %identity.id, "Signed in");
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) {
        if let Some(previous) = self.current.send_replace(None) {
            info!(identity = %previous.id, "Signed out");
        }
    }

    fn current_identity(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::token::{validate_token, AuthConfig};

    const SECRET: &str = "identity-test-secret";

    #[tokio::test]
    async fn test_sign_up_signs_in() {
        let service = MemoryIdentityService::new(SECRET);
        let identity = service.sign_up("Ana@Example.com ", "secret1", "ana").await.unwrap();

        assert_eq!(identity.email, "ana@example.com");
        assert_eq!(service.current_identity(), Some(identity.clone()));

        let claims = validate_token(&identity.token, &AuthConfig::with_secret(SECRET)).unwrap();
        assert_eq!(claims.sub, identity.id);
    }

    #[tokio::test]
    async fn test_sign_up_validation() {
        let service = MemoryIdentityService::new(SECRET);
        assert_eq!(
            service.sign_up("ana@example.com", "12345", "ana").await,
            Err(IdentityError::WeakPassword)
        );
        assert!(matches!(
            service.sign_up("not-an-email", "123456", "ana").await,
            Err(IdentityError::InvalidEmail(_))
        ));
        assert_eq!(
            service.sign_up("ana@example.com", "123456", "  ").await,
            Err(IdentityError::MissingField)
        );

        service.sign_up("ana@example.com", "123456", "ana").await.unwrap();
        assert!(matches!(
            service.sign_up("ANA@example.com", "abcdef", "other").await,
            Err(IdentityError::EmailInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_in_and_out() {
        let service = MemoryIdentityService::new(SECRET);
        let created = service.sign_up("bo@example.com", "hunter22", "bo").await.unwrap();
        service.sign_out().await;
        assert_eq!(service.current_identity(), None);

        assert_eq!(
            service.sign_in("bo@example.com", "hunter23").await,
            Err(IdentityError::InvalidCredentials)
        );
        assert_eq!(
            service.sign_in("nobody@example.com", "hunter22").await,
            Err(IdentityError::InvalidCredentials)
        );

        let signed_in = service.sign_in("bo@example.com", "hunter22").await.unwrap();
        assert_eq!(signed_in.id, created.id);
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let service = MemoryIdentityService::new(SECRET);
        let mut rx = service.watch();
        assert!(rx.borrow().is_none());

        let identity = service.sign_up("cy@example.com", "password", "cy").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().map(|i| i.id.clone()), Some(identity.id));

        service.sign_out().await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }
}
