//! Identity Tokens
//!
//! JWTs carried by every relay connection. The identity service signs them
//! with HS256; the relay checks them and takes `sub` as the identity.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// How the relay checks tokens.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Required `iss`, when set.
    pub issuer: Option<String>,
    /// Required `aud`, when set.
    pub audience: Option<String>,
    /// PEM public key. Tokens are RS256 when present.
    pub rsa_public_key: Option<String>,
    /// Shared HS256 secret, used when no public key is set.
    pub hmac_secret: Option<String>,
    /// Accept lapsed tokens (local testing).
    pub allow_expired: bool,
}

impl AuthConfig {
    /// `AUTH_ISSUER`, `AUTH_AUDIENCE`, `AUTH_PUBLIC_KEY_PEM`, `AUTH_SECRET`
    /// and `AUTH_SKIP_EXPIRY`. Empty values count as unset.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|value| !value.trim().is_empty());
        Self {
            issuer: var("AUTH_ISSUER"),
            audience: var("AUTH_AUDIENCE"),
            rsa_public_key: var("AUTH_PUBLIC_KEY_PEM"),
            hmac_secret: var("AUTH_SECRET"),
            allow_expired: matches!(var("AUTH_SKIP_EXPIRY").as_deref(), Some("1" | "true")),
        }
    }

    /// HS256 checks against `secret`, nothing else required.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            hmac_secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Whether any verification key is present.
    pub fn is_configured(&self) -> bool {
        self.rsa_public_key.is_some() || self.hmac_secret.is_some()
    }

    fn decoding_key(&self) -> Result<(Algorithm, DecodingKey), AuthError> {
        match (&self.rsa_public_key, &self.hmac_secret) {
            (Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map(|key| (Algorithm::RS256, key))
                .map_err(|e| AuthError::BadKey(e.to_string())),
            (None, Some(secret)) => Ok((Algorithm::HS256, DecodingKey::from_secret(secret.as_bytes()))),
            (None, None) => Err(AuthError::NotConfigured),
        }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        // `sub` is checked by hand below; `exp` is optional on the wire.
        validation.required_spec_claims.clear();
        validation.validate_exp = !self.allow_expired;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

/// Claims of an identity token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Identity handle.
    pub sub: String,
    /// Expiry, Unix seconds.
    #[serde(default)]
    pub exp: u64,
    /// Issue time, Unix seconds.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience (string or list).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
    /// Display name at issue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TokenClaims {
    /// Claims for `sub`, issued now and valid for `ttl`.
    pub fn new(sub: impl Into<String>, ttl: Duration) -> Self {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        Self {
            sub: sub.into(),
            exp: now.saturating_add(ttl.as_secs()),
            iat: now,
            iss: None,
            aud: None,
            name: None,
        }
    }
}

/// Token errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No verification key configured.
    #[error("authentication not configured")]
    NotConfigured,
    /// The configured key could not be loaded.
    #[error("unusable verification key: {0}")]
    BadKey(String),
    /// Not a JWT.
    #[error("malformed token")]
    Malformed,
    /// Signed with another key.
    #[error("bad token signature")]
    BadSignature,
    /// Past its `exp`.
    #[error("token expired")]
    Expired,
    /// `iss` differs from the configured issuer.
    #[error("token issuer not accepted")]
    WrongIssuer,
    /// `aud` differs from the configured audience.
    #[error("token audience not accepted")]
    WrongAudience,
    /// `sub` is empty.
    #[error("token has no subject")]
    NoSubject,
    /// Anything else the JWT library reports.
    #[error("token error: {0}")]
    Jwt(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
            ErrorKind::InvalidAudience => AuthError::WrongAudience,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::Malformed
            }
            _ => AuthError::Jwt(err.to_string()),
        }
    }
}

/// Sign `claims` with an HS256 secret.
pub fn issue_token(claims: &TokenClaims, secret: &str) -> Result<String, AuthError> {
    let key = EncodingKey::from_secret(secret.as_bytes());
    Ok(encode(&Header::new(Algorithm::HS256), claims, &key)?)
}

/// Check `token` against `config` and return its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (algorithm, key) = config.decoding_key()?;
    let claims = decode::<TokenClaims>(token, &key, &config.validation(algorithm))?.claims;
    if claims.sub.trim().is_empty() {
        return Err(AuthError::NoSubject);
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "relay-secret-key-256-bits-long!!";

    fn claims() -> TokenClaims {
        TokenClaims {
            iss: Some("chapita".into()),
            name: Some("ana".into()),
            ..TokenClaims::new("p1", Duration::from_secs(3600))
        }
    }

    #[test]
    fn test_issue_then_validate() {
        let token = issue_token(&claims(), SECRET).unwrap();
        let validated = validate_token(&token, &AuthConfig::with_secret(SECRET)).unwrap();
        assert_eq!(validated.sub, "p1");
        assert_eq!(validated.name.as_deref(), Some("ana"));
        assert!(validated.exp > validated.iat);
    }

    #[test]
    fn test_expired_token() {
        let lapsed = TokenClaims { exp: 1, ..claims() };
        let token = issue_token(&lapsed, SECRET).unwrap();
        assert_eq!(validate_token(&token, &AuthConfig::with_secret(SECRET)), Err(AuthError::Expired));

        let lenient = AuthConfig {
            allow_expired: true,
            ..AuthConfig::with_secret(SECRET)
        };
        assert!(validate_token(&token, &lenient).is_ok());
    }

    #[test]
    fn test_foreign_signature() {
        let token = issue_token(&claims(), SECRET).unwrap();
        let other = AuthConfig::with_secret("another-secret-entirely!!!!!!!!");
        assert_eq!(validate_token(&token, &other), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_blank_subject() {
        let token = issue_token(&TokenClaims { sub: " ".into(), ..claims() }, SECRET).unwrap();
        assert_eq!(validate_token(&token, &AuthConfig::with_secret(SECRET)), Err(AuthError::NoSubject));
    }

    #[test]
    fn test_issuer_and_audience() {
        let token = issue_token(&claims(), SECRET).unwrap();
        let strict_issuer = AuthConfig {
            issuer: Some("someone-else".into()),
            ..AuthConfig::with_secret(SECRET)
        };
        assert_eq!(validate_token(&token, &strict_issuer), Err(AuthError::WrongIssuer));

        let own_issuer = AuthConfig {
            issuer: Some("chapita".into()),
            ..AuthConfig::with_secret(SECRET)
        };
        assert!(validate_token(&token, &own_issuer).is_ok());

        let with_audience = TokenClaims { aud: Some(serde_json::json!("web")), ..claims() };
        let token = issue_token(&with_audience, SECRET).unwrap();
        let strict_audience = AuthConfig {
            audience: Some("mobile".into()),
            ..AuthConfig::with_secret(SECRET)
        };
        assert_eq!(validate_token(&token, &strict_audience), Err(AuthError::WrongAudience));
    }

    #[test]
    fn test_unusable_inputs() {
        let config = AuthConfig::with_secret(SECRET);
        assert_eq!(validate_token("not-a-jwt", &config), Err(AuthError::Malformed));
        assert_eq!(validate_token("some.jwt.token", &AuthConfig::default()), Err(AuthError::NotConfigured));

        let bad_pem = AuthConfig {
            rsa_public_key: Some("not a pem".into()),
            ..AuthConfig::default()
        };
        assert!(bad_pem.is_configured());
        assert!(matches!(validate_token("some.jwt.token", &bad_pem), Err(AuthError::BadKey(_))));
    }
}
