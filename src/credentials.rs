//! Credential source for new connections
//!
//! The pool asks a [`TokenProvider`] for an ID token every time it builds a
//! connection. How tokens are obtained and refreshed is up to the embedding
//! application; two simple providers ship here.

use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use parking_lot::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Tokens this close to expiry are treated as expired.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
/// Lifetime assumed for tokens without a readable `exp` claim.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A token usable right now, or `None` if there is none.
    async fn valid_token(&self) -> Option<String>;
}

/// Read the `exp` claim of a JWT without verifying it.
pub fn jwt_expiry(token: &str) -> Option<SystemTime> {
    let payload = token.split('.').nth(1)?;
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_u64()?;
    Some(UNIX_EPOCH + Duration::from_secs(exp))
}

fn is_fresh(expires_at: SystemTime, now: SystemTime) -> bool {
    match expires_at.checked_sub(EXPIRY_MARGIN) {
        Some(deadline) => now < deadline,
        None => false,
    }
}

#[derive(Debug, Clone)]
struct StoredToken {
    id_token: String,
    expires_at: SystemTime,
}

/// In-memory token holder fed by the application.
#[derive(Debug, Default)]
pub struct TokenStore {
    token: RwLock<Option<StoredToken>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(id_token: impl Into<String>) -> Self {
        let store = Self::new();
        store.store(id_token);
        store
    }

    /// Replace the current token. Expiry comes from the JWT, or one hour.
    pub fn store(&self, id_token: impl Into<String>) {
        let id_token = id_token.into();
        let expires_at = jwt_expiry(&id_token).unwrap_or_else(|| {
            warn!("Token has no readable expiry, assuming one hour");
            SystemTime::now() + DEFAULT_LIFETIME
        });
        info!(
            expires_in_secs = expires_at
                .duration_since(SystemTime::now())
                .map(|d| d.as_secs())
                .unwrap_or(0),
            "Token stored"
        );
        *self.token.write() = Some(StoredToken {
            id_token,
            expires_at,
        });
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.token.read().as_ref().map(|t| t.expires_at)
    }
}

#[async_trait]
impl TokenProvider for TokenStore {
    async fn valid_token(&self) -> Option<String> {
        let token = self.token.read().clone()?;
        if is_fresh(token.expires_at, SystemTime::now()) {
            Some(token.id_token)
        } else {
            warn!("Token expired");
            None
        }
    }
}

/// Reads the token from an environment variable on every request.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvToken {
    async fn valid_token(&self) -> Option<String> {
        let token = std::env::var(&self.var).ok().filter(|t| !t.is_empty())?;
        match jwt_expiry(&token) {
            Some(expires_at) if !is_fresh(expires_at, SystemTime::now()) => {
                warn!(var = %self.var, "Token in environment has expired");
                None
            }
            _ => Some(token),
        }
    }
}
