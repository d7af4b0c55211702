//! Refresh token issuance, validation and revocation
//!
//! Refresh tokens are opaque: 32 bytes from the OS RNG, hex encoded. Only
//! the SHA-256 hash is persisted. Expiry is checked lazily on every lookup,
//! so an expired row still present in storage behaves exactly like an
//! unknown token.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::core::auth::clock::Clock;
use crate::core::auth::service::AuthError;
use crate::core::db::models::{NewRefreshToken, RefreshToken};
use crate::core::db::repositories::{PrincipalStore, RefreshTokenStore, hash_token};

/// Default refresh token expiration time (7 days)
pub const REFRESH_TOKEN_EXPIRATION_DAYS: i64 = 7;

/// Random bytes per token (256 bits)
const TOKEN_BYTES: usize = 32;

/// Refresh token behaviour
#[derive(Debug, Clone)]
pub struct RefreshTokenConfig {
    /// Lifetime of a refresh token in days
    pub expiration_days: i64,
    /// Replace the presented token on every refresh
    pub rotate_on_refresh: bool,
}

impl Default for RefreshTokenConfig {
    fn default() -> Self {
        Self {
            expiration_days: REFRESH_TOKEN_EXPIRATION_DAYS,
            rotate_on_refresh: false,
        }
    }
}

impl RefreshTokenConfig {
    pub fn expiration_days(mut self, days: i64) -> Self {
        self.expiration_days = days;
        self
    }

    pub fn rotate_on_refresh(mut self, rotate: bool) -> Self {
        self.rotate_on_refresh = rotate;
        self
    }
}

/// A newly created refresh token; `token` is the only copy of the raw value
#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Refresh token store and validator
#[derive(Clone)]
pub struct RefreshTokenService {
    tokens: Arc<dyn RefreshTokenStore>,
    principals: Arc<dyn PrincipalStore>,
    clock: Arc<dyn Clock>,
    config: RefreshTokenConfig,
}

impl RefreshTokenService {
    pub fn new(
        tokens: Arc<dyn RefreshTokenStore>,
        principals: Arc<dyn PrincipalStore>,
        clock: Arc<dyn Clock>,
        config: RefreshTokenConfig,
    ) -> Self {
        Self {
            tokens,
            principals,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RefreshTokenConfig {
        &self.config
    }

    fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Create and persist a refresh token for the principal named by
    /// `identifier` (username or email)
    pub async fn create(&self, identifier: &str) -> Result<IssuedRefreshToken, AuthError> {
        let principal = self
            .principals
            .find_by_identifier(identifier)
            .await?
            .ok_or(AuthError::PrincipalNotFound)?;

        let expires_at = Duration::try_days(self.config.expiration_days)
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
            .ok_or_else(|| {
                AuthError::InternalError("refresh token lifetime out of range".to_string())
            })?;
        let token = Self::generate_token();

        self.tokens
            .insert(NewRefreshToken {
                principal_id: principal.id,
                token_hash: hash_token(&token),
                expires_at,
            })
            .await?;

        tracing::debug!(principal_id = %principal.id, %expires_at, "Refresh token created");

        Ok(IssuedRefreshToken { token, expires_at })
    }

    /// Stored record for `token` if it exists and has not expired
    async fn find_live(&self, token: &str) -> Option<RefreshToken> {
        match self.tokens.find_by_hash(&hash_token(token)).await {
            Ok(Some(record)) if record.is_valid_at(self.clock.now()) => Some(record),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "Refresh token lookup failed");
                None
            }
        }
    }

    /// True only for a stored, unexpired token. Never errors.
    pub async fn validate(&self, token: &str) -> bool {
        self.find_live(token).await.is_some()
    }

    /// Username of the owning principal, under the same expiry rule as
    /// [`validate`](Self::validate)
    pub async fn resolve_identifier(&self, token: &str) -> Option<String> {
        let record = self.find_live(token).await?;

        match self.principals.find_by_id(record.principal_id).await {
            Ok(principal) => principal.map(|p| p.username),
            Err(err) => {
                tracing::warn!(error = %err, "Principal lookup for refresh token failed");
                None
            }
        }
    }

    /// Delete one token. Returns whether it existed.
    pub async fn revoke(&self, token: &str) -> Result<bool, AuthError> {
        Ok(self.tokens.delete_by_hash(&hash_token(token)).await?)
    }

    /// Delete every token owned by a principal
    pub async fn revoke_all(&self, principal_id: uuid::Uuid) -> Result<u64, AuthError> {
        Ok(self.tokens.delete_all_for_principal(principal_id).await?)
    }

    /// Remove expired rows. Validity never depends on this having run.
    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        Ok(self.tokens.delete_expired(self.clock.now()).await?)
    }
}
