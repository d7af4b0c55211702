//! Refresh token storage
//!
//! Tokens are stored as SHA-256 hashes; the raw value only ever exists in
//! the response to the client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::db::models::{NewRefreshToken, RefreshToken};

/// Refresh token repository error types
#[derive(Debug, thiserror::Error)]
pub enum RefreshTokenRepositoryError {
    #[error("Refresh token already exists")]
    DuplicateToken,

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Hash a raw token using SHA-256
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persistence for refresh tokens, keyed by token hash
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Insert a new token row
    async fn insert(
        &self,
        token: NewRefreshToken,
    ) -> Result<RefreshToken, RefreshTokenRepositoryError>;

    /// Look up a token by hash, regardless of expiry
    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, RefreshTokenRepositoryError>;

    /// Delete one token; returns whether a row was removed
    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool, RefreshTokenRepositoryError>;

    /// Delete every token owned by a principal
    async fn delete_all_for_principal(
        &self,
        principal_id: Uuid,
    ) -> Result<u64, RefreshTokenRepositoryError>;

    /// Delete tokens whose expiry is at or before `now`
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RefreshTokenRepositoryError>;
}

/// PostgreSQL-backed refresh token store
#[derive(Clone)]
pub struct RefreshTokenRepository {
    pool: PgPool,
}

impl RefreshTokenRepository {
    /// Create a new refresh token repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for RefreshTokenRepository {
    async fn insert(
        &self,
        token: NewRefreshToken,
    ) -> Result<RefreshToken, RefreshTokenRepositoryError> {
        sqlx::query_as::<_, RefreshToken>(
            r#"
            INSERT INTO refresh_tokens (principal_id, token_hash, expires_at)
            VALUES ($1, $2, $3)
            RETURNING id, principal_id, token_hash, expires_at, created_at
            "#,
        )
        .bind(token.principal_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match err.as_database_error() {
            Some(db) if db.is_unique_violation() => RefreshTokenRepositoryError::DuplicateToken,
            _ => RefreshTokenRepositoryError::DatabaseError(err),
        })
    }

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, RefreshTokenRepositoryError> {
        let token = sqlx::query_as::<_, RefreshToken>(
            r#"
            SELECT id, principal_id, token_hash, expires_at, created_at
            FROM refresh_tokens
            WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(token)
    }

    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool, RefreshTokenRepositoryError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_for_principal(
        &self,
        principal_id: Uuid,
    ) -> Result<u64, RefreshTokenRepositoryError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE principal_id = $1")
            .bind(principal_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RefreshTokenRepositoryError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
