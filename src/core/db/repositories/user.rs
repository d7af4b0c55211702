//! Principal (user account) storage
//!
//! `PrincipalStore` is the narrow interface the auth core consumes;
//! `UserRepository` implements it on PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::db::models::{NewPrincipal, Principal};

/// User repository error types
#[derive(Debug, thiserror::Error)]
pub enum UserRepositoryError {
    #[error("Email already exists")]
    EmailAlreadyExists,

    #[error("Username already exists")]
    UsernameAlreadyExists,

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Account store consumed by the authentication core
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    /// Find a principal by ID
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, UserRepositoryError>;

    /// Find a principal by username or email
    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Principal>, UserRepositoryError>;

    /// Find a principal by email
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, UserRepositoryError>;

    /// Find a principal by username
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Principal>, UserRepositoryError>;

    /// Persist a new principal; fails if the username or email is taken
    async fn insert(&self, principal: NewPrincipal) -> Result<Principal, UserRepositoryError>;

    /// Reachability check used by health
    async fn ping(&self) -> Result<(), UserRepositoryError>;
}

const PRINCIPAL_COLUMNS: &str = "id, username, email, password_hash, display_name, roles, \
     email_verified, enabled, created_at, updated_at";

/// PostgreSQL-backed principal store
#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    /// Create a new user repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Map unique-constraint violations onto the duplicate variants
    fn map_insert_error(err: sqlx::Error) -> UserRepositoryError {
        let constraint = err
            .as_database_error()
            .and_then(|db| db.constraint())
            .map(str::to_owned);

        match constraint.as_deref() {
            Some("users_email_key") => UserRepositoryError::EmailAlreadyExists,
            Some("users_username_key") => UserRepositoryError::UsernameAlreadyExists,
            _ => UserRepositoryError::DatabaseError(err),
        }
    }
}

#[async_trait]
impl PrincipalStore for UserRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, UserRepositoryError> {
        let principal = sqlx::query_as::<_, Principal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(principal)
    }

    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Principal>, UserRepositoryError> {
        // An exact username match wins over an email match
        let principal = sqlx::query_as::<_, Principal>(&format!(
            r#"
            SELECT {PRINCIPAL_COLUMNS}
            FROM users
            WHERE username = $1 OR email = $1
            ORDER BY (username = $1) DESC
            LIMIT 1
            "#
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(principal)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, UserRepositoryError> {
        let principal = sqlx::query_as::<_, Principal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(principal)
    }

    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Principal>, UserRepositoryError> {
        let principal = sqlx::query_as::<_, Principal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(principal)
    }

    async fn insert(&self, principal: NewPrincipal) -> Result<Principal, UserRepositoryError> {
        if self.find_by_email(&principal.email).await?.is_some() {
            return Err(UserRepositoryError::EmailAlreadyExists);
        }

        if self.find_by_username(&principal.username).await?.is_some() {
            return Err(UserRepositoryError::UsernameAlreadyExists);
        }

        // Concurrent registrations can still race past the checks above;
        // the unique constraints catch those.
        sqlx::query_as::<_, Principal>(&format!(
            r#"
            INSERT INTO users (username, email, password_hash, display_name, roles, email_verified, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {PRINCIPAL_COLUMNS}
            "#
        ))
        .bind(&principal.username)
        .bind(&principal.email)
        .bind(&principal.password_hash)
        .bind(&principal.display_name)
        .bind(&principal.roles)
        .bind(principal.email_verified)
        .bind(principal.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::map_insert_error)
    }

    async fn ping(&self) -> Result<(), UserRepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
