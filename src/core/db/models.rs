//! Database models for LearnHub Auth
//!
//! This module defines the entity structs that map to PostgreSQL tables.
//! The in-memory stores reuse the same types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Role
// ============================================================================

/// Roles a principal can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Instructor,
    #[default]
    Student,
}

impl Role {
    /// Name stored in the `roles` column and embedded in access tokens
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ROLE_ADMIN",
            Role::Instructor => "ROLE_INSTRUCTOR",
            Role::Student => "ROLE_STUDENT",
        }
    }

    /// Whether a principal may pick this role for themselves at registration
    pub fn is_self_assignable(&self) -> bool {
        !matches!(self, Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Principal Model
// ============================================================================

/// A registered account: credentials, roles and status flags
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Principal {
    pub id: Uuid,
    /// Unique login name, also the subject of issued access tokens
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: Option<String>,
    pub roles: Vec<String>,
    pub email_verified: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Principal data for creation (password already hashed)
#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub roles: Vec<String>,
    pub email_verified: bool,
    pub enabled: bool,
}

/// Principal without sensitive data (for API responses)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub roles: Vec<String>,
    pub email_verified: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Principal> for PrincipalResponse {
    fn from(principal: Principal) -> Self {
        Self {
            id: principal.id,
            username: principal.username,
            email: principal.email,
            display_name: principal.display_name,
            roles: principal.roles,
            email_verified: principal.email_verified,
            enabled: principal.enabled,
            created_at: principal.created_at,
        }
    }
}

// ============================================================================
// Refresh Token Model
// ============================================================================

/// Persisted refresh token. Only the SHA-256 hash of the raw token is kept.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    /// A token is usable strictly before its expiry instant
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Refresh token data for creation
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub principal_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================
