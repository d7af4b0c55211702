//! In-memory stores
//!
//! Used when no `DATABASE_URL` is configured and throughout the test suite.
//! Contents are lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::core::db::models::{NewPrincipal, NewRefreshToken, Principal, RefreshToken};
use crate::core::db::repositories::refresh_token::{
    RefreshTokenRepositoryError, RefreshTokenStore,
};
use crate::core::db::repositories::user::{PrincipalStore, UserRepositoryError};

/// DashMap-backed principal store
#[derive(Default)]
pub struct InMemoryPrincipalStore {
    principals: DashMap<Uuid, Principal>,
    by_username: DashMap<String, Uuid>,
    by_email: DashMap<String, Uuid>,
}

impl InMemoryPrincipalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the `enabled` flag, returning the updated principal
    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Option<Principal> {
        let mut principal = self.principals.get_mut(&id)?;
        principal.enabled = enabled;
        principal.updated_at = Utc::now();
        Some(principal.clone())
    }

    /// Drop a principal and its index entries
    pub fn remove(&self, id: Uuid) -> Option<Principal> {
        let (_, principal) = self.principals.remove(&id)?;
        self.by_username.remove(&principal.username);
        self.by_email.remove(&principal.email);
        Some(principal)
    }

    fn lookup(&self, index: &DashMap<String, Uuid>, key: &str) -> Option<Principal> {
        let id = *index.get(key)?;
        self.principals.get(&id).map(|p| p.clone())
    }
}

#[async_trait]
impl PrincipalStore for InMemoryPrincipalStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, UserRepositoryError> {
        Ok(self.principals.get(&id).map(|p| p.clone()))
    }

    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Principal>, UserRepositoryError> {
        Ok(self
            .lookup(&self.by_username, identifier)
            .or_else(|| self.lookup(&self.by_email, identifier)))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, UserRepositoryError> {
        Ok(self.lookup(&self.by_email, email))
    }

    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Principal>, UserRepositoryError> {
        Ok(self.lookup(&self.by_username, username))
    }

    async fn insert(&self, new: NewPrincipal) -> Result<Principal, UserRepositoryError> {
        let id = Uuid::new_v4();

        // Reserve the email first, then the username; release on conflict.
        match self.by_email.entry(new.email.clone()) {
            Entry::Occupied(_) => return Err(UserRepositoryError::EmailAlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        match self.by_username.entry(new.username.clone()) {
            Entry::Occupied(_) => {
                self.by_email.remove(&new.email);
                return Err(UserRepositoryError::UsernameAlreadyExists);
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let now = Utc::now();
        let principal = Principal {
            id,
            username: new.username,
            email: new.email,
            password_hash: new.password_hash,
            display_name: new.display_name,
            roles: new.roles,
            email_verified: new.email_verified,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
        };
        self.principals.insert(id, principal.clone());

        Ok(principal)
    }

    async fn ping(&self) -> Result<(), UserRepositoryError> {
        Ok(())
    }
}

/// DashMap-backed refresh token store, keyed by token hash
#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    tokens: DashMap<String, RefreshToken>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn insert(
        &self,
        new: NewRefreshToken,
    ) -> Result<RefreshToken, RefreshTokenRepositoryError> {
        match self.tokens.entry(new.token_hash.clone()) {
            Entry::Occupied(_) => Err(RefreshTokenRepositoryError::DuplicateToken),
            Entry::Vacant(slot) => {
                let token = RefreshToken {
                    id: Uuid::new_v4(),
                    principal_id: new.principal_id,
                    token_hash: new.token_hash,
                    expires_at: new.expires_at,
                    created_at: Utc::now(),
                };
                slot.insert(token.clone());
                Ok(token)
            }
        }
    }

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, RefreshTokenRepositoryError> {
        Ok(self.tokens.get(token_hash).map(|t| t.clone()))
    }

    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool, RefreshTokenRepositoryError> {
        Ok(self.tokens.remove(token_hash).is_some())
    }

    async fn delete_all_for_principal(
        &self,
        principal_id: Uuid,
    ) -> Result<u64, RefreshTokenRepositoryError> {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| t.principal_id != principal_id);
        Ok(before.saturating_sub(self.tokens.len()) as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RefreshTokenRepositoryError> {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| t.is_valid_at(now));
        Ok(before.saturating_sub(self.tokens.len()) as u64)
    }
}
