//! Credential verification
//!
//! Unknown identifiers and wrong passwords produce the same error, and an
//! unknown identifier still pays for one bcrypt verification so response
//! timing does not reveal which accounts exist.

use std::sync::Arc;

use crate::core::auth::password::{PasswordError, PasswordHasher};
use crate::core::auth::service::{AuthError, normalize_email};
use crate::core::db::models::Principal;
use crate::core::db::repositories::PrincipalStore;

/// Checks username/email + password pairs against stored hashes
#[derive(Clone)]
pub struct CredentialVerifier {
    principals: Arc<dyn PrincipalStore>,
    hasher: Arc<dyn PasswordHasher>,
    dummy_hash: Arc<str>,
}

impl CredentialVerifier {
    pub fn new(
        principals: Arc<dyn PrincipalStore>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Result<Self, PasswordError> {
        let dummy_hash = hasher.hash("learnhub-timing-equalizer")?;

        Ok(Self {
            principals,
            hasher,
            dummy_hash: dummy_hash.into(),
        })
    }

    /// Resolve `identifier` and check `password` against its hash
    pub async fn verify(&self, identifier: &str, password: &str) -> Result<Principal, AuthError> {
        let identifier = identifier.trim();
        if identifier.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        // Usernames never contain '@', so this only folds email identifiers
        let identifier = if identifier.contains('@') {
            normalize_email(identifier)
        } else {
            identifier.to_string()
        };

        let principal = self.principals.find_by_identifier(&identifier).await?;

        let hash: Arc<str> = match &principal {
            Some(p) => p.password_hash.as_str().into(),
            None => self.dummy_hash.clone(),
        };

        let matches = self.check(password, hash).await?;

        match principal {
            Some(p) if matches => Ok(p),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    /// bcrypt off the async executor
    async fn check(&self, password: &str, hash: Arc<str>) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();

        let outcome = tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AuthError::InternalError(e.to_string()))?;

        match outcome {
            Ok(matches) => Ok(matches),
            Err(err) => {
                // An unreadable stored hash can never match
                tracing::error!(error = %err, "Stored password hash could not be verified");
                Ok(false)
            }
        }
    }
}
