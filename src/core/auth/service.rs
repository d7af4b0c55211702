//! Authentication service
//!
//! Orchestrates login, refresh, logout and registration on top of the
//! credential verifier, the JWT service and the refresh token service.
//! Every failure leaves here as a typed `AuthError`.

use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::core::auth::credentials::CredentialVerifier;
use crate::core::auth::identity::{IdentityProvider, IdentityProviderError};
use crate::core::auth::jwt::{AccessToken, JwtError, JwtService};
use crate::core::auth::password::{PasswordError, PasswordHasher};
use crate::core::auth::refresh::{IssuedRefreshToken, RefreshTokenService};
use crate::core::db::models::{NewPrincipal, Principal, PrincipalResponse, Role};
use crate::core::db::repositories::{
    PrincipalStore, RefreshTokenRepositoryError, UserRepositoryError,
};

/// Authentication service error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("Principal not found")]
    PrincipalNotFound,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Email already registered")]
    EmailAlreadyExists,

    #[error("Username already taken")]
    UsernameAlreadyExists,

    #[error("Password too short (minimum 8 characters)")]
    PasswordTooShort,

    #[error("Password too weak")]
    PasswordTooWeak,

    #[error("Invalid email format")]
    InvalidEmail,

    #[error("Invalid username format")]
    InvalidUsername,

    #[error("Role cannot be self-assigned")]
    RoleNotAssignable,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("No identity provider configured")]
    ProviderUnavailable,

    #[error("External identity rejected")]
    ExternalIdentityRejected,

    #[error("Identity provider error: {0}")]
    ProviderError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<UserRepositoryError> for AuthError {
    fn from(err: UserRepositoryError) -> Self {
        match err {
            UserRepositoryError::EmailAlreadyExists => AuthError::EmailAlreadyExists,
            UserRepositoryError::UsernameAlreadyExists => AuthError::UsernameAlreadyExists,
            UserRepositoryError::DatabaseError(_) => AuthError::InternalError(err.to_string()),
        }
    }
}

impl From<RefreshTokenRepositoryError> for AuthError {
    fn from(err: RefreshTokenRepositoryError) -> Self {
        AuthError::InternalError(err.to_string())
    }
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => AuthError::TokenExpired,
            JwtError::InvalidToken => AuthError::InvalidToken,
            _ => AuthError::InternalError(err.to_string()),
        }
    }
}

impl From<PasswordError> for AuthError {
    fn from(err: PasswordError) -> Self {
        AuthError::InternalError(err.to_string())
    }
}

impl From<IdentityProviderError> for AuthError {
    fn from(err: IdentityProviderError) -> Self {
        match err {
            IdentityProviderError::Rejected | IdentityProviderError::MissingEmail => {
                AuthError::ExternalIdentityRejected
            }
            _ => AuthError::ProviderError(err.to_string()),
        }
    }
}

/// Emails are stored and matched in lowercase
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Registration request data
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

/// Login request data; the identifier is a username or an email
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(alias = "username", alias = "email")]
    pub identifier: String,
    pub password: String,
}

/// Token refresh (and logout) request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Login through an external identity provider
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLoginRequest {
    /// Access token issued by the provider
    pub access_token: String,
}

/// Token pair (access + refresh)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    /// Access token (short-lived)
    pub access_token: String,
    /// Refresh token (long-lived)
    pub refresh_token: String,
    /// Access token expiration (Unix timestamp)
    pub access_expires_at: i64,
    /// Refresh token expiration (Unix timestamp)
    pub refresh_expires_at: i64,
    /// Token type (always "Bearer")
    pub token_type: String,
}

impl TokenPair {
    fn new(access: AccessToken, refresh: IssuedRefreshToken) -> Self {
        Self {
            access_token: access.token,
            refresh_token: refresh.token,
            access_expires_at: access.expires_at.timestamp(),
            refresh_expires_at: refresh.expires_at.timestamp(),
            token_type: "Bearer".to_string(),
        }
    }
}

/// Result of a successful login
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub principal: PrincipalResponse,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

/// Result of a successful refresh
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub access_expires_at: i64,
    pub token_type: String,
    /// Present only when rotation is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<i64>,
}

/// Authentication service
#[derive(Clone)]
pub struct AuthService {
    principals: Arc<dyn PrincipalStore>,
    hasher: Arc<dyn PasswordHasher>,
    verifier: CredentialVerifier,
    jwt_service: JwtService,
    refresh_tokens: RefreshTokenService,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
}

impl AuthService {
    /// Create a new authentication service
    pub fn new(
        principals: Arc<dyn PrincipalStore>,
        hasher: Arc<dyn PasswordHasher>,
        jwt_service: JwtService,
        refresh_tokens: RefreshTokenService,
    ) -> Result<Self, AuthError> {
        let verifier = CredentialVerifier::new(principals.clone(), hasher.clone())?;

        Ok(Self {
            principals,
            hasher,
            verifier,
            jwt_service,
            refresh_tokens,
            identity_provider: None,
        })
    }

    /// Enable login through an external identity provider
    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    pub fn refresh_tokens(&self) -> &RefreshTokenService {
        &self.refresh_tokens
    }

    /// Validate email format
    fn validate_email(email: &str) -> Result<(), AuthError> {
        let (local, domain) = email.split_once('@').ok_or(AuthError::InvalidEmail)?;

        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(AuthError::InvalidEmail);
        }

        if !domain.contains('.') || domain.split('.').any(str::is_empty) {
            return Err(AuthError::InvalidEmail);
        }

        if email.chars().any(char::is_whitespace) {
            return Err(AuthError::InvalidEmail);
        }

        Ok(())
    }

    /// Validate username format
    fn validate_username(username: &str) -> Result<(), AuthError> {
        // Username must be 3-50 characters
        if username.len() < 3 || username.len() > 50 {
            return Err(AuthError::InvalidUsername);
        }

        // Username must start with a letter
        if !username
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
        {
            return Err(AuthError::InvalidUsername);
        }

        // Letters, digits, underscores and hyphens only
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AuthError::InvalidUsername);
        }

        Ok(())
    }

    /// Validate password strength
    fn validate_password(password: &str) -> Result<(), AuthError> {
        if password.chars().count() < 8 {
            return Err(AuthError::PasswordTooShort);
        }

        let has_uppercase = password.chars().any(|c| c.is_uppercase());
        let has_lowercase = password.chars().any(|c| c.is_lowercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());

        if !has_uppercase || !has_lowercase || !has_digit {
            return Err(AuthError::PasswordTooWeak);
        }

        Ok(())
    }

    /// Hash on the blocking pool; bcrypt is deliberately slow
    async fn hash_password(&self, password: String) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::InternalError(e.to_string()))??;
        Ok(hash)
    }

    /// Register a new principal. No tokens are issued.
    pub async fn register(&self, request: RegisterRequest) -> Result<PrincipalResponse, AuthError> {
        let username = request.username.trim().to_string();
        let email = normalize_email(&request.email);

        Self::validate_email(&email)?;
        Self::validate_username(&username)?;
        Self::validate_password(&request.password)?;

        let role = request.role.unwrap_or_default();
        if !role.is_self_assignable() {
            return Err(AuthError::RoleNotAssignable);
        }

        let display_name = request
            .display_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        let password_hash = self.hash_password(request.password).await?;

        let principal = self
            .principals
            .insert(NewPrincipal {
                username,
                email,
                password_hash,
                display_name,
                roles: vec![role.as_str().to_string()],
                email_verified: false,
                enabled: true,
            })
            .await?;

        tracing::info!(principal_id = %principal.id, role = %role, "Principal registered");

        Ok(principal.into())
    }

    /// Issue an access token and a refresh token for an authenticated principal
    async fn start_session(&self, principal: Principal) -> Result<AuthResponse, AuthError> {
        let access = self.jwt_service.issue(&principal)?;

        let refresh = self
            .refresh_tokens
            .create(&principal.username)
            .await
            .map_err(|err| match err {
                // Removed between authentication and token creation
                AuthError::PrincipalNotFound => AuthError::InvalidCredentials,
                other => other,
            })?;

        Ok(AuthResponse {
            principal: principal.into(),
            tokens: TokenPair::new(access, refresh),
        })
    }

    /// Login with username-or-email and password
    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse, AuthError> {
        let principal = self
            .verifier
            .verify(&request.identifier, &request.password)
            .await?;

        if !principal.enabled {
            tracing::info!(principal_id = %principal.id, "Login refused for disabled principal");
            return Err(AuthError::AccountDisabled);
        }

        let response = self.start_session(principal).await?;
        tracing::info!(principal_id = %response.principal.id, "Login succeeded");

        Ok(response)
    }

    /// Exchange a valid refresh token for a new access token.
    ///
    /// The password is not re-checked. Without rotation the refresh token's
    /// expiry is left untouched; with rotation it is replaced.
    pub async fn refresh(&self, request: RefreshRequest) -> Result<RefreshResponse, AuthError> {
        let token = request.refresh_token.trim();

        if token.is_empty() || !self.refresh_tokens.validate(token).await {
            return Err(AuthError::InvalidToken);
        }

        let username = self
            .refresh_tokens
            .resolve_identifier(token)
            .await
            .ok_or(AuthError::InvalidToken)?;

        // A vanished or disabled owner looks like any other bad token
        let principal = self
            .principals
            .find_by_username(&username)
            .await?
            .filter(|p| p.enabled)
            .ok_or(AuthError::InvalidToken)?;

        let rotated = if self.refresh_tokens.config().rotate_on_refresh {
            if !self.refresh_tokens.revoke(token).await? {
                // Lost a race with another refresh or a logout
                return Err(AuthError::InvalidToken);
            }
            Some(self.refresh_tokens.create(&principal.username).await?)
        } else {
            None
        };

        let access = self.jwt_service.issue(&principal)?;

        tracing::debug!(
            principal_id = %principal.id,
            rotated = rotated.is_some(),
            "Access token refreshed"
        );

        Ok(RefreshResponse {
            access_token: access.token,
            access_expires_at: access.expires_at.timestamp(),
            token_type: "Bearer".to_string(),
            refresh_expires_at: rotated.as_ref().map(|r| r.expires_at.timestamp()),
            refresh_token: rotated.map(|r| r.token),
        })
    }

    /// Revoke one refresh token. Unknown tokens are not an error.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let revoked = self.refresh_tokens.revoke(refresh_token.trim()).await?;
        tracing::debug!(revoked, "Logout");
        Ok(())
    }

    /// Revoke every refresh token of the principal behind `access_token`
    pub async fn logout_all(&self, access_token: &str) -> Result<u64, AuthError> {
        let claims = self.jwt_service.verify(access_token)?;
        let principal_id = claims.principal_id()?;

        let count = self.refresh_tokens.revoke_all(principal_id).await?;
        tracing::info!(%principal_id, count, "Revoked all refresh tokens");

        Ok(count)
    }

    /// Principal behind a valid access token
    pub async fn current_principal(
        &self,
        access_token: &str,
    ) -> Result<PrincipalResponse, AuthError> {
        let claims = self.jwt_service.verify(access_token)?;
        let principal_id = claims.principal_id()?;

        let principal = self
            .principals
            .find_by_id(principal_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if !principal.enabled {
            return Err(AuthError::AccountDisabled);
        }

        Ok(principal.into())
    }

    /// Login via an external identity provider, creating the principal on
    /// first sight of a verified email
    pub async fn login_with_provider(
        &self,
        request: ProviderLoginRequest,
    ) -> Result<AuthResponse, AuthError> {
        let provider = self
            .identity_provider
            .as_ref()
            .ok_or(AuthError::ProviderUnavailable)?;

        let identity = provider.fetch_identity(request.access_token.trim()).await?;

        if !identity.email_verified {
            tracing::info!(provider = provider.name(), "Provider email not verified");
            return Err(AuthError::ExternalIdentityRejected);
        }

        let email = normalize_email(&identity.email);

        let principal = match self.principals.find_by_email(&email).await? {
            Some(existing) => existing,
            None => {
                let mut secret = [0u8; 32];
                OsRng.fill_bytes(&mut secret);
                // Password login stays impossible until a reset sets a real one
                let password_hash = self.hash_password(hex::encode(secret)).await?;

                let created = self
                    .principals
                    .insert(NewPrincipal {
                        username: email.clone(),
                        email: email.clone(),
                        password_hash,
                        display_name: identity.name.clone(),
                        roles: vec![Role::Student.as_str().to_string()],
                        email_verified: true,
                        enabled: true,
                    })
                    .await;

                match created {
                    Ok(principal) => {
                        tracing::info!(
                            principal_id = %principal.id,
                            provider = provider.name(),
                            "Principal created from external identity"
                        );
                        principal
                    }
                    // Concurrent first login for the same email
                    Err(UserRepositoryError::EmailAlreadyExists) => self
                        .principals
                        .find_by_email(&email)
                        .await?
                        .ok_or(AuthError::PrincipalNotFound)?,
                    Err(err) => return Err(err.into()),
                }
            }
        };

        if !principal.enabled {
            return Err(AuthError::AccountDisabled);
        }

        self.start_session(principal).await
    }

    /// Store reachability
    pub async fn health(&self) -> Result<(), AuthError> {
        self.principals.ping().await?;
        Ok(())
    }
}
