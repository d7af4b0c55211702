//! Authentication and session token lifecycle
//!
//! This module provides:
//! - Credential verification against stored bcrypt hashes
//! - Short-lived JWT access tokens
//! - Opaque, hashed-at-rest refresh tokens with lazy expiry
//! - The session orchestrator and its REST API

pub mod api;
pub mod clock;
pub mod credentials;
pub mod identity;
pub mod jwt;
pub mod password;
pub mod refresh;
pub mod service;

#[cfg(test)]
mod tests;

pub use api::{AuthApiState, auth_api_router};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::CredentialVerifier;
pub use identity::{ExternalIdentity, IdentityProvider, IdentityProviderError, UserInfoProvider};
pub use jwt::{AccessToken, Claims, JwtConfig, JwtError, JwtService};
pub use password::{BcryptHasher, PasswordError, PasswordHasher};
pub use refresh::{IssuedRefreshToken, RefreshTokenConfig, RefreshTokenService};
pub use service::{
    AuthError, AuthResponse, AuthService, LoginRequest, ProviderLoginRequest, RefreshRequest,
    RefreshResponse, RegisterRequest, TokenPair,
};
