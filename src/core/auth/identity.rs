//! External identity providers
//!
//! An OAuth2/OIDC provider vouches for an email address; the auth service
//! maps that onto a local principal. `UserInfoProvider` calls a standard
//! OIDC userinfo endpoint with the provider-issued access token.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Identity asserted by an external provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    /// Provider-scoped subject identifier
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
    pub name: Option<String>,
}

/// Identity provider errors
#[derive(Debug, thiserror::Error)]
pub enum IdentityProviderError {
    #[error("Provider rejected the access token")]
    Rejected,

    #[error("Provider did not return an email address")]
    MissingEmail,

    #[error("Unexpected provider response status: {0}")]
    UnexpectedStatus(u16),

    #[error("Provider request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Capability: exchange a provider access token for a verified identity
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    async fn fetch_identity(
        &self,
        access_token: &str,
    ) -> Result<ExternalIdentity, IdentityProviderError>;
}

/// Standard OIDC userinfo claims
#[derive(Debug, Deserialize)]
struct UserInfoClaims {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    name: Option<String>,
}

impl UserInfoClaims {
    fn into_identity(self) -> Result<ExternalIdentity, IdentityProviderError> {
        let email = self
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or(IdentityProviderError::MissingEmail)?;

        Ok(ExternalIdentity {
            subject: self.sub,
            email,
            email_verified: self.email_verified,
            name: self.name,
        })
    }
}

/// Provider backed by an OIDC userinfo endpoint
#[derive(Clone)]
pub struct UserInfoProvider {
    client: reqwest::Client,
    userinfo_url: String,
    name: String,
}

impl UserInfoProvider {
    pub fn new(
        name: impl Into<String>,
        userinfo_url: impl Into<String>,
    ) -> Result<Self, IdentityProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            userinfo_url: userinfo_url.into(),
            name: name.into(),
        })
    }
}

#[async_trait]
impl IdentityProvider for UserInfoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_identity(
        &self,
        access_token: &str,
    ) -> Result<ExternalIdentity, IdentityProviderError> {
        let response = self
            .client
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(IdentityProviderError::Rejected);
        }
        if !status.is_success() {
            tracing::warn!(provider = %self.name, %status, "Userinfo request failed");
            return Err(IdentityProviderError::UnexpectedStatus(status.as_u16()));
        }

        response.json::<UserInfoClaims>().await?.into_identity()
    }
}
