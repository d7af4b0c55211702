//! Application assembly: stores, services and the HTTP router

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::core::auth::{
    AuthApiState, AuthError, AuthService, BcryptHasher, IdentityProviderError, JwtConfig,
    JwtService, RefreshTokenConfig, RefreshTokenService, SystemClock, UserInfoProvider,
    auth_api_router,
};
use crate::core::config::Config;
use crate::core::db::repositories::{
    InMemoryPrincipalStore, InMemoryRefreshTokenStore, PrincipalStore, RefreshTokenRepository,
    RefreshTokenStore, UserRepository,
};
use crate::core::db::{DbConfig, DbError, connect};

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Database(#[from] DbError),

    #[error("Failed to initialise auth service: {0}")]
    Auth(#[from] AuthError),

    #[error("Failed to initialise identity provider: {0}")]
    IdentityProvider(#[from] IdentityProviderError),
}

/// Fully wired application
pub struct App {
    pub router: Router,
    /// Shared with the background expiry sweep
    pub refresh_tokens: RefreshTokenService,
}

/// Pick the stores: PostgreSQL when `DATABASE_URL` is set, in-memory otherwise
async fn stores(
    config: &Config,
) -> Result<(Arc<dyn PrincipalStore>, Arc<dyn RefreshTokenStore>), AppError> {
    let Some(database_url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores; data is lost on restart");
        return Ok((
            Arc::new(InMemoryPrincipalStore::new()),
            Arc::new(InMemoryRefreshTokenStore::new()),
        ));
    };

    let mut db_config = DbConfig::new(database_url.clone());
    if let Some(max) = config.db_max_connections {
        db_config = db_config.max_connections(max);
    }
    if let Some(min) = config.db_min_connections {
        db_config = db_config.min_connections(min);
    }
    if let Some(timeout) = config.db_connect_timeout {
        db_config = db_config.connect_timeout(timeout.as_secs());
    }

    let pool = connect(&db_config).await?;

    Ok((
        Arc::new(UserRepository::new(pool.clone())),
        Arc::new(RefreshTokenRepository::new(pool)),
    ))
}

/// Build services and router from configuration
pub async fn build(config: &Config) -> Result<App, AppError> {
    let (principals, tokens) = stores(config).await?;
    let clock = Arc::new(SystemClock);

    let jwt_config = JwtConfig::new(config.jwt_secret.clone())
        .access_token_expiration(config.access_token_expiration_minutes)
        .issuer(config.jwt_issuer.clone());
    let jwt_service = JwtService::with_clock(jwt_config, clock.clone());

    let refresh_tokens = RefreshTokenService::new(
        tokens,
        principals.clone(),
        clock,
        RefreshTokenConfig::default()
            .expiration_days(config.refresh_token_expiration_days)
            .rotate_on_refresh(config.refresh_token_rotation),
    );

    let mut auth_service = AuthService::new(
        principals,
        Arc::new(BcryptHasher::new(config.bcrypt_cost)),
        jwt_service,
        refresh_tokens.clone(),
    )?;

    if let Some(url) = &config.oauth2_userinfo_url {
        let provider = UserInfoProvider::new("oauth2", url.clone())?;
        auth_service = auth_service.with_identity_provider(Arc::new(provider));
        tracing::info!("Provider login enabled");
    }

    Ok(App {
        router: router(auth_service),
        refresh_tokens,
    })
}

/// HTTP router with request tracing and CORS
pub fn router(auth_service: AuthService) -> Router {
    auth_api_router(AuthApiState { auth_service })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
