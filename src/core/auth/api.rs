//! Auth API endpoints
//!
//! Provides REST API endpoints for authentication:
//! - POST /auth/register - Register a new principal
//! - POST /auth/login - Login and get tokens
//! - POST /auth/refresh - Exchange a refresh token for an access token
//! - POST /auth/logout - Revoke one refresh token
//! - POST /auth/logout-all - Revoke every refresh token of the caller
//! - GET /auth/me - Current principal from the access token
//! - POST /auth/oauth2/login - Login with an identity provider access token
//! - GET /health - Store reachability

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;

use crate::core::auth::{
    AuthError, AuthResponse, AuthService, LoginRequest, ProviderLoginRequest, RefreshRequest,
    RefreshResponse, RegisterRequest,
};
use crate::core::db::models::PrincipalResponse;

/// Auth API state containing the auth service
#[derive(Clone)]
pub struct AuthApiState {
    pub auth_service: AuthService,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

/// Convert AuthError to API response
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS"),
            AuthError::AccountDisabled => (StatusCode::FORBIDDEN, "ACCOUNT_DISABLED"),
            AuthError::PrincipalNotFound | AuthError::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "INVALID_TOKEN")
            }
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED"),
            AuthError::EmailAlreadyExists => (StatusCode::CONFLICT, "EMAIL_EXISTS"),
            AuthError::UsernameAlreadyExists => (StatusCode::CONFLICT, "USERNAME_EXISTS"),
            AuthError::PasswordTooShort => (StatusCode::BAD_REQUEST, "PASSWORD_TOO_SHORT"),
            AuthError::PasswordTooWeak => (StatusCode::BAD_REQUEST, "PASSWORD_TOO_WEAK"),
            AuthError::InvalidEmail => (StatusCode::BAD_REQUEST, "INVALID_EMAIL"),
            AuthError::InvalidUsername => (StatusCode::BAD_REQUEST, "INVALID_USERNAME"),
            AuthError::RoleNotAssignable => (StatusCode::BAD_REQUEST, "ROLE_NOT_ASSIGNABLE"),
            AuthError::MalformedRequest(_) => (StatusCode::BAD_REQUEST, "MALFORMED_REQUEST"),
            AuthError::ProviderUnavailable => (StatusCode::NOT_FOUND, "PROVIDER_UNAVAILABLE"),
            AuthError::ExternalIdentityRejected => {
                (StatusCode::UNAUTHORIZED, "EXTERNAL_IDENTITY_REJECTED")
            }
            AuthError::ProviderError(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
            AuthError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let message = match &self {
            AuthError::PrincipalNotFound => AuthError::InvalidToken.to_string(),
            AuthError::ProviderError(detail) => {
                tracing::warn!(%detail, "Identity provider call failed");
                "Identity provider unavailable".to_string()
            }
            AuthError::InternalError(detail) => {
                tracing::error!(%detail, "Internal error while handling auth request");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ApiError::new(message, code))).into_response()
    }
}

/// Body for endpoints returning a single principal
#[derive(Debug, Serialize)]
pub struct PrincipalEnvelope {
    pub principal: PrincipalResponse,
}

/// Response for logout
#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub message: String,
}

/// Response for logout-all
#[derive(Debug, Serialize)]
pub struct LogoutAllResponse {
    pub revoked: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Create the auth API router
pub fn auth_api_router(state: AuthApiState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/logout-all", post(logout_all_handler))
        .route("/auth/me", get(me_handler))
        .route("/auth/oauth2/login", post(provider_login_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Unwrap a JSON body, turning extractor rejections into `MalformedRequest`
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AuthError::MalformedRequest(rejection.body_text()))
}

/// POST /auth/register
async fn register_handler(
    State(state): State<Arc<AuthApiState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PrincipalEnvelope>), AuthError> {
    let request = json_body(payload)?;

    let principal = state.auth_service.register(request).await?;

    Ok((StatusCode::CREATED, Json(PrincipalEnvelope { principal })))
}

/// POST /auth/login
async fn login_handler(
    State(state): State<Arc<AuthApiState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AuthError> {
    let request = json_body(payload)?;

    let response = state.auth_service.login(request).await?;

    Ok(Json(response))
}

/// POST /auth/refresh
async fn refresh_handler(
    State(state): State<Arc<AuthApiState>>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<RefreshResponse>, AuthError> {
    let request = json_body(payload)?;

    let response = state.auth_service.refresh(request).await?;

    Ok(Json(response))
}

/// POST /auth/logout
async fn logout_handler(
    State(state): State<Arc<AuthApiState>>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<LogoutResponse>, AuthError> {
    let request = json_body(payload)?;

    state.auth_service.logout(&request.refresh_token).await?;

    Ok(Json(LogoutResponse {
        message: "Logged out successfully".to_string(),
    }))
}

/// POST /auth/logout-all
async fn logout_all_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
) -> Result<Json<LogoutAllResponse>, AuthError> {
    let token = extract_bearer_token(&headers)?;

    let revoked = state.auth_service.logout_all(&token).await?;

    Ok(Json(LogoutAllResponse { revoked }))
}

/// GET /auth/me
async fn me_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
) -> Result<Json<PrincipalEnvelope>, AuthError> {
    let token = extract_bearer_token(&headers)?;

    let principal = state.auth_service.current_principal(&token).await?;

    Ok(Json(PrincipalEnvelope { principal }))
}

/// POST /auth/oauth2/login
async fn provider_login_handler(
    State(state): State<Arc<AuthApiState>>,
    payload: Result<Json<ProviderLoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AuthError> {
    let request = json_body(payload)?;

    let response = state.auth_service.login_with_provider(request).await?;

    Ok(Json(response))
}

/// GET /health
async fn health_handler(State(state): State<Arc<AuthApiState>>) -> impl IntoResponse {
    match state.auth_service.health().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse { status: "ok" })),
        Err(err) => {
            tracing::warn!(error = %err, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                }),
            )
        }
    }
}

/// Extract Bearer token from Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::InvalidToken)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or(AuthError::InvalidToken)?;

    if token.is_empty() {
        return Err(AuthError::InvalidToken);
    }

    Ok(token.to_string())
}
