//! Session lifecycle tests across the verifier, issuers and orchestrator,
//! plus HTTP-level tests driving the router with `oneshot`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::Duration;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::core::auth::{
    AuthApiState, AuthError, AuthService, BcryptHasher, ExternalIdentity, IdentityProvider,
    IdentityProviderError, JwtConfig, JwtService, LoginRequest, ManualClock,
    ProviderLoginRequest, RefreshRequest, RefreshTokenConfig, RefreshTokenService,
    RegisterRequest, auth_api_router,
};
use crate::core::db::models::Role;
use crate::core::db::repositories::{InMemoryPrincipalStore, InMemoryRefreshTokenStore, PrincipalStore};

const SECRET: &str = "test-secret-key-that-is-long-enough-for-hs256";

struct Harness {
    service: AuthService,
    jwt: JwtService,
    principals: Arc<InMemoryPrincipalStore>,
    tokens: Arc<InMemoryRefreshTokenStore>,
    clock: Arc<ManualClock>,
}

fn harness_with(config: RefreshTokenConfig) -> Harness {
    let principals = Arc::new(InMemoryPrincipalStore::new());
    let tokens = Arc::new(InMemoryRefreshTokenStore::new());
    let clock = Arc::new(ManualClock::starting_now());
    let hasher = Arc::new(BcryptHasher::new(4));

    let jwt = JwtService::with_clock(JwtConfig::new(SECRET), clock.clone());
    let refresh =
        RefreshTokenService::new(tokens.clone(), principals.clone(), clock.clone(), config);
    let service = AuthService::new(principals.clone(), hasher, jwt.clone(), refresh).unwrap();

    Harness {
        service,
        jwt,
        principals,
        tokens,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(RefreshTokenConfig::default())
}

fn register_request(username: &str, email: &str) -> RegisterRequest {
    RegisterRequest {
        username: username.to_string(),
        email: email.to_string(),
        password: "Password123".to_string(),
        display_name: None,
        role: None,
    }
}

fn login_request(identifier: &str, password: &str) -> LoginRequest {
    LoginRequest {
        identifier: identifier.to_string(),
        password: password.to_string(),
    }
}

fn refresh_request(token: &str) -> RefreshRequest {
    RefreshRequest {
        refresh_token: token.to_string(),
    }
}

async fn registered() -> Harness {
    let h = harness();
    h.service
        .register(register_request("alice", "alice@example.com"))
        .await
        .unwrap();
    h
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_defaults() {
    let h = harness();

    let principal = h
        .service
        .register(register_request("alice", "alice@example.com"))
        .await
        .unwrap();

    assert_eq!(principal.username, "alice");
    assert_eq!(principal.roles, vec![Role::Student.as_str().to_string()]);
    assert!(!principal.email_verified);
    assert!(principal.enabled);

    // Registration never starts a session
    assert!(h.tokens.is_empty());

    let stored = h.principals.find_by_username("alice").await.unwrap().unwrap();
    assert_ne!(stored.password_hash, "Password123");
    assert!(stored.password_hash.starts_with("$2"));
}

#[tokio::test]
async fn test_register_instructor_allowed_admin_refused() {
    let h = harness();

    let mut instructor = register_request("instructor1", "instructor1@example.com");
    instructor.role = Some(Role::Instructor);
    let principal = h.service.register(instructor).await.unwrap();
    assert_eq!(principal.roles, vec!["ROLE_INSTRUCTOR".to_string()]);

    let mut admin = register_request("mallory", "mallory@example.com");
    admin.role = Some(Role::Admin);
    assert!(matches!(
        h.service.register(admin).await,
        Err(AuthError::RoleNotAssignable)
    ));
}

#[tokio::test]
async fn test_register_duplicates() {
    let h = registered().await;

    let result = h
        .service
        .register(register_request("alice2", "alice@example.com"))
        .await;
    assert!(matches!(result, Err(AuthError::EmailAlreadyExists)));

    let result = h
        .service
        .register(register_request("alice", "other@example.com"))
        .await;
    assert!(matches!(result, Err(AuthError::UsernameAlreadyExists)));
}

#[tokio::test]
async fn test_register_normalizes_email_case() {
    let h = harness();

    let principal = h
        .service
        .register(register_request("alice", "  Alice@Example.COM "))
        .await
        .unwrap();
    assert_eq!(principal.email, "alice@example.com");

    let result = h
        .service
        .register(register_request("alice2", "ALICE@example.com"))
        .await;
    assert!(matches!(result, Err(AuthError::EmailAlreadyExists)));
}

#[tokio::test]
async fn test_register_validation() {
    let h = harness();

    let mut weak = register_request("bob", "bob@example.com");
    weak.password = "password".to_string();
    assert!(matches!(
        h.service.register(weak).await,
        Err(AuthError::PasswordTooWeak)
    ));

    assert!(matches!(
        h.service.register(register_request("bob", "not-an-email")).await,
        Err(AuthError::InvalidEmail)
    ));

    assert!(matches!(
        h.service.register(register_request("1bob", "bob@example.com")).await,
        Err(AuthError::InvalidUsername)
    ));
}

// ============================================================================
// Login
// ============================================================================

#[tokio::test]
async fn test_login_returns_tokens_and_refresh_validates() {
    let h = registered().await;

    let response = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();

    assert!(!response.tokens.access_token.is_empty());
    assert!(!response.tokens.refresh_token.is_empty());
    assert_eq!(response.tokens.token_type, "Bearer");
    assert_eq!(response.principal.username, "alice");

    assert!(
        h.service
            .refresh_tokens()
            .validate(&response.tokens.refresh_token)
            .await
    );

    let claims = h.jwt.verify(&response.tokens.access_token).unwrap();
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.exp - claims.iat, 15 * 60);
    assert_eq!(claims.roles, vec!["ROLE_STUDENT"]);
}

#[tokio::test]
async fn test_login_by_email() {
    let h = registered().await;

    let response = h
        .service
        .login(login_request("alice@example.com", "Password123"))
        .await
        .unwrap();

    let claims = h.jwt.verify(&response.tokens.access_token).unwrap();
    assert_eq!(claims.sub, "alice");

    let response = h
        .service
        .login(login_request("ALICE@Example.com", "Password123"))
        .await
        .unwrap();
    assert_eq!(response.principal.username, "alice");
}

#[tokio::test]
async fn test_login_wrong_password_issues_nothing() {
    let h = registered().await;

    for password in ["Password124", "", "password123"] {
        let result = h.service.login(login_request("alice", password)).await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    let result = h.service.login(login_request("nobody", "Password123")).await;
    assert!(matches!(result, Err(AuthError::InvalidCredentials)));

    assert!(h.tokens.is_empty());
}

#[tokio::test]
async fn test_login_disabled_principal() {
    let h = registered().await;
    let alice = h.principals.find_by_username("alice").await.unwrap().unwrap();
    h.principals.set_enabled(alice.id, false);

    let result = h.service.login(login_request("alice", "Password123")).await;
    assert!(matches!(result, Err(AuthError::AccountDisabled)));
    assert!(h.tokens.is_empty());
}

// ============================================================================
// Refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_is_repeatable_and_yields_distinct_access_tokens() {
    let h = registered().await;
    let login = h
        .service
        .login(login_request("alice@example.com", "Password123"))
        .await
        .unwrap();
    let refresh_token = login.tokens.refresh_token;

    h.clock.advance(Duration::seconds(1));
    let first = h.service.refresh(refresh_request(&refresh_token)).await.unwrap();
    h.clock.advance(Duration::seconds(1));
    let second = h.service.refresh(refresh_request(&refresh_token)).await.unwrap();

    assert_ne!(first.access_token, second.access_token);
    assert_ne!(first.access_token, login.tokens.access_token);
    assert!(first.refresh_token.is_none());

    let first_claims = h.jwt.verify(&first.access_token).unwrap();
    let second_claims = h.jwt.verify(&second.access_token).unwrap();
    assert_eq!(first_claims.sub, "alice");
    assert_eq!(second_claims.sub, "alice");
    assert!(second_claims.iat > first_claims.iat);

    // Refresh never extends the refresh token itself
    assert!(h.service.refresh_tokens().validate(&refresh_token).await);
    assert_eq!(h.tokens.len(), 1);
}

#[tokio::test]
async fn test_refresh_unknown_token() {
    let h = registered().await;

    for token in ["never-issued", "", "   "] {
        let result = h.service.refresh(refresh_request(token)).await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }
}

#[tokio::test]
async fn test_refresh_expired_token() {
    let h = registered().await;
    let login = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();
    let expires_at = chrono::DateTime::from_timestamp(login.tokens.refresh_expires_at, 0).unwrap();

    h.clock.set(expires_at - Duration::seconds(1));
    assert!(
        h.service
            .refresh(refresh_request(&login.tokens.refresh_token))
            .await
            .is_ok()
    );

    h.clock.set(expires_at);
    let result = h
        .service
        .refresh(refresh_request(&login.tokens.refresh_token))
        .await;
    assert!(matches!(result, Err(AuthError::InvalidToken)));
}

#[tokio::test]
async fn test_refresh_refused_for_disabled_or_removed_principal() {
    let h = registered().await;
    let login = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();
    let alice = h.principals.find_by_username("alice").await.unwrap().unwrap();

    h.principals.set_enabled(alice.id, false);
    let result = h
        .service
        .refresh(refresh_request(&login.tokens.refresh_token))
        .await;
    assert!(matches!(result, Err(AuthError::InvalidToken)));

    h.principals.set_enabled(alice.id, true);
    h.principals.remove(alice.id);
    let result = h
        .service
        .refresh(refresh_request(&login.tokens.refresh_token))
        .await;
    assert!(matches!(result, Err(AuthError::InvalidToken)));
}

#[tokio::test]
async fn test_refresh_with_rotation() {
    let h = harness_with(RefreshTokenConfig::default().rotate_on_refresh(true));
    h.service
        .register(register_request("alice", "alice@example.com"))
        .await
        .unwrap();
    let login = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();

    let rotated = h
        .service
        .refresh(refresh_request(&login.tokens.refresh_token))
        .await
        .unwrap();
    let new_token = rotated.refresh_token.unwrap();
    assert!(rotated.refresh_expires_at.is_some());
    assert_ne!(new_token, login.tokens.refresh_token);

    // The presented token is spent
    let replay = h
        .service
        .refresh(refresh_request(&login.tokens.refresh_token))
        .await;
    assert!(matches!(replay, Err(AuthError::InvalidToken)));

    assert!(h.service.refresh(refresh_request(&new_token)).await.is_ok());
    assert_eq!(h.tokens.len(), 1);
}

// ============================================================================
// Sessions and revocation
// ============================================================================

#[tokio::test]
async fn test_multiple_sessions() {
    let h = registered().await;

    let a = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();
    let b = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();

    assert_ne!(a.tokens.refresh_token, b.tokens.refresh_token);
    assert!(h.service.refresh(refresh_request(&a.tokens.refresh_token)).await.is_ok());
    assert!(h.service.refresh(refresh_request(&b.tokens.refresh_token)).await.is_ok());
}

#[tokio::test]
async fn test_logout_revokes_only_that_session() {
    let h = registered().await;
    let a = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();
    let b = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();

    h.service.logout(&a.tokens.refresh_token).await.unwrap();
    // Idempotent
    h.service.logout(&a.tokens.refresh_token).await.unwrap();

    assert!(matches!(
        h.service.refresh(refresh_request(&a.tokens.refresh_token)).await,
        Err(AuthError::InvalidToken)
    ));
    assert!(h.service.refresh(refresh_request(&b.tokens.refresh_token)).await.is_ok());
}

#[tokio::test]
async fn test_logout_all() {
    let h = registered().await;
    let a = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();
    let b = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();

    let revoked = h.service.logout_all(&b.tokens.access_token).await.unwrap();
    assert_eq!(revoked, 2);
    assert!(h.tokens.is_empty());
    assert!(!h.service.refresh_tokens().validate(&a.tokens.refresh_token).await);

    assert!(matches!(
        h.service.logout_all("not-a-jwt").await,
        Err(AuthError::InvalidToken)
    ));
}

#[tokio::test]
async fn test_purge_keeps_live_sessions() {
    let h = registered().await;
    let old = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();
    h.clock.advance(Duration::days(5));
    let recent = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();

    h.clock.advance(Duration::days(3));
    assert_eq!(h.service.refresh_tokens().purge_expired().await.unwrap(), 1);
    assert!(h.service.refresh(refresh_request(&recent.tokens.refresh_token)).await.is_ok());
    assert!(
        h.service
            .refresh(refresh_request(&old.tokens.refresh_token))
            .await
            .is_err()
    );
}

// ============================================================================
// Current principal
// ============================================================================

#[tokio::test]
async fn test_current_principal() {
    let h = registered().await;
    let login = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();

    let me = h
        .service
        .current_principal(&login.tokens.access_token)
        .await
        .unwrap();
    assert_eq!(me.username, "alice");
    assert_eq!(me.email, "alice@example.com");

    let other = JwtService::new(JwtConfig::new("a-completely-different-secret-of-length"));
    let alice = h.principals.find_by_username("alice").await.unwrap().unwrap();
    let forged = other.issue(&alice).unwrap();
    assert!(matches!(
        h.service.current_principal(&forged.token).await,
        Err(AuthError::InvalidToken)
    ));
}

// ============================================================================
// External identity provider
// ============================================================================

struct StaticProvider {
    identity: ExternalIdentity,
}

#[async_trait]
impl IdentityProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_identity(
        &self,
        access_token: &str,
    ) -> Result<ExternalIdentity, IdentityProviderError> {
        if access_token == "good-provider-token" {
            Ok(self.identity.clone())
        } else {
            Err(IdentityProviderError::Rejected)
        }
    }
}

fn with_provider(h: Harness, email_verified: bool) -> Harness {
    let provider = Arc::new(StaticProvider {
        identity: ExternalIdentity {
            subject: "provider-1".to_string(),
            email: "carol@example.com".to_string(),
            email_verified,
            name: Some("Carol".to_string()),
        },
    });

    Harness {
        service: h.service.with_identity_provider(provider),
        ..h
    }
}

fn provider_request(token: &str) -> ProviderLoginRequest {
    ProviderLoginRequest {
        access_token: token.to_string(),
    }
}

#[tokio::test]
async fn test_provider_login_creates_principal_once() {
    let h = with_provider(harness(), true);

    let first = h
        .service
        .login_with_provider(provider_request("good-provider-token"))
        .await
        .unwrap();
    assert_eq!(first.principal.email, "carol@example.com");
    assert_eq!(first.principal.username, "carol@example.com");
    assert!(first.principal.email_verified);
    assert_eq!(first.principal.display_name.as_deref(), Some("Carol"));

    let second = h
        .service
        .login_with_provider(provider_request("good-provider-token"))
        .await
        .unwrap();
    assert_eq!(first.principal.id, second.principal.id);

    assert!(
        h.service
            .refresh(refresh_request(&second.tokens.refresh_token))
            .await
            .is_ok()
    );

    // The generated password is never usable
    let result = h
        .service
        .login(login_request("carol@example.com", ""))
        .await;
    assert!(matches!(result, Err(AuthError::InvalidCredentials)));
}

#[tokio::test]
async fn test_provider_login_reuses_existing_account() {
    let h = with_provider(harness(), true);
    h.service
        .register(register_request("carol", "Carol@Example.com"))
        .await
        .unwrap();

    let response = h
        .service
        .login_with_provider(provider_request("good-provider-token"))
        .await
        .unwrap();
    assert_eq!(response.principal.username, "carol");
    assert_eq!(response.principal.email, "carol@example.com");
}

#[tokio::test]
async fn test_provider_login_rejections() {
    let unverified = with_provider(harness(), false);
    assert!(matches!(
        unverified
            .service
            .login_with_provider(provider_request("good-provider-token"))
            .await,
        Err(AuthError::ExternalIdentityRejected)
    ));

    let h = with_provider(harness(), true);
    assert!(matches!(
        h.service
            .login_with_provider(provider_request("bad-token"))
            .await,
        Err(AuthError::ExternalIdentityRejected)
    ));
    assert!(h.tokens.is_empty());

    let none = harness();
    assert!(matches!(
        none.service
            .login_with_provider(provider_request("good-provider-token"))
            .await,
        Err(AuthError::ProviderUnavailable)
    ));
}

// ============================================================================
// HTTP
// ============================================================================

fn router(h: &Harness) -> axum::Router {
    auth_api_router(AuthApiState {
        auth_service: h.service.clone(),
    })
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(h).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_http_register_login_refresh_me() {
    let h = harness();

    let (status, body) = send(
        &h,
        post_json(
            "/auth/register",
            json!({
                "username": "alice",
                "email": "alice@example.com",
                "password": "Password123",
                "displayName": "Alice"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["principal"]["username"], "alice");
    assert_eq!(body["principal"]["displayName"], "Alice");
    assert!(body["principal"].get("passwordHash").is_none());
    assert!(body.get("accessToken").is_none());

    let (status, body) = send(
        &h,
        post_json(
            "/auth/login",
            json!({"email": "alice@example.com", "password": "Password123"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokenType"], "Bearer");
    let access = body["accessToken"].as_str().unwrap().to_string();
    let refresh = body["refreshToken"].as_str().unwrap().to_string();

    let (status, body) = send(
        &h,
        post_json("/auth/refresh", json!({"refreshToken": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["accessToken"].as_str().is_some());
    assert!(body.get("refreshToken").is_none());

    let request = Request::builder()
        .uri("/auth/me")
        .header(header::AUTHORIZATION, format!("Bearer {access}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["principal"]["email"], "alice@example.com");
}

#[tokio::test]
async fn test_http_error_bodies() {
    let h = registered().await;

    let (status, body) = send(
        &h,
        post_json(
            "/auth/login",
            json!({"username": "alice", "password": "wrong"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "INVALID_CREDENTIALS");

    let (status, body) = send(
        &h,
        post_json("/auth/refresh", json!({"refreshToken": "never-issued"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "INVALID_TOKEN");

    let (status, body) = send(&h, post_json("/auth/refresh", json!({"token": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "MALFORMED_REQUEST");

    let (status, body) = send(
        &h,
        post_json(
            "/auth/register",
            json!({
                "username": "alice",
                "email": "alice@example.com",
                "password": "Password123"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "EMAIL_EXISTS");

    let request = Request::builder()
        .uri("/auth/me")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &h,
        post_json("/auth/oauth2/login", json!({"accessToken": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "PROVIDER_UNAVAILABLE");
}

#[tokio::test]
async fn test_http_logout_and_logout_all() {
    let h = registered().await;
    let a = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();
    let b = h
        .service
        .login(login_request("alice", "Password123"))
        .await
        .unwrap();

    let (status, body) = send(
        &h,
        post_json("/auth/logout", json!({"refreshToken": a.tokens.refresh_token})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().is_some());

    let request = Request::builder()
        .method("POST")
        .uri("/auth/logout-all")
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", b.tokens.access_token),
        )
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], 1);
    assert!(h.tokens.is_empty());
}

#[tokio::test]
async fn test_http_health() {
    let h = harness();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

