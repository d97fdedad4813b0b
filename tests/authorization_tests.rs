mod common;

use axum::http::{HeaderMap, HeaderValue, header};
use chrono::{Duration, Utc};
use cms_access::{
    AccessPolicy, AppConfig, AppError, AppState,
    auth::{Access, PathClass, authorize_request},
    config::DEFAULT_PUBLIC_PATHS,
    error::AuthFailure,
    models::DeviceClass,
    repository::UserDirectory,
    tokens::{TokenKind, TokenSubject},
};
use common::{TestContext, access_token, context, seed_user};
use uuid::Uuid;

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

async fn authorize(state: &AppState, path: &str, headers: &HeaderMap) -> Result<Access, AppError> {
    authorize_request(&state.policy, &state.tokens, &state.users, path, headers).await
}

/// Context whose policy has no optionally public prefixes, so every API path
/// outside the strict allowlist is protected.
fn strict_context() -> TestContext {
    let mut config = AppConfig::default();
    config.optional_public_prefixes.clear();
    let ctx = common::context_with(config);
    assert!(ctx.state.policy.classify("/api/posts") == PathClass::Protected);
    ctx
}

fn unauthenticated(result: &Result<Access, AppError>) -> Option<AuthFailure> {
    match result {
        Err(AppError::Unauthenticated(reason)) => Some(*reason),
        _ => None,
    }
}

#[tokio::test]
async fn test_prefix_grant_allows_matching_path_and_forbids_others() {
    let ctx = strict_context();
    let (user, _) = seed_user(&ctx.store, "writer", &["/api/posts*"]);
    let headers = bearer(&access_token(&ctx.state, &user));

    match authorize(&ctx.state, "/api/posts/5", &headers).await {
        Ok(Access::Authenticated(auth)) => {
            assert_eq!(auth.id, user.id);
            assert!(auth.permissions.allows("/api/posts/5"));
        }
        other => panic!("expected allow, got {other:?}"),
    }

    let denied = authorize(&ctx.state, "/api/users", &headers).await;
    assert!(matches!(denied, Err(AppError::Forbidden)));
}

#[tokio::test]
async fn test_deactivation_after_issuance_locks_account() {
    let ctx = strict_context();
    let (user, _) = seed_user(&ctx.store, "leaver", &["*"]);
    let headers = bearer(&access_token(&ctx.state, &user));

    assert!(authorize(&ctx.state, "/api/posts/5", &headers).await.is_ok());

    ctx.store.set_user_active(user.id, false).await.unwrap();
    let result = authorize(&ctx.state, "/api/posts/5", &headers).await;
    assert_eq!(unauthenticated(&result), Some(AuthFailure::AccountLocked));
}

#[tokio::test]
async fn test_unknown_subject_locks_account() {
    let ctx = strict_context();
    let (user, _) = seed_user(&ctx.store, "ghost", &["*"]);
    let mut stranger = user.clone();
    stranger.id = Uuid::new_v4();
    let headers = bearer(&access_token(&ctx.state, &stranger));

    let result = authorize(&ctx.state, "/api/users", &headers).await;
    assert_eq!(unauthenticated(&result), Some(AuthFailure::AccountLocked));
}

#[tokio::test]
async fn test_role_change_applies_to_existing_tokens() {
    let ctx = strict_context();
    let (user, role) = seed_user(&ctx.store, "demoted", &["/api/posts*"]);
    let headers = bearer(&access_token(&ctx.state, &user));

    ctx.store.update_role(role.id, |r| r.is_active = false);
    let result = authorize(&ctx.state, "/api/posts/5", &headers).await;
    assert!(matches!(result, Err(AppError::Forbidden)));
}

#[tokio::test]
async fn test_missing_credential_on_protected_path() {
    let ctx = context();
    let result = authorize(&ctx.state, "/api/users", &HeaderMap::new()).await;
    assert_eq!(unauthenticated(&result), Some(AuthFailure::MissingCredential));
}

#[tokio::test]
async fn test_strict_public_paths_ignore_broken_credentials() {
    let ctx = context();
    let headers = bearer("not-a-jwt");
    for path in DEFAULT_PUBLIC_PATHS {
        let result = authorize(&ctx.state, path, &headers).await;
        assert!(matches!(result, Ok(Access::Bypass)), "{path}");
    }
}

#[tokio::test]
async fn test_optional_public_path_anonymous_and_authenticated() {
    let ctx = context();
    let (user, _) = seed_user(&ctx.store, "reader", &[]);

    let anonymous = authorize(&ctx.state, "/api/posts/5", &HeaderMap::new()).await;
    assert!(matches!(anonymous, Ok(Access::Anonymous)));

    // Permissions are not checked on optionally public paths.
    let headers = bearer(&access_token(&ctx.state, &user));
    let identified = authorize(&ctx.state, "/api/posts/5", &headers).await;
    assert!(matches!(identified, Ok(Access::Authenticated(ref u)) if u.id == user.id));
}

#[tokio::test]
async fn test_optional_public_path_rejects_bad_credential() {
    let ctx = context();
    let result = authorize(&ctx.state, "/api/categories", &bearer("garbage")).await;
    assert_eq!(unauthenticated(&result), Some(AuthFailure::InvalidToken));

    let mut empty = HeaderMap::new();
    empty.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
    let result = authorize(&ctx.state, "/api/categories", &empty).await;
    assert_eq!(unauthenticated(&result), Some(AuthFailure::InvalidToken));
}

#[tokio::test]
async fn test_expired_access_token_is_rejected() {
    let ctx = context();
    let (user, _) = seed_user(&ctx.store, "late", &["*"]);
    let subject = TokenSubject::new(&user, "d", DeviceClass::Web);
    let stale = ctx
        .state
        .tokens
        .issue(TokenKind::Access, &subject, Utc::now() - Duration::hours(1))
        .unwrap();

    let result = authorize(&ctx.state, "/api/users", &bearer(&stale)).await;
    assert_eq!(unauthenticated(&result), Some(AuthFailure::InvalidToken));
}

#[tokio::test]
async fn test_refresh_token_is_not_an_access_token() {
    let ctx = context();
    let (user, _) = seed_user(&ctx.store, "sneaky", &["*"]);
    let subject = TokenSubject::new(&user, "d", DeviceClass::Web);
    let refresh = ctx.state.tokens.issue(TokenKind::Refresh, &subject, Utc::now()).unwrap();

    let result = authorize(&ctx.state, "/api/users", &bearer(&refresh)).await;
    assert_eq!(unauthenticated(&result), Some(AuthFailure::InvalidToken));
}

#[tokio::test]
async fn test_directory_outage_is_internal_not_allow() {
    let ctx = context();
    let (user, _) = seed_user(&ctx.store, "unlucky", &["*"]);
    let headers = bearer(&access_token(&ctx.state, &user));
    ctx.store.set_unavailable(true);

    let result = authorize(&ctx.state, "/api/users", &headers).await;
    assert!(matches!(result, Err(AppError::Internal(_))));
}

#[tokio::test]
async fn test_non_api_paths_bypass() {
    let ctx = context();
    let result = authorize(&ctx.state, "/swagger-ui/index.html", &bearer("garbage")).await;
    assert!(matches!(result, Ok(Access::Bypass)));
}

#[tokio::test]
async fn test_custom_policy_lists() {
    let policy = AccessPolicy::new(vec!["/api/open".to_string()], vec!["/api/feed".to_string()]);
    assert_eq!(policy.classify("/api/open"), PathClass::StrictPublic);
    assert_eq!(policy.classify("/api/open/more"), PathClass::Protected);
    assert_eq!(policy.classify("/api/feed/2025"), PathClass::OptionalPublic);
    assert_eq!(policy.classify("/api/auth/login"), PathClass::Protected);
}
