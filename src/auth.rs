use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts, Request, State},
    http::{HeaderMap, request::Parts},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::{
    AppState,
    config::AppConfig,
    error::{AppError, AuthFailure},
    models::DeviceClass,
    permissions::{PermissionSet, effective_permissions},
    repository::UserDirectoryState,
    tokens::{BearerCredential, Claims, TokenKind, TokenService, extract_bearer},
};

/// AuthUser
///
/// The resolved identity of a request, attached to the request extensions by
/// `auth_middleware`. The permission set is computed from the user's *current*
/// roles, never from the token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub name: String,
    pub role_ids: Vec<Uuid>,
    pub permissions: PermissionSet,
    /// Device the access token was issued to.
    pub device_id: String,
    pub device_class: DeviceClass,
}

/// Required identity. Rejects with 401 when the middleware resolved nobody.
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AppError::Unauthenticated(AuthFailure::MissingCredential))
    }
}

/// Optional identity, for handlers on optionally-public paths.
impl<S> OptionalFromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<AuthUser>().cloned())
    }
}

/// PathClass
///
/// How the access policy treats a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Outside `/api`; not this layer's concern.
    NonApi,
    /// Always allowed, credential ignored even if broken.
    StrictPublic,
    /// Allowed with or without an identity; a presented credential must be valid.
    OptionalPublic,
    /// Requires an identity whose permissions cover the path.
    Protected,
}

/// AccessPolicy
///
/// The two allowlists. Strictly public paths match exactly; optionally public
/// entries match as prefixes.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    public_paths: Vec<String>,
    optional_public_prefixes: Vec<String>,
}

impl AccessPolicy {
    pub fn new(public_paths: Vec<String>, optional_public_prefixes: Vec<String>) -> Self {
        Self {
            public_paths,
            optional_public_prefixes,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.public_paths.clone(), config.optional_public_prefixes.clone())
    }

    pub fn classify(&self, path: &str) -> PathClass {
        if path != "/api" && !path.starts_with("/api/") {
            return PathClass::NonApi;
        }
        // Tolerate a trailing slash on allowlisted paths.
        let normalized = match path.strip_suffix('/') {
            Some(stripped) if !stripped.is_empty() => stripped,
            _ => path,
        };
        if self.public_paths.iter().any(|p| p == normalized) {
            return PathClass::StrictPublic;
        }
        if self.optional_public_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return PathClass::OptionalPublic;
        }
        PathClass::Protected
    }
}

/// Access
///
/// Outcome of a successful authorization decision.
#[derive(Debug, Clone)]
pub enum Access {
    /// The middleware did not inspect the request.
    Bypass,
    /// No credential, on a path that allows that.
    Anonymous,
    Authenticated(AuthUser),
}

/// authorize_request
///
/// The per-request decision procedure:
/// non-API and strictly public paths pass untouched; a presented credential must
/// verify and belong to a user who can still authenticate; optionally public
/// paths then pass; everything else requires an identity whose current
/// permissions cover the path.
///
/// Returns `Unauthenticated` (401), `Forbidden` (403), or `Internal` when the
/// user directory is unreachable. Nothing is retried.
pub async fn authorize_request(
    policy: &AccessPolicy,
    tokens: &TokenService,
    users: &UserDirectoryState,
    path: &str,
    headers: &HeaderMap,
) -> Result<Access, AppError> {
    let class = policy.classify(path);
    if matches!(class, PathClass::NonApi | PathClass::StrictPublic) {
        return Ok(Access::Bypass);
    }

    let identity = match extract_bearer(headers) {
        BearerCredential::Absent => None,
        BearerCredential::Malformed => {
            tracing::debug!(path, "malformed bearer credential");
            return Err(AppError::Unauthenticated(AuthFailure::InvalidToken));
        }
        BearerCredential::Present(token) => {
            let claims = tokens.verify(TokenKind::Access, &token).inspect_err(|_| {
                tracing::debug!(path, "access token rejected");
            })?;
            Some(resolve_user(users, claims).await?)
        }
    };

    match (class, identity) {
        (PathClass::OptionalPublic, Some(user)) => Ok(Access::Authenticated(user)),
        (PathClass::OptionalPublic, None) => Ok(Access::Anonymous),
        (_, None) => {
            tracing::debug!(path, "no credential on protected path");
            Err(AppError::Unauthenticated(AuthFailure::MissingCredential))
        }
        (_, Some(user)) if user.permissions.allows(path) => Ok(Access::Authenticated(user)),
        (_, Some(user)) => {
            tracing::info!(user_id = %user.id, path, "permission denied");
            Err(AppError::Forbidden)
        }
    }
}

/// Re-read the token's subject from the directory and compute its permissions.
async fn resolve_user(users: &UserDirectoryState, claims: Claims) -> Result<AuthUser, AppError> {
    let Some(record) = users.find_user_by_id(claims.sub).await? else {
        tracing::info!(user_id = %claims.sub, "token subject no longer exists");
        return Err(AppError::Unauthenticated(AuthFailure::AccountLocked));
    };
    if !record.can_authenticate() {
        tracing::info!(user_id = %claims.sub, "token subject is inactive");
        return Err(AppError::Unauthenticated(AuthFailure::AccountLocked));
    }

    let permissions = effective_permissions(&record);
    Ok(AuthUser {
        id: record.user.id,
        email: record.user.email,
        username: record.user.username,
        name: record.user.name,
        role_ids: record.user.role_ids,
        permissions,
        device_id: claims.device_id,
        device_class: claims.device_class,
    })
}

/// auth_middleware
///
/// Runs `authorize_request` for every request. On success the resolved `AuthUser`
/// (if any) is inserted into the request extensions for handlers to extract.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let path = request.uri().path().to_string();
    let access = authorize_request(&state.policy, &state.tokens, &state.users, &path, request.headers()).await?;

    if let Access::Authenticated(user) = access {
        tracing::debug!(user_id = %user.id, path = %path, "request authorized");
        request.extensions_mut().insert(user);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AccessPolicy {
        AccessPolicy::from_config(&AppConfig::default())
    }

    #[test]
    fn classifies_paths() {
        let policy = policy();
        assert_eq!(policy.classify("/swagger-ui/index.html"), PathClass::NonApi);
        assert_eq!(policy.classify("/apiary"), PathClass::NonApi);
        assert_eq!(policy.classify("/api/auth/login"), PathClass::StrictPublic);
        assert_eq!(policy.classify("/api/auth/login/"), PathClass::StrictPublic);
        assert_eq!(policy.classify("/api/posts/5"), PathClass::OptionalPublic);
        assert_eq!(policy.classify("/api/users"), PathClass::Protected);
        assert_eq!(policy.classify("/api"), PathClass::Protected);
    }

    #[test]
    fn strict_public_is_exact() {
        assert_eq!(policy().classify("/api/auth/login-as-admin"), PathClass::Protected);
    }
}
