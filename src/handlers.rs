use crate::{
    AppState,
    auth::AuthUser,
    error::{AppError, AppResult, AuthFailure, ErrorBody},
    models::{
        ActionResponse, LoginRequest, LoginResponse, LogoutRequest, NewRoute, NewUser, ProfileResponse,
        RefreshRequest, RegisterRequest, RequestMetadata, RouteEntry, RouteNode, RouteOrder, SessionCursor,
        SessionPage, SessionQuery, SessionView, TokenPair, UpdateUserStatusRequest, UserSummary,
    },
    password::{hash_password, verify_password},
    route_cache::{RouteCache, build_tree},
    sessions::{SessionListing, SessionManager},
    tokens::{TokenKind, TokenSubject},
};
use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 6;
const MIN_USERNAME_LEN: usize = 3;
const MIN_NAME_LEN: usize = 2;
const MAX_DEVICE_ID_LEN: usize = 128;

// --- Request helpers ---

/// Unwrap a JSON body, reporting a malformed one as a validation error.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::Validation(rejection.body_text()))
}

/// request_metadata
///
/// User agent and client ip of the request. The ip is the first hop of
/// `x-forwarded-for`, falling back to `x-real-ip`.
pub fn request_metadata(headers: &HeaderMap) -> RequestMetadata {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let ip = text("x-forwarded-for")
        .and_then(|list| list.split(',').next().map(|first| first.trim().to_string()))
        .filter(|ip| !ip.is_empty())
        .or_else(|| text("x-real-ip"));

    RequestMetadata {
        user_agent: text(header::USER_AGENT.as_str()),
        ip,
    }
}

fn session_page(listing: SessionListing, current_device: Option<&str>) -> SessionPage {
    SessionPage {
        items: listing
            .sessions
            .iter()
            .map(|s| SessionView::from_session(s, current_device))
            .collect(),
        next_cursor: listing.next_cursor.map(|c| c.encode()),
    }
}

fn parse_cursor(raw: Option<&str>) -> AppResult<Option<SessionCursor>> {
    match raw.filter(|c| !c.is_empty()) {
        None => Ok(None),
        Some(raw) => SessionCursor::decode(raw)
            .map(Some)
            .ok_or_else(|| AppError::Validation("invalid cursor".to_string())),
    }
}

/// Trim and check a catalog entry submitted for create or update.
fn validated_route(mut route: NewRoute) -> AppResult<NewRoute> {
    route.path = route.path.trim().to_string();
    route.name = route.name.trim().to_string();
    if !route.path.starts_with('/') {
        return Err(AppError::Validation("path must start with '/'".to_string()));
    }
    if route.name.is_empty() {
        return Err(AppError::Validation("name is required".to_string()));
    }
    route.permissions.retain(|p| !p.trim().is_empty());
    Ok(route)
}

/// Check a registration and normalize its identifiers to lower case.
fn validated_registration(request: RegisterRequest) -> AppResult<RegisterRequest> {
    let email = request.email.trim().to_lowercase();
    let username = request.username.trim().to_lowercase();
    let name = request.name.trim().to_string();

    let email_ok = email.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
    });
    if !email_ok || email.contains(char::is_whitespace) {
        return Err(AppError::Validation("invalid email address".to_string()));
    }
    if username.len() < MIN_USERNAME_LEN
        || !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(format!(
            "username must be at least {MIN_USERNAME_LEN} characters of letters, digits, '_' or '-'"
        )));
    }
    if request.password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if name.chars().count() < MIN_NAME_LEN {
        return Err(AppError::Validation(format!("name must be at least {MIN_NAME_LEN} characters")));
    }

    Ok(RegisterRequest {
        email,
        username,
        name,
        password: request.password,
    })
}

// --- Public ---

/// health
///
/// [Public Route] Liveness check.
#[utoipa::path(get, path = "/api/health", responses((status = 200, description = "Alive", body = String)))]
pub async fn health() -> &'static str {
    "ok"
}

/// login
///
/// [Public Route] Exchanges credentials for an access/refresh token pair and
/// creates (or replaces) the session of the calling device.
#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in", body = LoginResponse),
        (status = 400, description = "Malformed request", body = ErrorBody),
        (status = 401, description = "Bad credentials or inactive account", body = ErrorBody)
    )
)]
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<Json<LoginResponse>> {
    let request = json_body(payload)?;
    let identifier = request.username_or_email.trim();
    let device_id = request.device_id.trim();

    if identifier.is_empty() {
        return Err(AppError::Validation("username_or_email is required".to_string()));
    }
    if request.password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(AppError::Validation(format!(
            "device_id must be 1 to {MAX_DEVICE_ID_LEN} characters"
        )));
    }

    let now = Utc::now();
    if let Err(e) = state.sessions.purge_expired(now).await {
        tracing::warn!(error = %e, "expired session cleanup failed");
    }

    let Some(record) = state.users.find_user_by_login(identifier).await? else {
        tracing::info!("login with unknown identifier");
        return Err(AppError::Unauthenticated(AuthFailure::BadCredentials));
    };
    if !verify_password(&request.password, &record.user.password_hash) {
        tracing::info!(user_id = %record.user.id, "login with wrong password");
        return Err(AppError::Unauthenticated(AuthFailure::BadCredentials));
    }
    if !record.can_authenticate() {
        tracing::info!(user_id = %record.user.id, "login to inactive account");
        return Err(AppError::Unauthenticated(AuthFailure::AccountLocked));
    }

    let subject = TokenSubject::new(&record.user, device_id, request.device_type);
    let expires_at = now + state.tokens.ttl(TokenKind::Refresh);
    let access_token = state.tokens.issue(TokenKind::Access, &subject, now)?;
    let refresh_token = state.tokens.issue_until(TokenKind::Refresh, &subject, now, expires_at)?;

    let session = state
        .sessions
        .upsert(
            record.user.id,
            device_id,
            request.device_type,
            &refresh_token,
            expires_at,
            request_metadata(&headers),
            now,
        )
        .await?;

    tracing::info!(
        user_id = %record.user.id,
        session_id = %session.id,
        device_class = %session.device_class,
        "user logged in"
    );

    Ok(Json(LoginResponse {
        user: UserSummary::from(&record.user),
        tokens: TokenPair {
            access_token,
            refresh_token,
            expires_at: session.expires_at,
        },
    }))
}

/// register
///
/// [Public Route] Self-registration. The new account is active and holds the
/// default role; it logs in through `/api/auth/login` like any other.
#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Registered", body = UserSummary),
        (status = 400, description = "Malformed request", body = ErrorBody),
        (status = 409, description = "Email or username taken", body = ErrorBody),
        (status = 500, description = "No default role configured", body = ErrorBody)
    )
)]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<UserSummary>)> {
    let request = validated_registration(json_body(payload)?)?;
    let password_hash = hash_password(&request.password)?;

    let record = state
        .users
        .create_user(NewUser {
            email: request.email,
            username: request.username,
            name: request.name,
            password_hash,
        })
        .await?;

    tracing::info!(user_id = %record.user.id, "user registered");
    Ok((StatusCode::CREATED, Json(UserSummary::from(&record.user))))
}

/// refresh
///
/// [Public Route] Trades the device's current refresh token for a new token pair.
/// The stored token is rotated; the presented one stops working. The session's
/// absolute expiry is not extended.
#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated", body = TokenPair),
        (status = 401, description = "Invalid, superseded or expired refresh token", body = ErrorBody)
    )
)]
pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> AppResult<Json<TokenPair>> {
    let presented = json_body(payload)?
        .refresh_token
        .filter(|t| !t.trim().is_empty())
        .ok_or(AppError::Unauthenticated(AuthFailure::MissingCredential))?;

    let claims = state.tokens.verify(TokenKind::Refresh, &presented)?;
    let now = Utc::now();

    let record = state
        .users
        .find_user_by_id(claims.sub)
        .await?
        .filter(|r| r.can_authenticate())
        .ok_or(AppError::Unauthenticated(AuthFailure::AccountLocked))?;

    let Some(session) = state.sessions.find_by_refresh_token(claims.sub, &presented, now).await? else {
        tracing::info!(user_id = %claims.sub, "refresh token not current for any live session");
        return Err(AppError::Unauthenticated(AuthFailure::InvalidSession));
    };

    let subject = TokenSubject::new(&record.user, session.device_id.clone(), session.device_class);
    let access_token = state.tokens.issue(TokenKind::Access, &subject, now)?;
    let refresh_token = state
        .tokens
        .issue_until(TokenKind::Refresh, &subject, now, session.expires_at)?;

    if !state.sessions.rotate(&session, &refresh_token, now).await? {
        tracing::info!(user_id = %claims.sub, session_id = %session.id, "refresh lost a concurrent rotation");
        return Err(AppError::Unauthenticated(AuthFailure::InvalidSession));
    }

    tracing::debug!(user_id = %claims.sub, session_id = %session.id, "refresh token rotated");
    Ok(Json(TokenPair {
        access_token,
        refresh_token,
        expires_at: session.expires_at,
    }))
}

/// logout
///
/// [Public Route] Revokes the session holding the presented refresh token.
/// Always reports success.
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    request_body = LogoutRequest,
    responses((status = 200, description = "Logged out", body = ActionResponse))
)]
pub async fn logout(
    State(sessions): State<SessionManager>,
    payload: Result<Json<LogoutRequest>, JsonRejection>,
) -> Json<ActionResponse> {
    let token = payload.ok().and_then(|Json(body)| body.refresh_token);
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        match sessions.revoke_by_refresh_token(&token).await {
            Ok(revoked) => tracing::debug!(revoked, "logout"),
            Err(e) => tracing::warn!(error = %e, "logout failed, reporting success"),
        }
    }
    Json(ActionResponse::ok("Logged out"))
}

// --- Authenticated ---

/// me
///
/// [Authenticated Route] The caller's identity and currently effective permissions.
#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Profile", body = ProfileResponse),
        (status = 401, description = "Unauthenticated", body = ErrorBody)
    )
)]
pub async fn me(user: AuthUser) -> Json<ProfileResponse> {
    Json(ProfileResponse {
        permissions: user.permissions.to_vec(),
        device_class: user.device_class,
        user: UserSummary {
            id: user.id,
            email: user.email,
            username: user.username,
            name: user.name,
            role_ids: user.role_ids,
        },
    })
}

/// list_sessions
///
/// [Authenticated Route] The caller's live device sessions, most recently active
/// first. The session the request came from is flagged `current`.
#[utoipa::path(
    get,
    path = "/api/auth/sessions",
    params(SessionQuery),
    responses(
        (status = 200, description = "Sessions", body = SessionPage),
        (status = 400, description = "Bad cursor", body = ErrorBody)
    )
)]
pub async fn list_sessions(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> AppResult<Json<SessionPage>> {
    let cursor = parse_cursor(query.cursor.as_deref())?;
    let listing = state
        .sessions
        .list_by_user(user.id, query.limit, cursor, Utc::now())
        .await?;
    Ok(Json(session_page(listing, Some(&user.device_id))))
}

/// revoke_session
///
/// [Authenticated Route] Logs out one of the caller's devices. Idempotent; an
/// unknown or foreign session id still reports success.
#[utoipa::path(
    delete,
    path = "/api/auth/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    responses((status = 200, description = "Revoked", body = ActionResponse))
)]
pub async fn revoke_session(
    user: AuthUser,
    State(sessions): State<SessionManager>,
    Path(session_id): Path<Uuid>,
) -> Json<ActionResponse> {
    match sessions.revoke(user.id, session_id).await {
        Ok(revoked) => tracing::info!(user_id = %user.id, %session_id, revoked, "session revoked"),
        Err(e) => tracing::warn!(user_id = %user.id, %session_id, error = %e, "session revoke failed"),
    }
    Json(ActionResponse::ok("Session revoked"))
}

/// revoke_all_sessions
///
/// [Authenticated Route] Logs the caller out everywhere, including this device.
#[utoipa::path(
    delete,
    path = "/api/auth/sessions",
    responses((status = 200, description = "All sessions revoked", body = ActionResponse))
)]
pub async fn revoke_all_sessions(user: AuthUser, State(sessions): State<SessionManager>) -> Json<ActionResponse> {
    match sessions.revoke_all(user.id).await {
        Ok(count) => tracing::info!(user_id = %user.id, count, "all sessions revoked"),
        Err(e) => tracing::warn!(user_id = %user.id, error = %e, "revoke all failed"),
    }
    Json(ActionResponse::ok("Logged out of all devices"))
}

/// visible_routes
///
/// [Authenticated Route] The route tree the caller may see. Reloads the catalog
/// once if the cache turns out to be cold.
#[utoipa::path(
    get,
    path = "/api/routes",
    responses(
        (status = 200, description = "Visible route tree", body = [RouteNode]),
        (status = 500, description = "Catalog unavailable", body = ErrorBody)
    )
)]
pub async fn visible_routes(user: AuthUser, State(state): State<AppState>) -> AppResult<Json<Vec<RouteNode>>> {
    let visible = state.routes.visible_for_or_reload(&user.permissions).await?;
    Ok(Json(build_tree(&visible)))
}

// --- Administration ---

/// user_sessions
///
/// [Admin Route] Live sessions of any user.
#[utoipa::path(
    get,
    path = "/api/users/{id}/sessions",
    params(("id" = Uuid, Path, description = "User id"), SessionQuery),
    responses(
        (status = 200, description = "Sessions", body = SessionPage),
        (status = 404, description = "No such user", body = ErrorBody)
    )
)]
pub async fn user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<SessionQuery>,
) -> AppResult<Json<SessionPage>> {
    if state.users.find_user_by_id(user_id).await?.is_none() {
        return Err(AppError::NotFound("user"));
    }
    let cursor = parse_cursor(query.cursor.as_deref())?;
    let listing = state
        .sessions
        .list_by_user(user_id, query.limit, cursor, Utc::now())
        .await?;
    Ok(Json(session_page(listing, None)))
}

/// revoke_user_session
///
/// [Admin Route] Force-logout of one device of any user.
#[utoipa::path(
    delete,
    path = "/api/users/{id}/sessions/{session_id}",
    params(
        ("id" = Uuid, Path, description = "User id"),
        ("session_id" = Uuid, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Revoked", body = ActionResponse),
        (status = 404, description = "No such session", body = ErrorBody)
    )
)]
pub async fn revoke_user_session(
    admin: AuthUser,
    State(state): State<AppState>,
    Path((user_id, session_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<ActionResponse>> {
    if !state.sessions.revoke(user_id, session_id).await? {
        return Err(AppError::NotFound("session"));
    }
    tracing::info!(admin_id = %admin.id, %user_id, %session_id, "session revoked by administrator");
    Ok(Json(ActionResponse::ok("Session revoked")))
}

/// update_user_status
///
/// [Admin Route] Activates or deactivates a user. Deactivation also revokes all
/// of the user's sessions; outstanding access tokens fail on their next use.
#[utoipa::path(
    put,
    path = "/api/users/{id}/status",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = UpdateUserStatusRequest,
    responses(
        (status = 200, description = "Updated", body = ActionResponse),
        (status = 404, description = "No such user", body = ErrorBody)
    )
)]
pub async fn update_user_status(
    admin: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    payload: Result<Json<UpdateUserStatusRequest>, JsonRejection>,
) -> AppResult<Json<ActionResponse>> {
    let request = json_body(payload)?;
    if !state.users.set_user_active(user_id, request.is_active).await? {
        return Err(AppError::NotFound("user"));
    }

    if request.is_active {
        tracing::info!(admin_id = %admin.id, %user_id, "user activated");
        return Ok(Json(ActionResponse::ok("User activated")));
    }

    let revoked = state.sessions.revoke_all(user_id).await?;
    tracing::info!(admin_id = %admin.id, %user_id, revoked, "user deactivated");
    Ok(Json(ActionResponse::ok("User deactivated")))
}

/// list_system_routes
///
/// [Admin Route] The full route catalog, flat, in catalog order.
#[utoipa::path(
    get,
    path = "/api/system/routes",
    responses((status = 200, description = "Catalog", body = [RouteEntry]))
)]
pub async fn list_system_routes(State(routes): State<Arc<RouteCache>>) -> AppResult<Json<Vec<RouteEntry>>> {
    let snapshot = routes.current_or_reload().await?;
    Ok(Json(snapshot.routes().to_vec()))
}

/// create_system_route
///
/// [Admin Route] Adds a catalog entry and reloads the cache.
#[utoipa::path(
    post,
    path = "/api/system/routes",
    request_body = NewRoute,
    responses(
        (status = 201, description = "Created", body = RouteEntry),
        (status = 400, description = "Invalid route or unknown parent", body = ErrorBody),
        (status = 409, description = "Path already in use", body = ErrorBody)
    )
)]
pub async fn create_system_route(
    State(routes): State<Arc<RouteCache>>,
    payload: Result<Json<NewRoute>, JsonRejection>,
) -> AppResult<(StatusCode, Json<RouteEntry>)> {
    let route = validated_route(json_body(payload)?)?;
    let created = routes.create_route(route).await?;
    tracing::info!(route_id = %created.id, path = %created.path, "route created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// update_system_route
///
/// [Admin Route] Replaces a catalog entry (path, name, icon, sort, visibility,
/// required permissions, parent) and reloads the cache.
#[utoipa::path(
    put,
    path = "/api/system/routes/{id}",
    params(("id" = Uuid, Path, description = "Route id")),
    request_body = NewRoute,
    responses(
        (status = 200, description = "Updated", body = RouteEntry),
        (status = 400, description = "Invalid route, unknown parent or cycle", body = ErrorBody),
        (status = 404, description = "No such route", body = ErrorBody),
        (status = 409, description = "Path already in use", body = ErrorBody)
    )
)]
pub async fn update_system_route(
    State(routes): State<Arc<RouteCache>>,
    Path(route_id): Path<Uuid>,
    payload: Result<Json<NewRoute>, JsonRejection>,
) -> AppResult<Json<RouteEntry>> {
    let route = validated_route(json_body(payload)?)?;
    let updated = routes
        .update_route(route_id, route)
        .await?
        .ok_or(AppError::NotFound("route"))?;
    tracing::info!(%route_id, path = %updated.path, "route updated");
    Ok(Json(updated))
}

/// delete_system_route
///
/// [Admin Route] Removes a leaf catalog entry and reloads the cache.
#[utoipa::path(
    delete,
    path = "/api/system/routes/{id}",
    params(("id" = Uuid, Path, description = "Route id")),
    responses(
        (status = 200, description = "Deleted", body = ActionResponse),
        (status = 404, description = "No such route", body = ErrorBody),
        (status = 409, description = "Route has children", body = ErrorBody)
    )
)]
pub async fn delete_system_route(
    State(routes): State<Arc<RouteCache>>,
    Path(route_id): Path<Uuid>,
) -> AppResult<Json<ActionResponse>> {
    if !routes.delete_route(route_id).await? {
        return Err(AppError::NotFound("route"));
    }
    tracing::info!(%route_id, "route deleted");
    Ok(Json(ActionResponse::ok("Route deleted")))
}

/// reorder_system_routes
///
/// [Admin Route] Bulk re-parent/re-sort. Rejected when it references unknown
/// routes or would introduce a cycle.
#[utoipa::path(
    put,
    path = "/api/system/routes/order",
    request_body = [RouteOrder],
    responses(
        (status = 200, description = "Reordered", body = ActionResponse),
        (status = 400, description = "Unknown route or cycle", body = ErrorBody)
    )
)]
pub async fn reorder_system_routes(
    State(routes): State<Arc<RouteCache>>,
    payload: Result<Json<Vec<RouteOrder>>, JsonRejection>,
) -> AppResult<Json<ActionResponse>> {
    let changes = json_body(payload)?;
    if changes.is_empty() {
        return Ok(Json(ActionResponse::ok("Nothing to reorder")));
    }

    routes.reorder_routes(&changes).await?;

    tracing::info!(changes = changes.len(), "routes reordered");
    Ok(Json(ActionResponse::ok("Routes reordered")))
}

/// reload_routes
///
/// [Admin Route] Forces a cache reload from the catalog.
#[utoipa::path(
    post,
    path = "/api/system/routes/reload",
    responses(
        (status = 200, description = "Reloaded", body = ActionResponse),
        (status = 500, description = "Catalog unavailable", body = ErrorBody)
    )
)]
pub async fn reload_routes(State(routes): State<Arc<RouteCache>>) -> AppResult<Json<ActionResponse>> {
    let count = routes.load().await?;
    Ok(Json(ActionResponse::ok(format!("{count} routes loaded"))))
}

/// not_found
///
/// Fallback for unmatched paths that passed authorization.
pub async fn not_found() -> AppError {
    AppError::NotFound("resource")
}
