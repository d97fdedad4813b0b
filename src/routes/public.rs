use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Public Router Module
///
/// Paths on the strictly public allowlist. The middleware lets these through
/// even when the caller presents a broken or expired credential, so a client can
/// always log in again.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /api/health
        .route("/health", get(handlers::health))
        // POST /api/auth/login
        // Issues a token pair and upserts the (user, device) session.
        .route("/auth/login", post(handlers::login))
        // POST /api/auth/register
        // New accounts get the default role.
        .route("/auth/register", post(handlers::register))
        // POST /api/auth/refresh
        // Rotates the device's refresh token.
        .route("/auth/refresh", post(handlers::refresh))
        // POST /api/auth/logout
        // Idempotent; always reports success.
        .route("/auth/logout", post(handlers::logout))
}
