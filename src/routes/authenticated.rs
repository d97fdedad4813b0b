use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{delete, get},
};

/// Authenticated Router Module
///
/// Self-service endpoints. Handlers take `AuthUser`, which the middleware has
/// already resolved; grant `/api/auth/*` and `/api/routes` to roles that should
/// reach them.
pub fn authenticated_routes() -> Router<AppState> {
    Router::<AppState>::new()
        // GET /api/auth/me
        .route("/auth/me", get(handlers::me))
        // GET /api/auth/sessions: cursor-paginated device list.
        // DELETE /api/auth/sessions: logout everywhere.
        .route(
            "/auth/sessions",
            get(handlers::list_sessions).delete(handlers::revoke_all_sessions),
        )
        // DELETE /api/auth/sessions/{id}
        .route("/auth/sessions/{id}", delete(handlers::revoke_session))
        // GET /api/routes
        // The caller's visible route tree.
        .route("/routes", get(handlers::visible_routes))
}
