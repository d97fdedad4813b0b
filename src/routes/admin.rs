use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Admin Router Module
///
/// User moderation and route catalog administration. Access comes from path
/// permissions such as `/api/users*` and `/api/system*`; there is no separate
/// role check.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // GET /api/users/{id}/sessions
        .route("/users/{id}/sessions", get(handlers::user_sessions))
        // DELETE /api/users/{id}/sessions/{session_id}
        .route(
            "/users/{id}/sessions/{session_id}",
            delete(handlers::revoke_user_session),
        )
        // PUT /api/users/{id}/status
        // Deactivation revokes every session of the user.
        .route("/users/{id}/status", put(handlers::update_user_status))
        // --- Route catalog ---
        // Every mutation reloads the route cache.
        .route(
            "/system/routes",
            get(handlers::list_system_routes).post(handlers::create_system_route),
        )
        .route("/system/routes/order", put(handlers::reorder_system_routes))
        .route("/system/routes/reload", post(handlers::reload_routes))
        .route(
            "/system/routes/{id}",
            put(handlers::update_system_route).delete(handlers::delete_system_route),
        )
}
