use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    http::HeaderName,
    middleware,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod password;
pub mod permissions;
pub mod repository;
pub mod route_cache;
pub mod sessions;
pub mod tokens;

// Routers grouped by access class.
pub mod routes;
use routes::{admin, authenticated, public};

// --- Public Re-exports ---

pub use auth::{AccessPolicy, AuthUser};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use memory::MemoryStore;
pub use repository::{PostgresRepository, RouteCatalogState, SessionStoreState, UserDirectoryState};
pub use route_cache::RouteCache;
pub use sessions::SessionManager;
pub use tokens::TokenService;

/// ApiDoc
///
/// OpenAPI document for every endpoint, served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health, handlers::login, handlers::register, handlers::refresh, handlers::logout,
        handlers::me, handlers::list_sessions, handlers::revoke_session, handlers::revoke_all_sessions,
        handlers::visible_routes, handlers::user_sessions, handlers::revoke_user_session,
        handlers::update_user_status, handlers::list_system_routes, handlers::create_system_route,
        handlers::update_system_route, handlers::delete_system_route, handlers::reorder_system_routes,
        handlers::reload_routes
    ),
    components(
        schemas(
            models::DeviceClass, models::LoginRequest, models::LoginResponse, models::RegisterRequest,
            models::RefreshRequest, models::LogoutRequest, models::TokenPair, models::UserSummary,
            models::ProfileResponse, models::SessionView, models::SessionPage, models::RouteEntry,
            models::RouteNode, models::NewRoute, models::RouteOrder, models::UpdateUserStatusRequest,
            models::ActionResponse, error::ErrorBody,
        )
    ),
    tags(
        (name = "cms-access", description = "CMS authentication, sessions and route access")
    )
)]
struct ApiDoc;

/// AppState
///
/// Everything a request may need, cloned cheaply into each handler. The route
/// cache is shared behind an `Arc` so every clone sees the same snapshot.
#[derive(Clone)]
pub struct AppState {
    pub users: UserDirectoryState,
    pub sessions: SessionManager,
    pub routes: Arc<RouteCache>,
    pub tokens: TokenService,
    pub policy: AccessPolicy,
    pub config: AppConfig,
}

impl AppState {
    /// Wire the collaborators together. The route cache starts cold; call
    /// `routes.load()` before serving.
    pub fn new(
        config: AppConfig,
        users: UserDirectoryState,
        catalog: RouteCatalogState,
        sessions: SessionStoreState,
    ) -> Self {
        Self {
            users,
            sessions: SessionManager::new(sessions, config.device_limits),
            routes: Arc::new(RouteCache::new(catalog)),
            tokens: TokenService::from_config(&config),
            policy: AccessPolicy::from_config(&config),
            config,
        }
    }

    /// State backed entirely by one in-process `MemoryStore`.
    pub fn in_memory(config: AppConfig, store: Arc<MemoryStore>) -> Self {
        Self::new(config, store.clone(), store.clone(), store)
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for SessionManager {
    fn from_ref(app_state: &AppState) -> SessionManager {
        app_state.sessions.clone()
    }
}

impl FromRef<AppState> for Arc<RouteCache> {
    fn from_ref(app_state: &AppState) -> Arc<RouteCache> {
        app_state.routes.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// create_router
///
/// Assembles every route under `/api`, runs `auth_middleware` in front of all of
/// them (including the fallback), and wraps the whole service in the request-id,
/// tracing and CORS layers.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let x_request_id = HeaderName::from_static("x-request-id");

    let api = Router::new()
        .merge(public::public_routes())
        .merge(authenticated::authenticated_routes())
        .merge(admin::admin_routes());

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api)
        .fallback(handlers::not_found)
        // Every request passes the access policy; non-API paths are let through there.
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware))
        .with_state(state);

    base_router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// trace_span_logger
///
/// Span for one HTTP request, correlated by its `x-request-id`. Only the path is
/// recorded, never the query string.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        path = %request.uri().path(),
        req_id = %request_id,
    )
}
