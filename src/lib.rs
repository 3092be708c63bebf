use axum::{Router, extract::FromRef, http::HeaderName};
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

// Gateway components, leaves first.
pub mod config;
pub mod errors;
pub mod models;
pub mod repository;
pub mod audit;
pub mod sweep;
pub mod settings;
pub mod auth;
pub mod rbac;
pub mod session_tracker;
pub mod media_guard;
pub mod guest_limits;

// HTTP surface.
pub mod handlers;
pub mod routes;
use routes::{admin, gallery, public};

// --- Public Re-exports ---

pub use auth::{AdminSession, GallerySession, Gateway};
pub use config::AppConfig;
pub use errors::{AccessError, StoreError};
pub use guest_limits::GuestActionLimiter;
pub use media_guard::MediaGatekeeper;
pub use rbac::PermissionCache;
pub use repository::{PostgresRepository, RepositoryState};

use audit::AuditLog;
use auth::{IdentityResolver, RevocationRegistry, TokenVerifier};
use session_tracker::SessionActivityTracker;
use settings::SettingsCache;
use sweep::SweepHandle;

/// ApiDoc
///
/// Auto-generated OpenAPI document for the gateway's own endpoints, served at
/// `/api-docs/openapi.json` and browsable under `/swagger-ui`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::get_me, handlers::get_security_stats, handlers::block_ip,
        handlers::clear_blocklist, handlers::unblock_entry, handlers::refresh_permissions, handlers::revoke_sessions,
        handlers::get_gallery_session, handlers::get_photo, handlers::like_photo
    ),
    components(
        schemas(
            models::AdminProfile, models::GallerySessionSummary, models::GateStats,
            models::RevokeSessionsRequest, models::PermissionRefreshResponse,
            models::GuestActionResponse, models::BlocklistUpdate, models::BlockIpRequest,
            errors::ErrorBody,
        )
    ),
    tags(
        (name = "gallery-gate", description = "Admin and gallery access-control gateway")
    )
)]
struct ApiDoc;

/// AppState
///
/// Every gateway service, built once at startup and shared by all requests. Each cache is an
/// injectable, clearable service rather than a process-wide singleton, so tests build as many
/// independent states as they need.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub repo: RepositoryState,
    pub audit: AuditLog,
    pub gateway: Gateway,
    pub permissions: PermissionCache,
    pub settings: SettingsCache,
    pub media: MediaGatekeeper,
    pub guest_limits: GuestActionLimiter,
}

impl AppState {
    /// Wires every component over one repository.
    pub fn new(config: AppConfig, repo: RepositoryState) -> Self {
        let audit = AuditLog::new(repo.clone(), config.store_timeout);
        let settings = SettingsCache::new(
            repo.clone(),
            config.settings_cache_ttl,
            config.store_timeout,
        );
        let registry = RevocationRegistry::new();
        let resolver = IdentityResolver::new(
            repo.clone(),
            registry.clone(),
            audit.clone(),
            config.store_timeout,
        );
        let tracker = SessionActivityTracker::new(
            settings.clone(),
            config.default_idle_timeout,
            config.session_max_idle,
        );
        let gateway = Gateway::new(
            TokenVerifier::new(&config.jwt_secret, config.jwt_issuer.clone()),
            registry,
            resolver,
            tracker,
            audit.clone(),
        );
        let permissions = PermissionCache::new(
            repo.clone(),
            audit.clone(),
            config.permission_cache_ttl,
            config.store_timeout,
        );
        let media = MediaGatekeeper::new(config.media.clone(), audit.clone());
        let guest_limits =
            GuestActionLimiter::new(repo.clone(), settings.clone(), config.store_timeout);

        Self {
            config,
            repo,
            audit,
            gateway,
            permissions,
            settings,
            media,
            guest_limits,
        }
    }

    /// Starts every periodic cleanup. The tasks stop when the returned handles are dropped.
    pub fn spawn_sweeps(&self) -> Vec<SweepHandle> {
        let period = self.config.sweep_interval;
        vec![
            self.gateway.spawn_session_sweeper(period),
            self.gateway.spawn_revocation_purger(period),
            self.media.spawn_pruner(period),
        ]
    }
}

// --- Axum FromRef Extractor Implementations ---

// Handlers and extractors pull only the component they need out of AppState.

impl FromRef<AppState> for RepositoryState {
    fn from_ref(app_state: &AppState) -> RepositoryState {
        app_state.repo.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

impl FromRef<AppState> for Gateway {
    fn from_ref(app_state: &AppState) -> Gateway {
        app_state.gateway.clone()
    }
}

impl FromRef<AppState> for PermissionCache {
    fn from_ref(app_state: &AppState) -> PermissionCache {
        app_state.permissions.clone()
    }
}

impl FromRef<AppState> for MediaGatekeeper {
    fn from_ref(app_state: &AppState) -> MediaGatekeeper {
        app_state.media.clone()
    }
}

impl FromRef<AppState> for GuestActionLimiter {
    fn from_ref(app_state: &AppState) -> GuestActionLimiter {
        app_state.guest_limits.clone()
    }
}

/// create_router
///
/// Assembles the routing structure, applies the access-control layers per router group and
/// the observability layers globally.
pub fn create_router(state: AppState) -> Router {
    // 1. CORS Configuration
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    // Header name constant for Request Correlation.
    let x_request_id = HeaderName::from_static("x-request-id");

    // 2. Base Router Assembly
    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public::public_routes())
        // Admin sessions, then per-handler permission checks.
        .nest("/admin", admin::admin_routes(state.clone()))
        // Gallery sessions, plus the media gate on photo fetches.
        .nest("/gallery", gallery::gallery_routes(state.clone()))
        .with_state(state);

    // 3. Observability and Correlation Layers
    base_router
        .layer(
            ServiceBuilder::new()
                // 3a. Request ID Generation
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                // 3b. Request Tracing, correlated by the request id
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                // 3c. Request ID Propagation back to the client
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        // 4. CORS Layer
        .layer(cors)
}

/// trace_span_logger
///
/// Builds the per-request span with method, path and `x-request-id`. The query string is left
/// out because gallery tokens may travel in it.
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
