use crate::{AppState, auth::require_admin_session, handlers};
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

/// Admin Router Module
///
/// Nested under `/admin`. The whole router sits behind `require_admin_session`, which verifies
/// the token, the account and the idle timeout. Each handler then checks its own permission.
pub fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // GET /admin/me
        .route("/me", get(handlers::get_me))
        // GET /admin/security/stats (security.view)
        .route("/security/stats", get(handlers::get_security_stats))
        // POST, DELETE /admin/security/blocklist (security.manage)
        .route(
            "/security/blocklist",
            post(handlers::block_ip).delete(handlers::clear_blocklist),
        )
        // DELETE /admin/security/blocklist/{key} (security.manage)
        .route("/security/blocklist/{key}", delete(handlers::unblock_entry))
        // POST /admin/permissions/refresh (roles.manage)
        .route("/permissions/refresh", post(handlers::refresh_permissions))
        // POST /admin/sessions/revoke (sessions.revoke)
        .route("/sessions/revoke", post(handlers::revoke_sessions))
        .route_layer(middleware::from_fn_with_state(state, require_admin_session))
}
