use crate::AppState;
use axum::{Router, routing::get};

/// Public Router Module
///
/// Endpoints reachable without any session.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Load balancer probe. Touches no store so it stays green while the database is down.
        .route("/health", get(|| async { "ok" }))
}
