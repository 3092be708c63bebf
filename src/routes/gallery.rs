use crate::{AppState, auth::require_gallery_session, handlers, media_guard::secure_image_access};
use axum::{
    Router, middleware,
    routing::{get, post},
};

/// Gallery Router Module
///
/// Nested under `/gallery`. Layer order matters on the media route: the session check wraps the
/// gate, so anonymous requests are turned away before they count against media limits.
pub fn gallery_routes(state: AppState) -> Router<AppState> {
    let media = Router::new()
        // GET /gallery/{slug}/photos/{photo_id}
        .route("/{slug}/photos/{photo_id}", get(handlers::get_photo))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            secure_image_access,
        ));

    Router::new()
        // GET /gallery/{slug}/session
        .route("/{slug}/session", get(handlers::get_gallery_session))
        // POST /gallery/{slug}/photos/{photo_id}/like (guest action limit)
        .route("/{slug}/photos/{photo_id}/like", post(handlers::like_photo))
        .merge(media)
        .route_layer(middleware::from_fn_with_state(state, require_gallery_session))
}
