use crate::{
    AppState,
    auth::{AdminSession, GallerySession},
    errors::{AccessError, ErrorBody, with_timeout},
    guest_limits::GuestAction,
    models::{
        AdminProfile, BlockIpRequest, BlocklistUpdate, GallerySessionSummary, GateStats,
        GuestActionResponse, PermissionRefreshResponse, RevokeSessionsRequest,
    },
    rbac::{CacheMode, permissions},
};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use std::{
    net::IpAddr,
    path::{Component, Path as FsPath},
};
use uuid::Uuid;

// --- Admin Handlers ---

/// get_me
///
/// [Admin Route] Returns the identity the presented admin token resolves to.
#[utoipa::path(
    get,
    path = "/admin/me",
    responses(
        (status = 200, description = "Resolved administrator", body = AdminProfile),
        (status = 401, description = "Missing, invalid, revoked or idle session", body = ErrorBody)
    )
)]
pub async fn get_me(session: AdminSession) -> Json<AdminProfile> {
    Json(AdminProfile {
        id: session.id,
        role: session.role,
        degraded: session.degraded,
    })
}

/// get_security_stats
///
/// [Admin Route] Snapshot of the media gatekeeper. Requires `security.view`.
#[utoipa::path(
    get,
    path = "/admin/security/stats",
    responses(
        (status = 200, description = "Gate statistics", body = GateStats),
        (status = 403, description = "Permission denied", body = ErrorBody)
    )
)]
pub async fn get_security_stats(
    session: AdminSession,
    State(state): State<AppState>,
) -> Result<Json<GateStats>, AccessError> {
    state
        .permissions
        .require_permission(&session.email, &session.role, permissions::SECURITY_VIEW)
        .await?;
    Ok(Json(state.media.stats().await))
}

/// block_ip
///
/// [Admin Route] Puts an IP address on the media blocklist. Requires `security.manage`.
#[utoipa::path(
    post,
    path = "/admin/security/blocklist",
    request_body = BlockIpRequest,
    responses(
        (status = 201, description = "IP blocked"),
        (status = 200, description = "IP was already blocked"),
        (status = 422, description = "Not an IP address"),
        (status = 403, description = "Permission denied", body = ErrorBody)
    )
)]
pub async fn block_ip(
    session: AdminSession,
    State(state): State<AppState>,
    Json(payload): Json<BlockIpRequest>,
) -> Result<StatusCode, AccessError> {
    state
        .permissions
        .require_permission(&session.email, &session.role, permissions::SECURITY_MANAGE)
        .await?;
    let Ok(ip) = payload.ip.trim().parse::<IpAddr>() else {
        return Ok(StatusCode::UNPROCESSABLE_ENTITY);
    };
    if state.media.block_ip(ip).await {
        tracing::info!(admin = %session.email, %ip, "ip added to media blocklist");
        Ok(StatusCode::CREATED)
    } else {
        Ok(StatusCode::OK)
    }
}

/// clear_blocklist
///
/// [Admin Route] Empties the media blocklists. Requires `security.manage`.
#[utoipa::path(
    delete,
    path = "/admin/security/blocklist",
    responses(
        (status = 200, description = "Blocklist cleared", body = BlocklistUpdate),
        (status = 403, description = "Permission denied", body = ErrorBody)
    )
)]
pub async fn clear_blocklist(
    session: AdminSession,
    State(state): State<AppState>,
) -> Result<Json<BlocklistUpdate>, AccessError> {
    state
        .permissions
        .require_permission(&session.email, &session.role, permissions::SECURITY_MANAGE)
        .await?;
    let removed = state.media.clear_blocklist().await;
    tracing::info!(admin = %session.email, removed, "media blocklist cleared by admin");
    Ok(Json(BlocklistUpdate { removed }))
}

/// unblock_entry
///
/// [Admin Route] Removes one fingerprint or IP from the media blocklist.
#[utoipa::path(
    delete,
    path = "/admin/security/blocklist/{key}",
    params(("key" = String, Path, description = "Fingerprint or IP address")),
    responses(
        (status = 200, description = "Entry removed", body = BlocklistUpdate),
        (status = 404, description = "Not blocked")
    )
)]
pub async fn unblock_entry(
    session: AdminSession,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AccessError> {
    state
        .permissions
        .require_permission(&session.email, &session.role, permissions::SECURITY_MANAGE)
        .await?;
    if state.media.unblock(&key).await {
        Ok(Json(BlocklistUpdate { removed: 1 }).into_response())
    } else {
        Ok(StatusCode::NOT_FOUND.into_response())
    }
}

/// refresh_permissions
///
/// [Admin Route] Drops the role mapping and reloads it immediately. Requires `roles.manage`.
#[utoipa::path(
    post,
    path = "/admin/permissions/refresh",
    responses(
        (status = 200, description = "Mapping reloaded", body = PermissionRefreshResponse),
        (status = 403, description = "Permission denied", body = ErrorBody)
    )
)]
pub async fn refresh_permissions(
    session: AdminSession,
    State(state): State<AppState>,
) -> Result<Json<PermissionRefreshResponse>, AccessError> {
    state
        .permissions
        .require_permission(&session.email, &session.role, permissions::ROLES_MANAGE)
        .await?;

    state.permissions.clear().await;
    let mode = state.permissions.refresh().await;
    let roles = state.permissions.snapshot().await.len();
    Ok(Json(PermissionRefreshResponse {
        roles,
        degraded: mode == CacheMode::Degraded,
    }))
}

/// revoke_sessions
///
/// [Admin Route] Revokes one session id or every session of a subject. Requires
/// `sessions.revoke`.
#[utoipa::path(
    post,
    path = "/admin/sessions/revoke",
    request_body = RevokeSessionsRequest,
    responses(
        (status = 204, description = "Revoked"),
        (status = 422, description = "Neither session_id nor subject given"),
        (status = 403, description = "Permission denied", body = ErrorBody)
    )
)]
pub async fn revoke_sessions(
    session: AdminSession,
    State(state): State<AppState>,
    Json(payload): Json<RevokeSessionsRequest>,
) -> Result<StatusCode, AccessError> {
    state
        .permissions
        .require_permission(&session.email, &session.role, permissions::SESSIONS_REVOKE)
        .await?;

    // Oversized retention settings mean "forever".
    let revoked_until = chrono::Duration::from_std(state.config.revocation_retention)
        .ok()
        .and_then(|retention| Utc::now().checked_add_signed(retention))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    match (payload.session_id, payload.subject) {
        (None, None) => Ok(StatusCode::UNPROCESSABLE_ENTITY),
        (session_id, subject) => {
            if let Some(session_id) = session_id {
                state
                    .gateway
                    .revoke_session(&session_id, revoked_until, &session.email)
                    .await;
            }
            if let Some(subject) = subject {
                state.gateway.revoke_subject(&subject, &session.email).await;
            }
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

// --- Gallery Handlers ---

/// get_gallery_session
///
/// [Gallery Route] Describes the gallery the presented token opens.
#[utoipa::path(
    get,
    path = "/gallery/{slug}/session",
    params(("slug" = String, Path, description = "Gallery slug")),
    responses(
        (status = 200, description = "Gallery session", body = GallerySessionSummary),
        (status = 404, description = "Gallery not found or expired", body = ErrorBody)
    )
)]
pub async fn get_gallery_session(session: GallerySession) -> Json<GallerySessionSummary> {
    let event = session.event;
    Json(GallerySessionSummary {
        event_id: event.id,
        slug: event.slug,
        name: event.name,
        expires_at: event.expires_at,
        password_required: event.password_required,
    })
}

/// get_photo
///
/// [Gallery Route] Serves one protected photo. The media gate runs as route middleware before
/// this handler and stamps the no-cache policy on the response.
#[utoipa::path(
    get,
    path = "/gallery/{slug}/photos/{photo_id}",
    params(
        ("slug" = String, Path, description = "Gallery slug"),
        ("photo_id" = Uuid, Path, description = "Photo id")
    ),
    responses(
        (status = 200, description = "Photo bytes"),
        (status = 403, description = "Blocked or rejected", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    )
)]
pub async fn get_photo(
    session: GallerySession,
    State(state): State<AppState>,
    Path((_slug, photo_id)): Path<(String, Uuid)>,
) -> Result<Response, AccessError> {
    let photo = with_timeout(
        state.config.store_timeout,
        state.repo.get_photo(session.event.id, photo_id),
    )
    .await
    .map_err(|e| {
        tracing::warn!(%photo_id, error = %e, "photo lookup failed");
        AccessError::Unavailable
    })?
    .ok_or(AccessError::ResourceNotFoundOrExpired)?;

    let relative = FsPath::new(&photo.file_path);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        tracing::error!(%photo_id, path = %photo.file_path, "refusing photo path outside media root");
        return Err(AccessError::Internal);
    }

    let bytes = tokio::fs::read(state.config.media_root.join(relative))
        .await
        .map_err(|e| {
            tracing::error!(%photo_id, error = %e, "photo file unreadable");
            AccessError::ResourceNotFoundOrExpired
        })?;

    let content_type = HeaderValue::from_str(&photo.mime_type)
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

/// like_photo
///
/// [Gallery Route] Records a guest like. Limited per guest and event; only likes that were
/// actually stored count against the ceiling.
#[utoipa::path(
    post,
    path = "/gallery/{slug}/photos/{photo_id}/like",
    params(
        ("slug" = String, Path, description = "Gallery slug"),
        ("photo_id" = Uuid, Path, description = "Photo id")
    ),
    responses(
        (status = 200, description = "Like stored", body = GuestActionResponse),
        (status = 429, description = "Guest limit reached", body = ErrorBody)
    )
)]
pub async fn like_photo(
    session: GallerySession,
    State(state): State<AppState>,
    Path((_slug, photo_id)): Path<(String, Uuid)>,
) -> Response {
    let event_id = session.event.id;
    state
        .guest_limits
        .run_limited(&session.guest, event_id, GuestAction::Like, |quota| {
            store_like(&state, event_id, photo_id, &session.guest, quota.remaining)
        })
        .await
}

async fn store_like(
    state: &AppState,
    event_id: Uuid,
    photo_id: Uuid,
    guest: &str,
    remaining: u32,
) -> Result<Json<GuestActionResponse>, AccessError> {
    let timeout = state.config.store_timeout;
    with_timeout(timeout, state.repo.get_photo(event_id, photo_id))
        .await
        .map_err(|_| AccessError::Unavailable)?
        .ok_or(AccessError::ResourceNotFoundOrExpired)?;

    let recorded = with_timeout(timeout, state.repo.add_photo_like(photo_id, guest))
        .await
        .map_err(|e| {
            tracing::warn!(%photo_id, error = %e, "failed to store like");
            AccessError::Unavailable
        })?;
    Ok(Json(GuestActionResponse {
        recorded,
        remaining,
    }))
}
