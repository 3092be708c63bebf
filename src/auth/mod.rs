pub mod claims;
pub mod identity;
pub mod revocation;
pub mod verifier;

pub use claims::{Audience, SessionClaims};
pub use identity::{AdminIdentity, IdentityResolver};
pub use revocation::{CutoffReason, RevocationRegistry};
pub use verifier::{TokenVerifier, VerifyFailure};

use crate::{
    audit::{AuditLog, SecurityEvent, SecurityEventKind},
    errors::AccessError,
    models::EventRecord,
    session_tracker::SessionActivityTracker,
    sweep::{SweepHandle, spawn_sweep},
};
use axum::{
    extract::{FromRef, FromRequestParts, Path, Query, Request},
    http::{HeaderMap, header, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, time::Duration};
use uuid::Uuid;

/// Header carrying a gallery token for clients that cannot set `Authorization` (e.g. `<img>`
/// requests proxied by the gallery frontend).
pub const GALLERY_TOKEN_HEADER: &str = "x-gallery-token";
const GALLERY_TOKEN_QUERY: &str = "token";

/// AdminSession
///
/// The resolved identity of an authenticated admin request. Usable as a handler argument: if any
/// step of verification fails the request is rejected with the matching `AccessError` before the
/// handler runs.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    /// The role was assumed because role data is unavailable.
    pub degraded: bool,
    pub claims: SessionClaims,
    pub session_key: String,
}

/// GallerySession
///
/// A guest holding a valid token for a live gallery.
#[derive(Debug, Clone)]
pub struct GallerySession {
    /// Guest identity (the token subject). Keys guest action limits.
    pub guest: String,
    pub event: EventRecord,
    pub claims: SessionClaims,
}

/// Gateway
///
/// Verifier, revocation registry, identity resolver and activity tracker composed into the two
/// authentication entry points.
#[derive(Clone)]
pub struct Gateway {
    verifier: TokenVerifier,
    registry: RevocationRegistry,
    resolver: IdentityResolver,
    tracker: SessionActivityTracker,
    audit: AuditLog,
}

impl Gateway {
    pub fn new(
        verifier: TokenVerifier,
        registry: RevocationRegistry,
        resolver: IdentityResolver,
        tracker: SessionActivityTracker,
        audit: AuditLog,
    ) -> Self {
        Self {
            verifier,
            registry,
            resolver,
            tracker,
            audit,
        }
    }

    pub fn tracker(&self) -> &SessionActivityTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &RevocationRegistry {
        &self.registry
    }

    /// authenticate_admin
    ///
    /// 1. signature, expiry, audience (strict then legacy issuer stage)
    /// 2. revocation registry
    /// 3. account lookup and password-change check
    /// 4. idle timeout; a timed-out session is revoked until its token expires
    pub async fn authenticate_admin(&self, token: &str) -> Result<AdminSession, AccessError> {
        let result = self.admin_inner(token).await;
        if let Err(denied) = &result {
            tracing::warn!(code = denied.code(), audience = "admin", "authentication denied");
        }
        result
    }

    async fn admin_inner(&self, token: &str) -> Result<AdminSession, AccessError> {
        let claims = self.verifier.verify(token, Audience::Admin)?;
        let session_key = claims.session_key(token);
        self.registry.check(&claims, &session_key).await?;

        let identity = self.resolver.resolve_admin(&claims).await?;

        let expires_at = claims.expires_at();
        if let Err(timed_out) = self
            .tracker
            .touch(&session_key, &claims.sub, expires_at)
            .await
        {
            if let Some(expires_at) = expires_at {
                self.registry.revoke_session(&session_key, expires_at).await;
            }
            return Err(timed_out);
        }

        Ok(AdminSession {
            id: identity.id,
            email: identity.email,
            role: identity.role,
            degraded: identity.degraded,
            claims,
            session_key,
        })
    }

    /// Verifies a gallery token and loads its event. `slug`, when the route names one, must
    /// resolve to the event embedded in the token.
    pub async fn authenticate_gallery(
        &self,
        token: &str,
        slug: Option<&str>,
    ) -> Result<GallerySession, AccessError> {
        let result = self.gallery_inner(token, slug).await;
        if let Err(denied) = &result {
            tracing::warn!(code = denied.code(), audience = "gallery", slug = ?slug, "authentication denied");
        }
        result
    }

    async fn gallery_inner(
        &self,
        token: &str,
        slug: Option<&str>,
    ) -> Result<GallerySession, AccessError> {
        let claims = self.verifier.verify(token, Audience::Gallery)?;
        let session_key = claims.session_key(token);
        self.registry.check(&claims, &session_key).await?;

        let event = self.resolver.resolve_gallery(&claims, slug).await?;
        Ok(GallerySession {
            guest: claims.sub.clone(),
            event,
            claims,
        })
    }

    /// Revokes one session until `expires_at` and forgets its activity.
    pub async fn revoke_session(&self, session_id: &str, expires_at: DateTime<Utc>, by: &str) {
        let key = SessionClaims::key_for_sid(session_id);
        self.registry.revoke_session(&key, expires_at).await;
        self.tracker.end_session(&key).await;
        self.audit.emit(
            SecurityEvent::new(SecurityEventKind::SessionRevoked)
                .detail(format!("session {session_id} revoked by {by}")),
        );
    }

    /// Invalidates every token of `subject` issued up to now.
    pub async fn revoke_subject(&self, subject: &str, by: &str) {
        // Tokens issued in the current second are revoked too.
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        self.registry
            .revoke_subject_before(subject, cutoff, CutoffReason::Explicit)
            .await;
        self.audit.emit(
            SecurityEvent::new(SecurityEventKind::SessionRevoked)
                .detail(format!("all sessions of {subject} revoked by {by}")),
        );
    }

    /// Periodically drops idle admin sessions. Each one still holding an unexpired token is
    /// revoked until that expiry, so it cannot come back as a first sighting.
    pub fn spawn_session_sweeper(&self, period: Duration) -> SweepHandle {
        let tracker = self.tracker.clone();
        let registry = self.registry.clone();
        spawn_sweep("session-activity", period, move || {
            let tracker = tracker.clone();
            let registry = registry.clone();
            async move {
                let swept = tracker.sweep().await;
                if swept.is_empty() {
                    return;
                }
                let now = Utc::now();
                for session in &swept {
                    if let Some(expires_at) = session.expires_at.filter(|exp| *exp > now) {
                        registry.revoke_session(&session.session_key, expires_at).await;
                    }
                }
                tracing::debug!(removed = swept.len(), "swept idle admin sessions");
            }
        })
    }

    /// Periodically drops revoked session ids whose tokens expired anyway.
    pub fn spawn_revocation_purger(&self, period: Duration) -> SweepHandle {
        let registry = self.registry.clone();
        spawn_sweep("revocation-purge", period, move || {
            let registry = registry.clone();
            async move {
                let purged = registry.purge_expired(Utc::now()).await;
                if purged > 0 {
                    tracing::debug!(purged, "purged expired revocations");
                }
            }
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Gallery tokens: `Authorization: Bearer`, then the gallery token header, then `?token=`.
fn gallery_token(parts: &Parts) -> Option<String> {
    if let Some(token) = bearer_token(&parts.headers) {
        return Some(token.to_string());
    }
    if let Some(token) = parts
        .headers
        .get(GALLERY_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }
    Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(mut params)| params.remove(GALLERY_TOKEN_QUERY))
        .filter(|token| !token.is_empty())
}

impl<S> FromRequestParts<S> for AdminSession
where
    S: Send + Sync,
    Gateway: FromRef<S>,
{
    type Rejection = AccessError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(session) = parts.extensions.get::<AdminSession>() {
            return Ok(session.clone());
        }
        // Admin tokens are only ever accepted from the Authorization header.
        let token = bearer_token(&parts.headers).ok_or(AccessError::AuthenticationMissing)?;
        let gateway = Gateway::from_ref(state);
        gateway.authenticate_admin(token).await
    }
}

impl<S> FromRequestParts<S> for GallerySession
where
    S: Send + Sync,
    Gateway: FromRef<S>,
{
    type Rejection = AccessError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(session) = parts.extensions.get::<GallerySession>() {
            return Ok(session.clone());
        }
        let token = gallery_token(parts).ok_or(AccessError::AuthenticationMissing)?;
        let slug = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .ok()
            .and_then(|Path(mut params)| params.remove("slug"));

        let gateway = Gateway::from_ref(state);
        gateway.authenticate_gallery(&token, slug.as_deref()).await
    }
}

/// require_admin_session
///
/// Route middleware for the admin router. Rejects before routing reaches a handler and leaves
/// the resolved session in the request extensions, where the `AdminSession` extractor picks it
/// up without verifying the token twice.
pub async fn require_admin_session(
    session: AdminSession,
    mut request: Request,
    next: Next,
) -> Response {
    request.extensions_mut().insert(session);
    next.run(request).await
}

/// require_gallery_session
///
/// Same as `require_admin_session` for gallery routes. Placed outside the media gate so only
/// authenticated guests are counted against media limits.
pub async fn require_gallery_session(
    session: GallerySession,
    mut request: Request,
    next: Next,
) -> Response {
    request.extensions_mut().insert(session);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request};

    fn parts(uri: &str, headers: &[(&'static str, &'static str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, HeaderValue::from_static(value));
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn gallery_token_sources_in_order() {
        let p = parts(
            "/gallery/x?token=from-query",
            &[("authorization", "Bearer from-bearer"), (GALLERY_TOKEN_HEADER, "from-header")],
        );
        assert_eq!(gallery_token(&p).as_deref(), Some("from-bearer"));

        let p = parts("/gallery/x?token=from-query", &[(GALLERY_TOKEN_HEADER, "from-header")]);
        assert_eq!(gallery_token(&p).as_deref(), Some("from-header"));

        let p = parts("/gallery/x?token=from-query", &[]);
        assert_eq!(gallery_token(&p).as_deref(), Some("from-query"));

        assert_eq!(gallery_token(&parts("/gallery/x", &[])), None);
    }

    #[test]
    fn bearer_requires_scheme_and_value() {
        let p = parts("/", &[("authorization", "Basic abc")]);
        assert_eq!(bearer_token(&p.headers), None);
        let p = parts("/", &[("authorization", "Bearer ")]);
        assert_eq!(bearer_token(&p.headers), None);
    }
}
