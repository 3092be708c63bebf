use super::{
    claims::SessionClaims,
    revocation::{CutoffReason, RevocationRegistry},
};
use crate::{
    audit::{AuditLog, SecurityEvent, SecurityEventKind},
    errors::{AccessError, StoreError, with_timeout},
    models::EventRecord,
    rbac::SUPER_ADMIN_ROLE,
    repository::RepositoryState,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};
use uuid::Uuid;

/// How long a last-known-good admin lookup may stand in for an unreachable store.
const ADMIN_FALLBACK_TTL: Duration = Duration::from_secs(300);

/// AdminIdentity
///
/// The administrator an admin token resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminIdentity {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    /// Set when the role was assumed because the RBAC schema is missing.
    pub degraded: bool,
    pub password_changed_at: Option<DateTime<Utc>>,
}

/// IdentityResolver
///
/// Loads the account or event a verified token points at and enforces the liveness rules:
/// active accounts only, no tokens older than the last password change, and galleries only while
/// active, unarchived and unexpired.
#[derive(Clone)]
pub struct IdentityResolver {
    repo: RepositoryState,
    registry: RevocationRegistry,
    audit: AuditLog,
    store_timeout: Duration,
    last_known: Arc<RwLock<HashMap<Uuid, (AdminIdentity, Instant)>>>,
}

impl IdentityResolver {
    pub fn new(
        repo: RepositoryState,
        registry: RevocationRegistry,
        audit: AuditLog,
        store_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            registry,
            audit,
            store_timeout,
            last_known: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn resolve_admin(&self, claims: &SessionClaims) -> Result<AdminIdentity, AccessError> {
        let id = Uuid::parse_str(&claims.sub).map_err(|_| AccessError::TokenInvalid)?;

        let identity = match self.load_admin(id).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                self.last_known.write().await.remove(&id);
                return Err(AccessError::AccountInactive);
            }
            Err(e) => {
                tracing::warn!(admin_id = %id, error = %e, "admin lookup failed, trying last known account");
                self.cached_admin(id).await.ok_or(AccessError::Unavailable)?
            }
        };

        if let Some(changed_at) = identity.password_changed_at {
            if claims.issued_before(changed_at) {
                self.registry
                    .revoke_subject_before(&claims.sub, changed_at, CutoffReason::PasswordChanged)
                    .await;
                return Err(AccessError::PasswordChangedSinceIssue);
            }
        }

        self.last_known
            .write()
            .await
            .insert(id, (identity.clone(), Instant::now()));
        Ok(identity)
    }

    /// Role-joined lookup, degrading to a basic lookup with an assumed `super_admin` role while
    /// the RBAC schema is absent.
    async fn load_admin(&self, id: Uuid) -> Result<Option<AdminIdentity>, StoreError> {
        match with_timeout(self.store_timeout, self.repo.get_admin_with_role(id)).await {
            Ok(account) => Ok(account.map(|a| AdminIdentity {
                id: a.id,
                email: a.email,
                role: a.role,
                degraded: false,
                password_changed_at: a.password_changed_at,
            })),
            Err(StoreError::SchemaMissing(detail)) => {
                tracing::warn!(
                    admin_id = %id,
                    %detail,
                    mode = "degraded",
                    "RBAC schema missing, resolving admin with assumed {SUPER_ADMIN_ROLE} role"
                );
                let account =
                    with_timeout(self.store_timeout, self.repo.get_admin_basic(id)).await?;
                if account.is_some() {
                    self.audit.emit(
                        SecurityEvent::new(SecurityEventKind::DegradedAccess)
                            .detail(format!("admin {id} resolved without role data")),
                    );
                }
                Ok(account.map(|a| AdminIdentity {
                    id: a.id,
                    email: a.email,
                    role: SUPER_ADMIN_ROLE.to_string(),
                    degraded: true,
                    password_changed_at: a.password_changed_at,
                }))
            }
            Err(e) => Err(e),
        }
    }

    async fn cached_admin(&self, id: Uuid) -> Option<AdminIdentity> {
        let cache = self.last_known.read().await;
        cache
            .get(&id)
            .filter(|(_, at)| at.elapsed() < ADMIN_FALLBACK_TTL)
            .map(|(identity, _)| identity.clone())
    }

    /// Loads the gallery a token opens. When the request names a slug, the event behind it must
    /// be the one embedded in the token.
    pub async fn resolve_gallery(
        &self,
        claims: &SessionClaims,
        slug: Option<&str>,
    ) -> Result<EventRecord, AccessError> {
        let event_id = claims.event_id.ok_or(AccessError::TokenInvalid)?;

        let lookup = match slug {
            Some(slug) => with_timeout(self.store_timeout, self.repo.get_event_by_slug(slug)).await,
            None => with_timeout(self.store_timeout, self.repo.get_event(event_id)).await,
        };

        let event = match lookup {
            Ok(Some(event)) => event,
            Ok(None) => return Err(AccessError::ResourceNotFoundOrExpired),
            Err(e) => {
                tracing::warn!(%event_id, error = %e, "event lookup failed");
                return Err(AccessError::Unavailable);
            }
        };

        if event.id != event_id {
            tracing::debug!(%event_id, slug = ?slug, "gallery token used against another event");
            return Err(AccessError::ResourceNotFoundOrExpired);
        }
        if !event.is_accessible_at(Utc::now()) {
            return Err(AccessError::ResourceNotFoundOrExpired);
        }
        Ok(event)
    }
}
