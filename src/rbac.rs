//! Role-based permission cache.
//!
//! Roles map to permission names loaded from the permission store. The mapping is refreshed at
//! most once per TTL. While the RBAC schema is missing (upgrade window) the cache installs a
//! full-access grant for `super_admin` and tags every answer it gives from that grant as
//! `PermissionGrant::Degraded`, so the fallback can never be mistaken for a real grant.

use crate::{
    audit::{AuditLog, SecurityEvent, SecurityEventKind},
    errors::{AccessError, StoreError, with_timeout},
    repository::RepositoryState,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};

/// The most privileged role; the only role granted access in degraded mode.
pub const SUPER_ADMIN_ROLE: &str = "super_admin";

/// Permission names guarded by the gateway's own endpoints and by collaborators.
pub mod permissions {
    pub const USERS_VIEW: &str = "users.view";
    pub const USERS_DELETE: &str = "users.delete";
    pub const EVENTS_MANAGE: &str = "events.manage";
    pub const ROLES_MANAGE: &str = "roles.manage";
    pub const SESSIONS_REVOKE: &str = "sessions.revoke";
    pub const SECURITY_VIEW: &str = "security.view";
    pub const SECURITY_MANAGE: &str = "security.manage";
}

/// Pause before a cold cache asks the store again after a failed load.
const COLD_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Grants every permission when present in a role's set.
const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionGrant {
    Granted,
    /// Granted only because role data is unavailable.
    Degraded,
    Denied,
}

impl PermissionGrant {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, PermissionGrant::Denied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Normal,
    Degraded,
}

#[derive(Debug)]
struct CacheState {
    roles: HashMap<String, HashSet<String>>,
    mode: CacheMode,
    loaded_at: Option<Instant>,
    /// Set after a failed load with nothing cached; no reload is attempted before it.
    retry_at: Option<Instant>,
}

/// PermissionCache
#[derive(Clone)]
pub struct PermissionCache {
    repo: RepositoryState,
    audit: AuditLog,
    ttl: Duration,
    timeout: Duration,
    state: Arc<RwLock<CacheState>>,
    refreshing: Arc<Mutex<()>>,
}

impl PermissionCache {
    pub fn new(repo: RepositoryState, audit: AuditLog, ttl: Duration, timeout: Duration) -> Self {
        Self {
            repo,
            audit,
            ttl,
            timeout,
            state: Arc::new(RwLock::new(CacheState {
                roles: HashMap::new(),
                mode: CacheMode::Normal,
                loaded_at: None,
                retry_at: None,
            })),
            refreshing: Arc::new(Mutex::new(())),
        }
    }

    async fn needs_refresh(&self) -> bool {
        let state = self.state.read().await;
        let now = Instant::now();
        if state.retry_at.is_some_and(|at| now < at) {
            return false;
        }
        state
            .loaded_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.ttl)
    }

    async fn ensure_fresh(&self) {
        if !self.needs_refresh().await {
            return;
        }
        // One caller reloads; concurrent callers wait and then reuse its result.
        let _reload = self.refreshing.lock().await;
        if self.needs_refresh().await {
            self.refresh().await;
        }
    }

    /// Reloads the mapping from the store and returns the resulting mode.
    pub async fn refresh(&self) -> CacheMode {
        let loaded = with_timeout(self.timeout, self.repo.list_role_permissions()).await;
        let mut state = self.state.write().await;

        match loaded {
            Ok(rows) => {
                let mut roles: HashMap<String, HashSet<String>> = HashMap::new();
                for row in rows {
                    roles.entry(row.role).or_default().insert(row.permission);
                }
                tracing::debug!(roles = roles.len(), "permission cache refreshed");
                state.roles = roles;
                state.mode = CacheMode::Normal;
                state.loaded_at = Some(Instant::now());
                state.retry_at = None;
            }
            Err(StoreError::SchemaMissing(detail)) => {
                tracing::warn!(
                    %detail,
                    mode = "degraded",
                    "RBAC schema missing, granting full access to {SUPER_ADMIN_ROLE} only"
                );
                state.roles = HashMap::from([(
                    SUPER_ADMIN_ROLE.to_string(),
                    HashSet::from([WILDCARD.to_string()]),
                )]);
                state.mode = CacheMode::Degraded;
                state.loaded_at = Some(Instant::now());
                state.retry_at = None;
            }
            Err(e) => {
                if state.loaded_at.is_some() {
                    tracing::warn!(error = %e, "permission refresh failed, keeping previous mapping");
                    state.loaded_at = Some(Instant::now());
                } else {
                    tracing::error!(error = %e, "permission refresh failed with nothing cached");
                    state.retry_at = Some(Instant::now() + COLD_RETRY_AFTER);
                }
            }
        }
        state.mode
    }

    /// Drops the mapping; the next check reloads from the store.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.roles.clear();
        state.mode = CacheMode::Normal;
        state.loaded_at = None;
        state.retry_at = None;
    }

    pub async fn mode(&self) -> CacheMode {
        self.state.read().await.mode
    }

    /// Sorted copy of the current mapping.
    pub async fn snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.ensure_fresh().await;
        let state = self.state.read().await;
        state
            .roles
            .iter()
            .map(|(role, perms)| (role.clone(), perms.iter().cloned().collect()))
            .collect()
    }

    fn grant_in(state: &CacheState, role: &str, permission: &str) -> PermissionGrant {
        let allowed = state
            .roles
            .get(role)
            .is_some_and(|perms| perms.contains(WILDCARD) || perms.contains(permission));
        match (allowed, state.mode) {
            (false, _) => PermissionGrant::Denied,
            (true, CacheMode::Normal) => PermissionGrant::Granted,
            (true, CacheMode::Degraded) => PermissionGrant::Degraded,
        }
    }

    pub async fn has_permission(&self, role: &str, permission: &str) -> PermissionGrant {
        self.ensure_fresh().await;
        let state = self.state.read().await;
        Self::grant_in(&state, role, permission)
    }

    /// Allowed when at least one of `permissions` is. An empty list is denied.
    pub async fn has_any(&self, role: &str, permissions: &[&str]) -> PermissionGrant {
        self.ensure_fresh().await;
        let state = self.state.read().await;
        permissions
            .iter()
            .map(|p| Self::grant_in(&state, role, p))
            .find(PermissionGrant::is_allowed)
            .unwrap_or(PermissionGrant::Denied)
    }

    /// Allowed only when every one of `permissions` is.
    pub async fn has_all(&self, role: &str, permissions: &[&str]) -> PermissionGrant {
        self.ensure_fresh().await;
        let state = self.state.read().await;
        let mut result = match state.mode {
            CacheMode::Normal => PermissionGrant::Granted,
            CacheMode::Degraded => PermissionGrant::Degraded,
        };
        for permission in permissions {
            let grant = Self::grant_in(&state, role, permission);
            if grant == PermissionGrant::Denied {
                return grant;
            }
            result = grant;
        }
        result
    }

    /// Guard used by admin handlers: denial becomes `PermissionDenied`, degraded grants pass but
    /// are logged and audited.
    pub async fn require_permission(
        &self,
        subject: &str,
        role: &str,
        permission: &str,
    ) -> Result<PermissionGrant, AccessError> {
        match self.has_permission(role, permission).await {
            PermissionGrant::Denied => {
                tracing::warn!(%subject, %role, %permission, "permission denied");
                Err(AccessError::PermissionDenied)
            }
            PermissionGrant::Degraded => {
                tracing::warn!(%subject, %role, %permission, mode = "degraded", "permission granted in degraded mode");
                self.audit.emit(
                    SecurityEvent::new(SecurityEventKind::DegradedAccess)
                        .detail(format!("{subject} used {permission} without role data")),
                );
                Ok(PermissionGrant::Degraded)
            }
            PermissionGrant::Granted => Ok(PermissionGrant::Granted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockRepository;

    async fn seeded() -> (PermissionCache, Arc<MockRepository>) {
        let repo = Arc::new(MockRepository::new());
        repo.grant("editor", permissions::USERS_VIEW).await;
        repo.grant("editor", permissions::EVENTS_MANAGE).await;
        repo.grant(SUPER_ADMIN_ROLE, permissions::USERS_VIEW).await;
        repo.grant(SUPER_ADMIN_ROLE, permissions::USERS_DELETE).await;
        let cache = PermissionCache::new(
            repo.clone(),
            AuditLog::tracing_only(),
            Duration::from_secs(300),
            Duration::from_secs(1),
        );
        (cache, repo)
    }

    #[tokio::test]
    async fn editor_cannot_delete_users() {
        let (cache, _) = seeded().await;
        assert_eq!(
            cache
                .require_permission("a", "editor", permissions::USERS_DELETE)
                .await,
            Err(AccessError::PermissionDenied)
        );
        assert_eq!(
            cache
                .require_permission("b", SUPER_ADMIN_ROLE, permissions::USERS_DELETE)
                .await,
            Ok(PermissionGrant::Granted)
        );
    }

    #[tokio::test]
    async fn any_and_all() {
        let (cache, _) = seeded().await;
        let wanted = [permissions::USERS_VIEW, permissions::USERS_DELETE];
        assert_eq!(cache.has_any("editor", &wanted).await, PermissionGrant::Granted);
        assert_eq!(cache.has_all("editor", &wanted).await, PermissionGrant::Denied);
        assert_eq!(cache.has_all(SUPER_ADMIN_ROLE, &wanted).await, PermissionGrant::Granted);
        assert_eq!(cache.has_any("editor", &[]).await, PermissionGrant::Denied);
        assert_eq!(cache.has_permission("ghost", permissions::USERS_VIEW).await, PermissionGrant::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn store_is_hit_once_per_ttl() {
        let (cache, repo) = seeded().await;
        cache.has_permission("editor", permissions::USERS_VIEW).await;
        cache.has_permission("editor", permissions::USERS_VIEW).await;
        assert_eq!(repo.permission_loads().await, 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.has_permission("editor", permissions::USERS_VIEW).await;
        assert_eq!(repo.permission_loads().await, 2);
    }

    #[tokio::test]
    async fn clear_then_refresh_matches_cold_start() {
        let (cache, repo) = seeded().await;
        let warm = cache.snapshot().await;

        cache.clear().await;
        let reloaded = cache.snapshot().await;
        assert_eq!(warm, reloaded);

        let cold = PermissionCache::new(
            repo,
            AuditLog::tracing_only(),
            Duration::from_secs(300),
            Duration::from_secs(1),
        );
        assert_eq!(cold.snapshot().await, reloaded);
    }

    #[tokio::test]
    async fn missing_schema_is_tagged_degraded() {
        let (cache, repo) = seeded().await;
        repo.set_permissions_error(Some(StoreError::SchemaMissing("roles".into())))
            .await;

        assert_eq!(
            cache
                .has_permission(SUPER_ADMIN_ROLE, permissions::SECURITY_MANAGE)
                .await,
            PermissionGrant::Degraded
        );
        assert_eq!(
            cache.has_permission("editor", permissions::USERS_VIEW).await,
            PermissionGrant::Denied
        );
        assert_eq!(cache.mode().await, CacheMode::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_keeps_previous_mapping() {
        let (cache, repo) = seeded().await;
        assert!(cache.has_permission("editor", permissions::USERS_VIEW).await.is_allowed());

        repo.set_permissions_error(Some(StoreError::Database("connection reset".into())))
            .await;
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(
            cache.has_permission("editor", permissions::USERS_VIEW).await,
            PermissionGrant::Granted
        );
    }

    #[tokio::test]
    async fn transient_failure_on_cold_cache_denies() {
        let (cache, repo) = seeded().await;
        repo.set_permissions_error(Some(StoreError::Timeout)).await;
        assert_eq!(
            cache.has_permission(SUPER_ADMIN_ROLE, permissions::USERS_VIEW).await,
            PermissionGrant::Denied
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cold_failure_waits_before_asking_the_store_again() {
        let (cache, repo) = seeded().await;
        repo.set_permissions_error(Some(StoreError::Timeout)).await;
        for _ in 0..3 {
            assert_eq!(
                cache.has_permission("editor", permissions::USERS_VIEW).await,
                PermissionGrant::Denied
            );
        }
        assert_eq!(repo.permission_loads().await, 1);

        repo.set_permissions_error(None).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.has_permission("editor", permissions::USERS_VIEW).await.is_allowed());
        assert_eq!(repo.permission_loads().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_checks_share_one_reload() {
        let (cache, repo) = seeded().await;
        repo.set_delay(Some(Duration::from_millis(500))).await;

        let (a, b, c) = tokio::join!(
            cache.has_permission("editor", permissions::USERS_VIEW),
            cache.has_permission("editor", permissions::USERS_VIEW),
            cache.has_permission("editor", permissions::USERS_DELETE),
        );
        assert!(a.is_allowed() && b.is_allowed());
        assert_eq!(c, PermissionGrant::Denied);
        assert_eq!(repo.permission_loads().await, 1);
    }
}
