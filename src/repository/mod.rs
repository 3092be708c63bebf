use crate::{
    audit::SecurityEvent,
    errors::StoreError,
    guest_limits::GuestAction,
    models::{AdminAccount, BasicAdminAccount, EventRecord, PhotoAsset, RolePermission},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Repository Trait
///
/// The abstract contract for every store the gateway consults: accounts, events, role
/// permissions, settings, guest action history, audit sink and photo metadata.
///
/// Every method returns `Result<_, StoreError>` so callers can tell a missing row (`Ok(None)`)
/// from a broken or not-yet-migrated store, and pick their own fallback.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Identity ---
    /// Active administrator joined with its role. Fails with `SchemaMissing` while the RBAC
    /// tables do not exist.
    async fn get_admin_with_role(&self, id: Uuid) -> Result<Option<AdminAccount>, StoreError>;
    /// Active administrator without the role join.
    async fn get_admin_basic(&self, id: Uuid) -> Result<Option<BasicAdminAccount>, StoreError>;
    async fn get_event(&self, id: Uuid) -> Result<Option<EventRecord>, StoreError>;
    async fn get_event_by_slug(&self, slug: &str) -> Result<Option<EventRecord>, StoreError>;

    // --- RBAC & Settings ---
    async fn list_role_permissions(&self) -> Result<Vec<RolePermission>, StoreError>;
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    // --- Guest Actions ---
    /// Count of matching actions since `since`, plus the oldest of them (drives the reset time).
    async fn count_guest_actions(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
        since: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), StoreError>;
    async fn record_guest_action(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // --- Audit ---
    async fn record_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError>;

    // --- Media ---
    async fn get_photo(&self, event_id: Uuid, photo_id: Uuid)
    -> Result<Option<PhotoAsset>, StoreError>;
    /// Idempotent: returns true only when a new like row was inserted.
    async fn add_photo_like(&self, photo_id: Uuid, guest: &str) -> Result<bool, StoreError>;
}

/// RepositoryState
///
/// The concrete type used to share the persistence layer across the application state.
pub type RepositoryState = Arc<dyn Repository>;

/// PostgresRepository
///
/// `Repository` backed by PostgreSQL. Queries are checked at runtime so the crate builds
/// without a live database.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const EVENT_COLUMNS: &str =
    "id, slug, name, is_active, is_archived, expires_at, password_required";

#[async_trait]
impl Repository for PostgresRepository {
    async fn get_admin_with_role(&self, id: Uuid) -> Result<Option<AdminAccount>, StoreError> {
        sqlx::query_as::<_, AdminAccount>(
            r#"SELECT a.id, a.email, a.is_active, r.name AS role, a.password_changed_at
               FROM admins a
               JOIN roles r ON r.id = a.role_id
               WHERE a.id = $1 AND a.is_active = true"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)
    }

    async fn get_admin_basic(&self, id: Uuid) -> Result<Option<BasicAdminAccount>, StoreError> {
        sqlx::query_as::<_, BasicAdminAccount>(
            r#"SELECT id, email, is_active, password_changed_at
               FROM admins
               WHERE id = $1 AND is_active = true"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<EventRecord>, StoreError> {
        sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)
    }

    async fn get_event_by_slug(&self, slug: &str) -> Result<Option<EventRecord>, StoreError> {
        sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)
    }

    async fn list_role_permissions(&self) -> Result<Vec<RolePermission>, StoreError> {
        sqlx::query_as::<_, RolePermission>(
            r#"SELECT r.name AS role, p.name AS permission
               FROM role_permissions rp
               JOIN roles r ON r.id = rp.role_id
               JOIN permissions p ON p.id = rp.permission_id"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
    }

    async fn count_guest_actions(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
        since: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), StoreError> {
        let (count, oldest) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            r#"SELECT COUNT(*), MIN(created_at)
               FROM guest_actions
               WHERE guest_identity = $1 AND event_id = $2 AND action = $3 AND created_at > $4"#,
        )
        .bind(identity)
        .bind(event_id)
        .bind(action.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok((u32::try_from(count.max(0)).unwrap_or(u32::MAX), oldest))
    }

    async fn record_guest_action(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO guest_actions (guest_identity, event_id, action, created_at)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(identity)
        .bind(event_id)
        .bind(action.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn record_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO security_events (kind, fingerprint, ip, path, detail, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(event.kind.as_str())
        .bind(&event.fingerprint)
        .bind(event.ip.map(|ip| ip.to_string()))
        .bind(&event.path)
        .bind(&event.detail)
        .bind(event.at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn get_photo(
        &self,
        event_id: Uuid,
        photo_id: Uuid,
    ) -> Result<Option<PhotoAsset>, StoreError> {
        sqlx::query_as::<_, PhotoAsset>(
            "SELECT id, event_id, file_path, mime_type FROM photos WHERE id = $1 AND event_id = $2",
        )
        .bind(photo_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)
    }

    async fn add_photo_like(&self, photo_id: Uuid, guest: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO photo_likes (photo_id, guest_identity) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(photo_id)
        .bind(guest)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(result.rows_affected() > 0)
    }
}

mod mock;
pub use mock::{MockRepository, RecordedGuestAction};
