use super::Repository;
use crate::{
    audit::SecurityEvent,
    errors::StoreError,
    guest_limits::GuestAction,
    models::{AdminAccount, BasicAdminAccount, EventRecord, PhotoAsset, RolePermission},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedGuestAction {
    pub identity: String,
    pub event_id: Uuid,
    pub action: GuestAction,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct MockState {
    admins: HashMap<Uuid, AdminAccount>,
    rbac_schema_missing: bool,
    events: HashMap<Uuid, EventRecord>,
    role_permissions: Vec<RolePermission>,
    permissions_error: Option<StoreError>,
    permission_loads: usize,
    settings: HashMap<String, String>,
    settings_error: Option<StoreError>,
    guest_actions: Vec<RecordedGuestAction>,
    guest_store_error: Option<StoreError>,
    security_events: Vec<SecurityEvent>,
    photos: HashMap<Uuid, PhotoAsset>,
    likes: HashSet<(Uuid, String)>,
    delay: Option<Duration>,
}

/// MockRepository
///
/// In-memory `Repository` with failure injection, used by unit and integration tests and for
/// running the gateway locally without Postgres.
#[derive(Default)]
pub struct MockRepository {
    state: RwLock<MockState>,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_admin(&self, admin: AdminAccount) {
        self.state.write().await.admins.insert(admin.id, admin);
    }

    /// Simulates the upgrade window where the roles tables are not migrated yet.
    pub async fn set_rbac_schema_missing(&self, missing: bool) {
        self.state.write().await.rbac_schema_missing = missing;
    }

    pub async fn insert_event(&self, event: EventRecord) {
        self.state.write().await.events.insert(event.id, event);
    }

    pub async fn grant(&self, role: &str, permission: &str) {
        self.state.write().await.role_permissions.push(RolePermission {
            role: role.to_string(),
            permission: permission.to_string(),
        });
    }

    pub async fn set_permissions_error(&self, error: Option<StoreError>) {
        self.state.write().await.permissions_error = error;
    }

    pub async fn permission_loads(&self) -> usize {
        self.state.read().await.permission_loads
    }

    pub async fn set_setting(&self, key: &str, value: &str) {
        self.state
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
    }

    pub async fn set_settings_error(&self, error: Option<StoreError>) {
        self.state.write().await.settings_error = error;
    }

    pub async fn set_guest_store_error(&self, error: Option<StoreError>) {
        self.state.write().await.guest_store_error = error;
    }

    pub async fn guest_actions(&self) -> Vec<RecordedGuestAction> {
        self.state.read().await.guest_actions.clone()
    }

    pub async fn security_events(&self) -> Vec<SecurityEvent> {
        self.state.read().await.security_events.clone()
    }

    pub async fn insert_photo(&self, photo: PhotoAsset) {
        self.state.write().await.photos.insert(photo.id, photo);
    }

    /// Every call sleeps this long first; pairs with the store timeout.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().await.delay = delay;
    }

    async fn pause(&self) {
        let delay = self.state.read().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Repository for MockRepository {
    async fn get_admin_with_role(&self, id: Uuid) -> Result<Option<AdminAccount>, StoreError> {
        self.pause().await;
        let state = self.state.read().await;
        if state.rbac_schema_missing {
            return Err(StoreError::SchemaMissing("relation \"roles\" does not exist".into()));
        }
        Ok(state.admins.get(&id).filter(|a| a.is_active).cloned())
    }

    async fn get_admin_basic(&self, id: Uuid) -> Result<Option<BasicAdminAccount>, StoreError> {
        self.pause().await;
        let state = self.state.read().await;
        Ok(state
            .admins
            .get(&id)
            .filter(|a| a.is_active)
            .map(|a| BasicAdminAccount {
                id: a.id,
                email: a.email.clone(),
                is_active: a.is_active,
                password_changed_at: a.password_changed_at,
            }))
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<EventRecord>, StoreError> {
        self.pause().await;
        Ok(self.state.read().await.events.get(&id).cloned())
    }

    async fn get_event_by_slug(&self, slug: &str) -> Result<Option<EventRecord>, StoreError> {
        self.pause().await;
        Ok(self
            .state
            .read()
            .await
            .events
            .values()
            .find(|e| e.slug == slug)
            .cloned())
    }

    async fn list_role_permissions(&self) -> Result<Vec<RolePermission>, StoreError> {
        self.pause().await;
        let mut state = self.state.write().await;
        state.permission_loads += 1;
        if let Some(err) = &state.permissions_error {
            return Err(err.clone());
        }
        Ok(state.role_permissions.clone())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.pause().await;
        let state = self.state.read().await;
        if let Some(err) = &state.settings_error {
            return Err(err.clone());
        }
        Ok(state.settings.get(key).cloned())
    }

    async fn count_guest_actions(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
        since: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), StoreError> {
        self.pause().await;
        let state = self.state.read().await;
        if let Some(err) = &state.guest_store_error {
            return Err(err.clone());
        }
        let matching: Vec<_> = state
            .guest_actions
            .iter()
            .filter(|a| {
                a.identity == identity && a.event_id == event_id && a.action == action && a.at > since
            })
            .collect();
        let oldest = matching.iter().map(|a| a.at).min();
        Ok((matching.len() as u32, oldest))
    }

    async fn record_guest_action(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.pause().await;
        let mut state = self.state.write().await;
        if let Some(err) = &state.guest_store_error {
            return Err(err.clone());
        }
        state.guest_actions.push(RecordedGuestAction {
            identity: identity.to_string(),
            event_id,
            action,
            at,
        });
        Ok(())
    }

    async fn record_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.pause().await;
        self.state.write().await.security_events.push(event.clone());
        Ok(())
    }

    async fn get_photo(
        &self,
        event_id: Uuid,
        photo_id: Uuid,
    ) -> Result<Option<PhotoAsset>, StoreError> {
        self.pause().await;
        Ok(self
            .state
            .read()
            .await
            .photos
            .get(&photo_id)
            .filter(|p| p.event_id == event_id)
            .cloned())
    }

    async fn add_photo_like(&self, photo_id: Uuid, guest: &str) -> Result<bool, StoreError> {
        self.pause().await;
        Ok(self
            .state
            .write()
            .await
            .likes
            .insert((photo_id, guest.to_string())))
    }
}
