use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

// --- Store Records (Mapped to Database) ---

/// AdminAccount
///
/// An administrator row joined with its role name. `password_changed_at` is the cutoff before
/// which every token of this account is considered stale.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct AdminAccount {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub role: String,
    pub password_changed_at: Option<DateTime<Utc>>,
}

/// BasicAdminAccount
///
/// The same account read without the role join. Only used while the RBAC tables are missing.
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct BasicAdminAccount {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub password_changed_at: Option<DateTime<Utc>>,
}

/// EventRecord
///
/// A gallery/event. A `None` expiry means the gallery never expires.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct EventRecord {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub is_active: bool,
    pub is_archived: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub password_required: bool,
}

impl EventRecord {
    /// Whether a gallery session for this event may be honoured at `now`.
    pub fn is_accessible_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active || self.is_archived {
            return false;
        }
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}

/// RolePermission
///
/// One row of the role <-> permission association.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct RolePermission {
    pub role: String,
    pub permission: String,
}

/// PhotoAsset
///
/// Metadata needed to serve one protected photo. Storage itself lives elsewhere.
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct PhotoAsset {
    pub id: Uuid,
    pub event_id: Uuid,
    pub file_path: String,
    pub mime_type: String,
}

// --- Response Schemas ---

/// AdminProfile
///
/// Resolved administrator identity returned by `GET /admin/me`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS)]
#[ts(export)]
pub struct AdminProfile {
    pub id: Uuid,
    pub role: String,
    /// True when the role was assumed because RBAC tables are missing.
    pub degraded: bool,
}

/// GallerySessionSummary
///
/// What a guest learns about the gallery their token opens.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS)]
#[ts(export)]
pub struct GallerySessionSummary {
    pub event_id: Uuid,
    pub slug: String,
    pub name: String,
    #[ts(type = "string | null")]
    pub expires_at: Option<DateTime<Utc>>,
    pub password_required: bool,
}

/// GateStats
///
/// Snapshot of the protected media gatekeeper for the security dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, TS, PartialEq)]
#[ts(export)]
pub struct GateStats {
    pub tracked_windows: usize,
    pub fingerprints_with_violations: usize,
    pub blocked_fingerprints: usize,
    pub blocked_ips: usize,
    pub suspicious_ips: usize,
    /// IPs with recent rapid-repeat flags.
    pub flagged_ips: usize,
    /// Security events discarded because the audit queue was full.
    pub audit_events_dropped: u64,
}

/// BlockIpRequest
///
/// Input for `POST /admin/security/blocklist`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS)]
#[ts(export)]
pub struct BlockIpRequest {
    pub ip: String,
}

/// RevokeSessionsRequest
///
/// Input for `POST /admin/sessions/revoke`: either a single session id or every session of a
/// subject issued up to now.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS)]
#[ts(export)]
pub struct RevokeSessionsRequest {
    pub session_id: Option<String>,
    pub subject: Option<String>,
}

/// PermissionRefreshResponse
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS)]
#[ts(export)]
pub struct PermissionRefreshResponse {
    pub roles: usize,
    pub degraded: bool,
}

/// GuestActionResponse
///
/// Returned by guest feedback endpoints after the action is stored.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS)]
#[ts(export)]
pub struct GuestActionResponse {
    pub recorded: bool,
    pub remaining: u32,
}

/// BlocklistUpdate
///
/// Result of an administrative blocklist change.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS, PartialEq)]
#[ts(export)]
pub struct BlocklistUpdate {
    pub removed: usize,
}
