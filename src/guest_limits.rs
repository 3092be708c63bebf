//! Per-guest, per-event ceilings on gallery interactions (likes, comments, ...).

use crate::{
    errors::{AccessError, with_timeout},
    repository::RepositoryState,
    settings::SettingsCache,
};
use axum::{
    http::HeaderValue,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use uuid::Uuid;

/// Rolling window every guest ceiling is expressed over.
pub const GUEST_WINDOW: Duration = Duration::from_secs(3600);

pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestAction {
    Like,
    Comment,
    Favorite,
    Download,
}

impl GuestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestAction::Like => "like",
            GuestAction::Comment => "comment",
            GuestAction::Favorite => "favorite",
            GuestAction::Download => "download",
        }
    }

    /// Ceiling used when the settings store has no (usable) value.
    pub fn default_limit(&self) -> u64 {
        match self {
            GuestAction::Like => 100,
            GuestAction::Comment => 20,
            GuestAction::Favorite => 50,
            GuestAction::Download => 30,
        }
    }

    /// e.g. `guest_limit_like_per_hour`
    pub fn setting_key(&self) -> String {
        format!("guest_limit_{}_per_hour", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestQuota {
    pub limit: u32,
    /// Actions left in the window once the current one is performed.
    pub remaining: u32,
}

/// GuestActionLimiter
///
/// Counts live in the guest action store, so limits hold across gateway instances. Checking and
/// recording are separate: a failed downstream action is never counted.
#[derive(Clone)]
pub struct GuestActionLimiter {
    repo: RepositoryState,
    settings: SettingsCache,
    store_timeout: Duration,
}

impl GuestActionLimiter {
    pub fn new(repo: RepositoryState, settings: SettingsCache, store_timeout: Duration) -> Self {
        Self {
            repo,
            settings,
            store_timeout,
        }
    }

    pub async fn limit_for(&self, action: GuestAction) -> u32 {
        let limit = self
            .settings
            .get_u64(&action.setting_key(), action.default_limit())
            .await;
        u32::try_from(limit).unwrap_or(u32::MAX)
    }

    /// Rejects with `RateLimited` (retry after the oldest counted action leaves the window) when
    /// the ceiling is reached. A failing store lets the action through.
    pub async fn check_limit(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
    ) -> Result<GuestQuota, AccessError> {
        let limit = self.limit_for(action).await;
        let now = Utc::now();
        let since = now - window();

        let (count, oldest) = match with_timeout(
            self.store_timeout,
            self.repo.count_guest_actions(identity, event_id, action, since),
        )
        .await
        {
            Ok(counted) => counted,
            Err(e) => {
                tracing::warn!(
                    %identity,
                    %event_id,
                    action = action.as_str(),
                    error = %e,
                    "guest action count failed, allowing"
                );
                return Ok(GuestQuota {
                    limit,
                    remaining: limit.saturating_sub(1),
                });
            }
        };

        if count >= limit {
            let reset_at = oldest.map_or(now + window(), |at| at + window());
            let retry_after = (reset_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_secs(1));
            tracing::warn!(
                %identity,
                %event_id,
                action = action.as_str(),
                count,
                limit,
                "guest action limit reached"
            );
            return Err(AccessError::RateLimited { retry_after });
        }

        Ok(GuestQuota {
            limit,
            remaining: limit - count - 1,
        })
    }

    /// Stores one performed action. Failures are logged only; the action already happened.
    pub async fn record_action(&self, identity: &str, event_id: Uuid, action: GuestAction) {
        self.record_action_at(identity, event_id, action, Utc::now()).await;
    }

    pub async fn record_action_at(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
        at: DateTime<Utc>,
    ) {
        if let Err(e) = with_timeout(
            self.store_timeout,
            self.repo.record_guest_action(identity, event_id, action, at),
        )
        .await
        {
            tracing::warn!(%identity, %event_id, action = action.as_str(), error = %e, "failed to record guest action");
        }
    }

    /// run_limited
    ///
    /// Wraps a guest action handler:
    /// 1. checks the ceiling and answers `429` when it is reached,
    /// 2. runs `action_fn` with the quota the action will leave,
    /// 3. records the action only when the response is a success, adding the remaining quota
    ///    header.
    pub async fn run_limited<F, Fut, R>(
        &self,
        identity: &str,
        event_id: Uuid,
        action: GuestAction,
        action_fn: F,
    ) -> Response
    where
        F: FnOnce(GuestQuota) -> Fut,
        Fut: Future<Output = R>,
        R: IntoResponse,
    {
        let quota = match self.check_limit(identity, event_id, action).await {
            Ok(quota) => quota,
            Err(denied) => return denied.into_response(),
        };

        let mut response = action_fn(quota).await.into_response();
        if response.status().is_success() {
            self.record_action(identity, event_id, action).await;
            if let Ok(value) = HeaderValue::from_str(&quota.remaining.to_string()) {
                response.headers_mut().insert(REMAINING_HEADER, value);
            }
        }
        response
    }
}

fn window() -> chrono::Duration {
    chrono::Duration::seconds(GUEST_WINDOW.as_secs() as i64)
}
