use crate::{errors::AccessError, settings::SettingsCache};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};

/// Settings key holding the admin idle timeout in minutes.
pub const IDLE_TIMEOUT_SETTING: &str = "session_idle_timeout_minutes";

#[derive(Debug, Clone)]
struct ActivityEntry {
    subject: String,
    last_activity: Instant,
    expires_at: Option<DateTime<Utc>>,
}

/// A session the sweep dropped for inactivity. Its token may still be unexpired, so the caller
/// has to revoke it until `expires_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct SweptSession {
    pub session_key: String,
    pub subject: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// SessionActivityTracker
///
/// Idle-timeout enforcement for admin sessions, independent of token expiry. Entries are keyed by
/// session key and live only in this process.
#[derive(Clone)]
pub struct SessionActivityTracker {
    entries: Arc<RwLock<HashMap<String, ActivityEntry>>>,
    settings: SettingsCache,
    default_idle: Duration,
    max_idle: Duration,
}

impl SessionActivityTracker {
    pub fn new(settings: SettingsCache, default_idle: Duration, max_idle: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            settings,
            default_idle,
            max_idle: max_idle.max(Duration::from_secs(60)),
        }
    }

    /// Current idle timeout: the settings value (minutes), clamped to `[1 minute, max_idle]`.
    pub async fn idle_timeout(&self) -> Duration {
        let minutes = self
            .settings
            .get_u64(IDLE_TIMEOUT_SETTING, self.default_idle.as_secs() / 60)
            .await
            .max(1);
        Duration::from_secs(minutes.saturating_mul(60)).min(self.max_idle)
    }

    /// Records activity for `session_key`, rejecting it when it sat idle longer than the timeout.
    /// A first sighting registers the session together with its token expiry.
    pub async fn touch(
        &self,
        session_key: &str,
        subject: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AccessError> {
        let timeout = self.idle_timeout().await;
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        match entries.get_mut(session_key) {
            Some(entry) => {
                let idle = now.saturating_duration_since(entry.last_activity);
                if idle > timeout {
                    tracing::info!(
                        subject = %entry.subject,
                        idle_secs = idle.as_secs(),
                        "admin session timed out"
                    );
                    entries.remove(session_key);
                    return Err(AccessError::SessionTimedOut);
                }
                entry.last_activity = now;
            }
            None => {
                entries.insert(
                    session_key.to_string(),
                    ActivityEntry {
                        subject: subject.to_string(),
                        last_activity: now,
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    /// Called when the login flow issues a new token: every earlier session of `subject` is
    /// forgotten and the new one starts fresh.
    pub async fn on_token_issued(
        &self,
        subject: &str,
        session_key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.subject != subject);
        let dropped = before - entries.len();
        if dropped > 0 {
            tracing::debug!(%subject, dropped, "dropped prior tracked sessions");
        }
        entries.insert(
            session_key.to_string(),
            ActivityEntry {
                subject: subject.to_string(),
                last_activity: Instant::now(),
                expires_at,
            },
        );
    }

    pub async fn end_session(&self, session_key: &str) -> bool {
        self.entries.write().await.remove(session_key).is_some()
    }

    /// Removes entries idle for longer than the maximum timeout and returns them. Forgetting an
    /// entry alone would let its next request register as a fresh session.
    pub async fn sweep(&self) -> Vec<SweptSession> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_activity) > self.max_idle)
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|key| {
                entries.remove(&key).map(|entry| SweptSession {
                    session_key: key,
                    subject: entry.subject,
                    expires_at: entry.expires_at,
                })
            })
            .collect()
    }

    pub async fn tracked_sessions(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockRepository;

    const MINUTE: Duration = Duration::from_secs(60);

    async fn tracker_with_timeout(minutes: Option<&str>) -> (SessionActivityTracker, Arc<MockRepository>) {
        let repo = Arc::new(MockRepository::new());
        if let Some(minutes) = minutes {
            repo.set_setting(IDLE_TIMEOUT_SETTING, minutes).await;
        }
        let settings = SettingsCache::new(repo.clone(), Duration::from_secs(30), Duration::from_secs(1));
        (
            SessionActivityTracker::new(settings, 30 * MINUTE, 480 * MINUTE),
            repo,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_rejected() {
        let (tracker, _) = tracker_with_timeout(Some("15")).await;
        tracker.touch("k", "admin", None).await.unwrap();

        tokio::time::advance(15 * MINUTE + Duration::from_secs(1)).await;
        assert_eq!(
            tracker.touch("k", "admin", None).await,
            Err(AccessError::SessionTimedOut)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_just_under_timeout_resets_clock() {
        let (tracker, _) = tracker_with_timeout(Some("15")).await;
        tracker.touch("k", "admin", None).await.unwrap();

        tokio::time::advance(15 * MINUTE - Duration::from_secs(1)).await;
        assert!(tracker.touch("k", "admin", None).await.is_ok());

        tokio::time::advance(15 * MINUTE - Duration::from_secs(1)).await;
        assert!(tracker.touch("k", "admin", None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn default_applies_without_setting() {
        let (tracker, _) = tracker_with_timeout(None).await;
        assert_eq!(tracker.idle_timeout().await, 30 * MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn setting_is_clamped_to_max() {
        let (tracker, _) = tracker_with_timeout(Some("100000")).await;
        assert_eq!(tracker.idle_timeout().await, 480 * MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn new_token_drops_prior_sessions_of_subject() {
        let (tracker, _) = tracker_with_timeout(None).await;
        tracker.touch("old-1", "alice", None).await.unwrap();
        tracker.touch("old-2", "alice", None).await.unwrap();
        tracker.touch("other", "bob", None).await.unwrap();

        tracker.on_token_issued("alice", "new", None).await;
        assert_eq!(tracker.tracked_sessions().await, 2);
        assert!(!tracker.end_session("old-1").await);
        assert!(tracker.end_session("new").await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_returns_sessions_past_max_idle() {
        let (tracker, _) = tracker_with_timeout(None).await;
        let exp = Utc::now() + chrono::Duration::hours(24);
        tracker.touch("stale", "admin", Some(exp)).await.unwrap();
        tokio::time::advance(400 * MINUTE).await;
        tracker.touch("recent", "admin", None).await.unwrap();

        tokio::time::advance(81 * MINUTE).await;
        let swept = tracker.sweep().await;
        assert_eq!(
            swept,
            vec![SweptSession {
                session_key: "stale".to_string(),
                subject: "admin".to_string(),
                expires_at: Some(exp),
            }]
        );
        assert_eq!(tracker.tracked_sessions().await, 1);
    }
}
