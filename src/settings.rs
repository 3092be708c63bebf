use crate::{errors::with_timeout, repository::RepositoryState};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};

#[derive(Debug, Clone)]
struct CachedSetting {
    value: Option<String>,
    fetched_at: Instant,
}

/// SettingsCache
///
/// Read-through cache over the settings store. A value is reused for `ttl`; when the store is
/// slow or failing the previous value (or the caller's default) is used instead, so a broken
/// settings table can never fail a request.
#[derive(Clone)]
pub struct SettingsCache {
    repo: RepositoryState,
    ttl: Duration,
    timeout: Duration,
    entries: Arc<RwLock<HashMap<String, CachedSetting>>>,
}

impl SettingsCache {
    pub fn new(repo: RepositoryState, ttl: Duration, timeout: Duration) -> Self {
        Self {
            repo,
            ttl,
            timeout,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(key) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return cached.value.clone();
                }
            }
        }

        match with_timeout(self.timeout, self.repo.get_setting(key)).await {
            Ok(value) => {
                self.entries.write().await.insert(
                    key.to_string(),
                    CachedSetting {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                value
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "settings lookup failed, using fallback");
                let mut entries = self.entries.write().await;
                // Keep serving the stale value, and do not retry the store before the next ttl.
                let stale = entries.get(key).and_then(|c| c.value.clone());
                entries.insert(
                    key.to_string(),
                    CachedSetting {
                        value: stale.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                stale
            }
        }
    }

    pub async fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key).await {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "setting is not a number, using default");
                default
            }),
            None => default,
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::StoreError, repository::MockRepository};

    fn cache(repo: Arc<MockRepository>) -> SettingsCache {
        SettingsCache::new(repo, Duration::from_secs(60), Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn value_is_cached_for_ttl() {
        let repo = Arc::new(MockRepository::new());
        repo.set_setting("limit", "7").await;
        let settings = cache(repo.clone());

        assert_eq!(settings.get_u64("limit", 1).await, 7);
        repo.set_setting("limit", "9").await;
        assert_eq!(settings.get_u64("limit", 1).await, 7);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(settings.get_u64("limit", 1).await, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_keeps_stale_value() {
        let repo = Arc::new(MockRepository::new());
        repo.set_setting("limit", "7").await;
        let settings = cache(repo.clone());
        assert_eq!(settings.get_u64("limit", 1).await, 7);

        repo.set_settings_error(Some(StoreError::Database("down".into())))
            .await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(settings.get_u64("limit", 1).await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_falls_back_to_default() {
        let repo = Arc::new(MockRepository::new());
        repo.set_setting("limit", "7").await;
        repo.set_delay(Some(Duration::from_secs(5))).await;

        assert_eq!(cache(repo).get_u64("limit", 3).await, 3);
    }

    #[tokio::test]
    async fn garbage_value_uses_default() {
        let repo = Arc::new(MockRepository::new());
        repo.set_setting("limit", "lots").await;
        assert_eq!(cache(repo).get_u64("limit", 4).await, 4);
    }
}
