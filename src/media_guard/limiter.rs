use crate::config::MediaGateConfig;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateWindow {
    Minute,
    FiveMinutes,
    Hour,
}

impl RateWindow {
    pub const ALL: [RateWindow; 3] = [RateWindow::Minute, RateWindow::FiveMinutes, RateWindow::Hour];

    pub fn duration(&self) -> Duration {
        match self {
            RateWindow::Minute => Duration::from_secs(60),
            RateWindow::FiveMinutes => Duration::from_secs(300),
            RateWindow::Hour => Duration::from_secs(3600),
        }
    }

    pub fn ceiling(&self, config: &MediaGateConfig) -> u32 {
        match self {
            RateWindow::Minute => config.per_minute,
            RateWindow::FiveMinutes => config.per_five_minutes,
            RateWindow::Hour => config.per_hour,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    started: Instant,
    count: u32,
}

impl WindowCounter {
    fn is_live(&self, window: RateWindow, now: Instant) -> bool {
        now.saturating_duration_since(self.started) < window.duration()
    }
}

/// MultiWindowLimiter
///
/// Fixed-window counters per fingerprint for every `RateWindow`. Checking and counting are
/// separate steps: `check` never mutates, `commit` is called only once the request is let
/// through, so a rejected request never inflates a counter past its ceiling.
#[derive(Debug, Default)]
pub struct MultiWindowLimiter {
    counters: HashMap<(String, RateWindow), WindowCounter>,
}

impl MultiWindowLimiter {
    /// `Err(retry_after)` when any window is already at its ceiling. The hint is the longest wait
    /// among the exceeded windows.
    pub fn check(
        &self,
        fingerprint: &str,
        config: &MediaGateConfig,
        now: Instant,
    ) -> Result<(), Duration> {
        let mut retry_after: Option<Duration> = None;
        for window in RateWindow::ALL {
            let Some(counter) = self.counters.get(&(fingerprint.to_string(), window)) else {
                continue;
            };
            if counter.is_live(window, now) && counter.count >= window.ceiling(config) {
                let remaining = window
                    .duration()
                    .saturating_sub(now.saturating_duration_since(counter.started));
                retry_after = Some(retry_after.map_or(remaining, |r| r.max(remaining)));
            }
        }
        match retry_after {
            Some(wait) => Err(wait.max(Duration::from_secs(1))),
            None => Ok(()),
        }
    }

    pub fn commit(&mut self, fingerprint: &str, now: Instant) {
        for window in RateWindow::ALL {
            let counter = self
                .counters
                .entry((fingerprint.to_string(), window))
                .or_insert(WindowCounter {
                    started: now,
                    count: 0,
                });
            if !counter.is_live(window, now) {
                *counter = WindowCounter {
                    started: now,
                    count: 0,
                };
            }
            counter.count = counter.count.saturating_add(1);
        }
    }

    pub fn count(&self, fingerprint: &str, window: RateWindow, now: Instant) -> u32 {
        self.counters
            .get(&(fingerprint.to_string(), window))
            .filter(|c| c.is_live(window, now))
            .map_or(0, |c| c.count)
    }

    pub fn has_live_window(&self, fingerprint: &str, now: Instant) -> bool {
        RateWindow::ALL.iter().any(|w| self.count(fingerprint, *w, now) > 0)
    }

    /// Drops every elapsed window.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|(_, window), counter| counter.is_live(*window, now));
        before - self.counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn clear(&mut self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MediaGateConfig {
        MediaGateConfig {
            per_minute: 3,
            per_five_minutes: 5,
            per_hour: 100,
            ..MediaGateConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_plus_one_is_rejected() {
        let mut limiter = MultiWindowLimiter::default();
        let config = config();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check("fp", &config, now).is_ok());
            limiter.commit("fp", now);
        }
        let retry = limiter.check("fp", &config, now).unwrap_err();
        assert_eq!(retry, Duration::from_secs(60));
        assert_eq!(limiter.count("fp", RateWindow::Minute, now), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn medium_window_outlives_short_one() {
        let mut limiter = MultiWindowLimiter::default();
        let config = config();
        let start = Instant::now();
        for i in 0..5u64 {
            let at = start + Duration::from_secs(i * 61);
            assert!(limiter.check("fp", &config, at).is_ok(), "request {i}");
            limiter.commit("fp", at);
        }
        let at = start + Duration::from_secs(5 * 61);
        let retry = limiter.check("fp", &config, at).unwrap_err();
        assert!(retry <= Duration::from_secs(300) && retry > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_elapsing() {
        let mut limiter = MultiWindowLimiter::default();
        let config = config();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.commit("fp", start);
        }
        let later = start + Duration::from_secs(60);
        assert!(limiter.check("fp", &config, later).is_ok());
        limiter.commit("fp", later);
        assert_eq!(limiter.count("fp", RateWindow::Minute, later), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_elapsed_windows_only() {
        let mut limiter = MultiWindowLimiter::default();
        let start = Instant::now();
        limiter.commit("fp", start);
        assert_eq!(limiter.len(), 3);

        assert_eq!(limiter.prune(start + Duration::from_secs(120)), 1);
        assert!(limiter.has_live_window("fp", start + Duration::from_secs(120)));
        assert_eq!(limiter.prune(start + Duration::from_secs(3600)), 2);
        assert!(limiter.is_empty());
    }
}
