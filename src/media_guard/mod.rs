//! Protected media gatekeeper.
//!
//! Every photo fetch passes through one pipeline that stops at the first failure:
//!
//! 1. blocklist (IP and fingerprint)
//! 2. multi-window rate limits, with violation counting and promotion to the blocklist
//! 3. rapid-repeat detection (flag only, feeds the IP suspicion list)
//! 4. client plausibility checks
//!
//! The whole decision, including counter updates, happens under one lock acquisition. Audit events
//! are collected while the lock is held and emitted after it is released.

pub mod fingerprint;
pub mod heuristics;
pub mod limiter;

use crate::{
    audit::{AuditLog, SecurityEvent, SecurityEventKind},
    config::MediaGateConfig,
    errors::AccessError,
    models::GateStats,
    sweep::{SweepHandle, spawn_sweep},
};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use heuristics::{ClientHints, RepeatTracker, check_client};
use limiter::{MultiWindowLimiter, RateWindow};
use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};

pub use fingerprint::fingerprint;

/// MediaRequest
///
/// The facts about one media fetch the gate decides on, detached from the HTTP request so the
/// pipeline can be driven directly in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub ip: IpAddr,
    pub user_agent: Option<String>,
    pub has_accept: bool,
    pub has_accept_language: bool,
    pub has_accept_encoding: bool,
    pub requested_with: bool,
    pub has_referer: bool,
    /// Resource identity used by the rapid-repeat detector.
    pub path: String,
}

impl MediaRequest {
    /// A request shaped like an ordinary browser image fetch.
    pub fn browser(ip: IpAddr, path: impl Into<String>) -> Self {
        Self {
            ip,
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/126.0 Safari/537.36"
                    .to_string(),
            ),
            has_accept: true,
            has_accept_language: true,
            has_accept_encoding: true,
            requested_with: false,
            has_referer: true,
            path: path.into(),
        }
    }

    /// Builds the request facts from headers. `peer` is the socket address; proxy headers override
    /// it only when `trust_proxy_headers` is set.
    pub fn from_headers(
        headers: &HeaderMap,
        path: &str,
        peer: Option<IpAddr>,
        trust_proxy_headers: bool,
    ) -> Self {
        let ip = trust_proxy_headers
            .then(|| forwarded_ip(headers))
            .flatten()
            .or(peer)
            .unwrap_or_else(|| {
                tracing::warn!(%path, "no client address available, using unspecified");
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            });

        Self {
            ip,
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            has_accept: headers.contains_key(header::ACCEPT),
            has_accept_language: headers.contains_key(header::ACCEPT_LANGUAGE),
            has_accept_encoding: headers.contains_key(header::ACCEPT_ENCODING),
            requested_with: headers.contains_key("x-requested-with"),
            has_referer: headers.contains_key(header::REFERER),
            path: path.to_string(),
        }
    }

    fn hints(&self) -> ClientHints<'_> {
        ClientHints {
            user_agent: self.user_agent.as_deref(),
            has_accept: self.has_accept,
            has_accept_language: self.has_accept_language,
            has_accept_encoding: self.has_accept_encoding,
            requested_with: self.requested_with,
            has_referer: self.has_referer,
        }
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok());
    from_xff.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// Rapid-repeat flags of one IP. Forgotten after `FLAG_DECAY` without a new flag.
#[derive(Debug, Clone, Copy)]
struct SuspicionFlags {
    count: u32,
    last_flag: Instant,
}

const FLAG_DECAY: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct GateState {
    limiter: MultiWindowLimiter,
    violations: HashMap<String, u32>,
    blocked_fingerprints: HashSet<String>,
    blocked_ips: HashSet<IpAddr>,
    repeats: RepeatTracker,
    flags: HashMap<IpAddr, SuspicionFlags>,
    suspicious_ips: HashSet<IpAddr>,
}

impl GateState {
    fn decide(
        &mut self,
        fp: &str,
        request: &MediaRequest,
        config: &MediaGateConfig,
        now: Instant,
        events: &mut Vec<SecurityEvent>,
    ) -> Result<(), AccessError> {
        let event = |kind: SecurityEventKind| {
            SecurityEvent::new(kind)
                .fingerprint(fp)
                .ip(request.ip)
                .path(request.path.clone())
        };

        // 1. Blocklist
        if self.blocked_fingerprints.contains(fp) || self.blocked_ips.contains(&request.ip) {
            events.push(event(SecurityEventKind::BlockedRequest));
            return Err(AccessError::Blocked);
        }

        // 2. Rate windows
        if let Err(retry_after) = self.limiter.check(fp, config, now) {
            let violations = self.violations.entry(fp.to_string()).or_insert(0);
            *violations += 1;
            let count = *violations;
            events.push(
                event(SecurityEventKind::RateLimitViolation)
                    .detail(format!("violation {count} of {}", config.violation_threshold)),
            );
            if count >= config.violation_threshold {
                self.blocked_fingerprints.insert(fp.to_string());
                events.push(
                    event(SecurityEventKind::FingerprintBlocked)
                        .detail(format!("{count} violations")),
                );
            }
            return Err(AccessError::RateLimited { retry_after });
        }

        // 3. Rapid repeats: flagged, never rejected
        if self.repeats.observe(
            fp,
            &request.path,
            config.rapid_repeat_count,
            config.rapid_repeat_window,
            now,
        ) {
            let entry = self.flags.entry(request.ip).or_insert(SuspicionFlags {
                count: 0,
                last_flag: now,
            });
            entry.count += 1;
            entry.last_flag = now;
            let flags = entry.count;
            events.push(
                event(SecurityEventKind::SuspiciousAccess)
                    .detail(format!("rapid repeat, flag {flags}")),
            );
            if flags >= config.suspicion_flag_threshold && self.suspicious_ips.insert(request.ip) {
                events.push(event(SecurityEventKind::IpMarkedSuspicious));
            }
        }

        // 4. Plausibility
        if let Err(reason) = check_client(&request.hints()) {
            events.push(event(SecurityEventKind::AutomationRejected).detail(reason.describe()));
            return Err(AccessError::AutomationSuspected);
        }

        self.limiter.commit(fp, now);
        Ok(())
    }
}

/// MediaGatekeeper
///
/// Shared, cheap-to-clone handle over the gate state. Lives in `AppState`.
#[derive(Clone)]
pub struct MediaGatekeeper {
    config: Arc<MediaGateConfig>,
    audit: AuditLog,
    state: Arc<Mutex<GateState>>,
}

impl MediaGatekeeper {
    pub fn new(config: MediaGateConfig, audit: AuditLog) -> Self {
        Self {
            config: Arc::new(config),
            audit,
            state: Arc::new(Mutex::new(GateState::default())),
        }
    }

    pub fn config(&self) -> &MediaGateConfig {
        &self.config
    }

    /// Runs the pipeline for one fetch. `Ok` means the media may be served.
    pub async fn secure_image_access(&self, request: &MediaRequest) -> Result<(), AccessError> {
        let fp = fingerprint(request.ip, request.user_agent.as_deref());
        let mut events = Vec::new();
        let outcome = {
            let mut state = self.state.lock().await;
            state.decide(&fp, request, &self.config, Instant::now(), &mut events)
        };
        for event in events {
            self.audit.emit(event);
        }
        outcome
    }

    pub async fn stats(&self) -> GateStats {
        let state = self.state.lock().await;
        GateStats {
            tracked_windows: state.limiter.len(),
            fingerprints_with_violations: state.violations.len(),
            blocked_fingerprints: state.blocked_fingerprints.len(),
            blocked_ips: state.blocked_ips.len(),
            suspicious_ips: state.suspicious_ips.len(),
            flagged_ips: state.flags.len(),
            audit_events_dropped: self.audit.dropped_events(),
        }
    }

    /// Empties both blocklists and forgets accumulated violations. Returns the number of entries
    /// removed.
    pub async fn clear_blocklist(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.blocked_fingerprints.len() + state.blocked_ips.len();
        state.blocked_fingerprints.clear();
        state.blocked_ips.clear();
        state.violations.clear();
        tracing::info!(removed, "media blocklist cleared");
        removed
    }

    /// Unblocks one entry. `key` is either an IP address or a fingerprint.
    pub async fn unblock(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = match key.parse::<IpAddr>() {
            Ok(ip) => state.blocked_ips.remove(&ip),
            Err(_) => {
                state.violations.remove(key);
                state.blocked_fingerprints.remove(key)
            }
        };
        if removed {
            tracing::info!(%key, "media blocklist entry removed");
        }
        removed
    }

    /// Adds `ip` to the blocklist. Returns false when it was already there.
    pub async fn block_ip(&self, ip: IpAddr) -> bool {
        if !self.state.lock().await.blocked_ips.insert(ip) {
            return false;
        }
        self.audit.emit(
            SecurityEvent::new(SecurityEventKind::BlockedRequest)
                .ip(ip)
                .detail("ip blocked by administrator"),
        );
        true
    }

    pub async fn is_suspicious(&self, ip: IpAddr) -> bool {
        self.state.lock().await.suspicious_ips.contains(&ip)
    }

    /// Drops elapsed windows, stale repeat history, decayed repeat flags and violations of
    /// fingerprints that went quiet. Blocklists and the suspicion list are untouched.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut removed = state.limiter.prune(now);
        removed += state.repeats.prune(self.config.rapid_repeat_window, now);

        let GateState {
            limiter,
            violations,
            blocked_fingerprints,
            flags,
            ..
        } = &mut *state;
        let flagged = flags.len();
        flags.retain(|_, f| now.saturating_duration_since(f.last_flag) <= FLAG_DECAY);
        removed += flagged - flags.len();
        let before = violations.len();
        violations.retain(|fp, _| {
            blocked_fingerprints.contains(fp) || limiter.has_live_window(fp, now)
        });
        removed + (before - violations.len())
    }

    pub fn spawn_pruner(&self, period: Duration) -> SweepHandle {
        let gate = self.clone();
        spawn_sweep("media-gate", period, move || {
            let gate = gate.clone();
            async move {
                let removed = gate.prune().await;
                if removed > 0 {
                    tracing::debug!(removed, "pruned media gate state");
                }
            }
        })
    }

    /// Live counts for one fingerprint in each window.
    pub async fn window_counts(&self, fp: &str) -> [(RateWindow, u32); 3] {
        let state = self.state.lock().await;
        let now = Instant::now();
        RateWindow::ALL.map(|w| (w, state.limiter.count(fp, w, now)))
    }

    pub async fn clear(&self) {
        *self.state.lock().await = GateState::default();
    }
}

/// Response headers every served media item carries: never cached, never embeddable elsewhere.
pub fn apply_media_policy(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, private, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; img-src 'self'; frame-ancestors 'none'"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "cross-origin-resource-policy",
        HeaderValue::from_static("same-origin"),
    );
}

/// secure_image_access
///
/// Middleware placed on media routes. Denied fetches never reach the handler; successful
/// responses get the no-cache media policy.
pub async fn secure_image_access(
    State(gate): State<MediaGatekeeper>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let media = MediaRequest::from_headers(
        request.headers(),
        request.uri().path(),
        peer,
        gate.config.trust_proxy_headers,
    );

    if let Err(denied) = gate.secure_image_access(&media).await {
        return denied.into_response();
    }

    let mut response = next.run(request).await;
    if response.status().is_success() {
        apply_media_policy(response.headers_mut());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(config: MediaGateConfig) -> MediaGatekeeper {
        MediaGatekeeper::new(config, AuditLog::tracing_only())
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([198, 51, 100, last])
    }

    #[tokio::test(start_paused = true)]
    async fn thirty_first_request_in_a_minute_is_rate_limited() {
        let gate = gate(MediaGateConfig::default());
        for i in 0..30 {
            let req = MediaRequest::browser(ip(1), format!("/gallery/x/photos/{i}"));
            assert_eq!(gate.secure_image_access(&req).await, Ok(()), "request {i}");
        }
        let denied = gate
            .secure_image_access(&MediaRequest::browser(ip(1), "/gallery/x/photos/31"))
            .await;
        match denied {
            Err(AccessError::RateLimited { retry_after }) => assert!(retry_after > Duration::ZERO),
            other => panic!("expected rate limit, got {other:?}"),
        }

        let fp = fingerprint(ip(1), MediaRequest::browser(ip(1), "").user_agent.as_deref());
        let counts = gate.window_counts(&fp).await;
        assert_eq!(counts[0], (RateWindow::Minute, 30));
    }

    #[tokio::test(start_paused = true)]
    async fn violations_promote_fingerprint_to_blocklist() {
        let gate = gate(MediaGateConfig {
            per_minute: 1,
            violation_threshold: 3,
            ..MediaGateConfig::default()
        });
        let req = MediaRequest::browser(ip(2), "/p/1");
        assert!(gate.secure_image_access(&req).await.is_ok());

        for _ in 0..3 {
            assert!(matches!(
                gate.secure_image_access(&req).await,
                Err(AccessError::RateLimited { .. })
            ));
        }
        assert_eq!(gate.secure_image_access(&req).await, Err(AccessError::Blocked));

        // Blocked fingerprints stay blocked after the windows elapse.
        tokio::time::advance(Duration::from_secs(7200)).await;
        gate.prune().await;
        assert_eq!(gate.secure_image_access(&req).await, Err(AccessError::Blocked));
        assert_eq!(gate.stats().await.blocked_fingerprints, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unblock_and_clear() {
        let gate = gate(MediaGateConfig::default());
        let req = MediaRequest::browser(ip(3), "/p/1");
        gate.block_ip(ip(3)).await;
        assert_eq!(gate.secure_image_access(&req).await, Err(AccessError::Blocked));

        assert!(gate.unblock(&ip(3).to_string()).await);
        assert!(!gate.unblock(&ip(3).to_string()).await);
        assert!(gate.secure_image_access(&req).await.is_ok());

        gate.block_ip(ip(4)).await;
        assert_eq!(gate.clear_blocklist().await, 1);
        assert_eq!(gate.stats().await.blocked_ips, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn automation_is_rejected_without_consuming_quota() {
        let gate = gate(MediaGateConfig::default());
        let mut req = MediaRequest::browser(ip(5), "/p/1");
        req.user_agent = Some("python-requests/2.32".to_string());
        assert_eq!(
            gate.secure_image_access(&req).await,
            Err(AccessError::AutomationSuspected)
        );
        let fp = fingerprint(ip(5), req.user_agent.as_deref());
        assert_eq!(gate.window_counts(&fp).await[0].1, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_bursts_mark_ip_suspicious_but_still_serve() {
        let gate = gate(MediaGateConfig::default());
        let req = MediaRequest::browser(ip(6), "/p/same");
        // 3 bursts of 5 same-resource fetches.
        for _ in 0..15 {
            assert!(gate.secure_image_access(&req).await.is_ok());
        }
        assert!(gate.is_suspicious(ip(6)).await);
        assert_eq!(gate.stats().await.suspicious_ips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_flags_decay_when_pruned() {
        let gate = gate(MediaGateConfig::default());
        let req = MediaRequest::browser(ip(7), "/p/same");
        for _ in 0..5 {
            assert!(gate.secure_image_access(&req).await.is_ok());
        }
        assert_eq!(gate.stats().await.flagged_ips, 1);

        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        gate.prune().await;
        assert_eq!(gate.stats().await.flagged_ips, 1);

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        gate.prune().await;
        let stats = gate.stats().await;
        assert_eq!(stats.flagged_ips, 0);
        assert!(!gate.is_suspicious(ip(7)).await);
    }

    #[test]
    fn proxy_headers_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        let peer = Some(ip(9));

        let untrusted = MediaRequest::from_headers(&headers, "/p", peer, false);
        assert_eq!(untrusted.ip, ip(9));
        let trusted = MediaRequest::from_headers(&headers, "/p", peer, true);
        assert_eq!(trusted.ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn media_policy_headers() {
        let mut headers = HeaderMap::new();
        apply_media_policy(&mut headers);
        assert!(headers[header::CACHE_CONTROL].to_str().unwrap().contains("no-store"));
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert!(headers[header::CONTENT_SECURITY_POLICY]
            .to_str()
            .unwrap()
            .contains("img-src 'self'"));
    }
}
