//! Security audit trail.
//!
//! Every gateway denial or flag becomes a `SecurityEvent`. Events are always written to the
//! tracing log. Persisting them goes through a bounded queue drained by one writer task: when
//! the store falls behind, new events are dropped and counted instead of piling up.

use crate::{errors::with_timeout, repository::RepositoryState};
use chrono::{DateTime, Utc};
use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Events waiting for the store before new ones are dropped.
pub const AUDIT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityEventKind {
    BlockedRequest,
    RateLimitViolation,
    FingerprintBlocked,
    SuspiciousAccess,
    IpMarkedSuspicious,
    AutomationRejected,
    SessionRevoked,
    DegradedAccess,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::BlockedRequest => "blocked_request",
            SecurityEventKind::RateLimitViolation => "rate_limit_violation",
            SecurityEventKind::FingerprintBlocked => "fingerprint_blocked",
            SecurityEventKind::SuspiciousAccess => "suspicious_access",
            SecurityEventKind::IpMarkedSuspicious => "ip_marked_suspicious",
            SecurityEventKind::AutomationRejected => "automation_rejected",
            SecurityEventKind::SessionRevoked => "session_revoked",
            SecurityEventKind::DegradedAccess => "degraded_access",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub fingerprint: Option<String>,
    pub ip: Option<IpAddr>,
    pub path: Option<String>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind) -> Self {
        Self {
            kind,
            fingerprint: None,
            ip: None,
            path: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// AuditLog
///
/// Cheap-to-clone handle over the audit sink.
#[derive(Clone)]
pub struct AuditLog {
    sender: Option<mpsc::Sender<SecurityEvent>>,
    dropped: Arc<AtomicU64>,
}

impl AuditLog {
    /// Persists events to `repo`, each write bounded by `write_timeout`. Must be called inside a
    /// tokio runtime; outside one the log degrades to tracing only.
    pub fn new(repo: RepositoryState, write_timeout: Duration) -> Self {
        Self::with_capacity(repo, write_timeout, AUDIT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(repo: RepositoryState, write_timeout: Duration, capacity: usize) -> Self {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime available, security events are logged but not persisted");
            return Self::tracing_only();
        };
        let (sender, mut receiver) = mpsc::channel::<SecurityEvent>(capacity.max(1));
        handle.spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = with_timeout(write_timeout, repo.record_security_event(&event)).await
                {
                    tracing::debug!(error = %e, event_type = event.kind.as_str(), "failed to persist security event");
                }
            }
        });
        Self {
            sender: Some(sender),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Log-only sink, used where no store is wired (unit tests, tooling).
    pub fn tracing_only() -> Self {
        Self {
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn emit(&self, event: SecurityEvent) {
        tracing::warn!(
            event_type = event.kind.as_str(),
            fingerprint = event.fingerprint.as_deref().unwrap_or("-"),
            ip = ?event.ip,
            path = event.path.as_deref().unwrap_or("-"),
            detail = event.detail.as_deref().unwrap_or(""),
            "security event"
        );

        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // First drop of every thousand.
                if dropped % 1000 == 1 {
                    tracing::warn!(dropped, "audit queue full, dropping security events");
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("audit writer stopped, security event not persisted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockRepository;

    fn event(n: usize) -> SecurityEvent {
        SecurityEvent::new(SecurityEventKind::RateLimitViolation).detail(format!("#{n}"))
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_and_counts() {
        let repo = Arc::new(MockRepository::new());
        let audit = AuditLog::with_capacity(repo.clone(), Duration::from_secs(1), 2);

        // The writer has not run yet, so only two events fit.
        for n in 0..5 {
            audit.emit(event(n));
        }
        assert_eq!(audit.dropped_events(), 3);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(repo.security_events().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_writes_are_abandoned_after_timeout() {
        let repo = Arc::new(MockRepository::new());
        repo.set_delay(Some(Duration::from_secs(30))).await;
        let audit = AuditLog::with_capacity(repo.clone(), Duration::from_secs(1), 4);

        for n in 0..3 {
            audit.emit(event(n));
        }
        // Three writes, each abandoned after one second instead of waiting out the store.
        tokio::time::sleep(Duration::from_secs(4)).await;
        repo.set_delay(None).await;
        audit.emit(event(3));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stored = repo.security_events().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].detail.as_deref(), Some("#3"));
        assert_eq!(audit.dropped_events(), 0);
    }
}
