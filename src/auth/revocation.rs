use super::claims::SessionClaims;
use crate::errors::AccessError;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// Why a subject's older tokens stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoffReason {
    /// An administrator revoked every session of the subject.
    Explicit,
    /// The account password changed.
    PasswordChanged,
}

#[derive(Debug, Clone, Copy)]
struct Cutoff {
    issued_before: DateTime<Utc>,
    reason: CutoffReason,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Revoked session keys (see `SessionClaims::session_key`), kept until the token would have
    /// expired anyway.
    sessions: HashMap<String, DateTime<Utc>>,
    /// Per-subject "issued-before" cutoffs.
    cutoffs: HashMap<String, Cutoff>,
}

/// RevocationRegistry
///
/// Consulted on every verification, after the signature is known to be good.
#[derive(Clone, Debug, Default)]
pub struct RevocationRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn revoke_session(&self, session_key: &str, expires_at: DateTime<Utc>) {
        let mut state = self.inner.write().await;
        state.sessions.insert(session_key.to_string(), expires_at);
    }

    /// Invalidates every token of `subject` issued before `issued_before`. A later cutoff always
    /// wins over an earlier one.
    pub async fn revoke_subject_before(
        &self,
        subject: &str,
        issued_before: DateTime<Utc>,
        reason: CutoffReason,
    ) {
        let mut state = self.inner.write().await;
        let entry = state.cutoffs.entry(subject.to_string()).or_insert(Cutoff {
            issued_before,
            reason,
        });
        if issued_before >= entry.issued_before {
            *entry = Cutoff {
                issued_before,
                reason,
            };
        }
    }

    pub async fn check(&self, claims: &SessionClaims, session_key: &str) -> Result<(), AccessError> {
        let state = self.inner.read().await;

        if state.sessions.contains_key(session_key) {
            return Err(AccessError::TokenRevoked);
        }

        if let Some(cutoff) = state.cutoffs.get(&claims.sub) {
            if claims.issued_before(cutoff.issued_before) {
                return Err(match cutoff.reason {
                    CutoffReason::Explicit => AccessError::TokenRevoked,
                    CutoffReason::PasswordChanged => AccessError::PasswordChangedSinceIssue,
                });
            }
        }
        Ok(())
    }

    /// Drops revoked session ids whose tokens have expired on their own.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.inner.write().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, expires_at| *expires_at > now);
        before - state.sessions.len()
    }

    pub async fn clear(&self) {
        let mut state = self.inner.write().await;
        state.sessions.clear();
        state.cutoffs.clear();
    }
}
