use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Audience
///
/// The consumer type a session token was minted for. Admin endpoints only accept `Admin`,
/// gallery endpoints only accept `Gallery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Admin,
    Gallery,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Admin => "admin",
            Audience::Gallery => "gallery",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SessionClaims
///
/// The payload of every session token. Tokens are produced by the login flow; the gateway only
/// ever reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: administrator UUID for `admin`, guest identity for `gallery`.
    pub sub: String,
    pub aud: Audience,
    /// Gallery tokens only: the event the session opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Session id. Explicit single-session revocation keys on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Originating IP recorded at login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Absent on tokens minted before issuers were introduced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl SessionClaims {
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.iat, 0)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// True when the token was issued strictly before `cutoff` (second granularity).
    pub fn issued_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.iat < cutoff.timestamp()
    }

    pub fn key_for_sid(sid: &str) -> String {
        format!("sid:{sid}")
    }

    /// Key used to track this session: the session id when present, otherwise a digest of the
    /// raw token so bearer strings never sit in memory maps.
    pub fn session_key(&self, raw_token: &str) -> String {
        match &self.sid {
            Some(sid) => Self::key_for_sid(sid),
            None => format!("tok:{}", hex::encode(Sha256::digest(raw_token.as_bytes()))),
        }
    }
}
