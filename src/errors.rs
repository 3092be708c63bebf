use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use ts_rs::TS;
use utoipa::ToSchema;

/// AccessError
///
/// Every definitive deny produced by the gateway. Once one of these is returned the request never
/// reaches business logic. Messages are deliberately generic: a rate-limited or blocked client
/// learns that it should retry later, never which heuristic fired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("authentication required")]
    AuthenticationMissing,
    #[error("session expired")]
    TokenExpired,
    #[error("invalid session token")]
    TokenInvalid,
    #[error("session has been revoked")]
    TokenRevoked,
    #[error("token not valid for this endpoint")]
    AudienceMismatch,
    #[error("account is inactive")]
    AccountInactive,
    #[error("password changed since sign-in")]
    PasswordChangedSinceIssue,
    #[error("gallery not found or expired")]
    ResourceNotFoundOrExpired,
    #[error("permission denied")]
    PermissionDenied,
    #[error("too many requests")]
    RateLimited { retry_after: Duration },
    #[error("access blocked")]
    Blocked,
    #[error("request rejected")]
    AutomationSuspected,
    #[error("session timed out due to inactivity")]
    SessionTimedOut,
    #[error("service temporarily unavailable")]
    Unavailable,
    #[error("internal error")]
    Internal,
}

/// Retry hint handed to permanently blocked clients. The block outlives it; it only slows
/// well-behaved retries down.
const BLOCKED_RETRY_AFTER: Duration = Duration::from_secs(3600);

impl AccessError {
    /// Stable machine-readable code placed in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::AuthenticationMissing => "authentication_missing",
            AccessError::TokenExpired => "token_expired",
            AccessError::TokenInvalid => "token_invalid",
            AccessError::TokenRevoked => "token_revoked",
            AccessError::AudienceMismatch => "audience_mismatch",
            AccessError::AccountInactive => "account_inactive",
            AccessError::PasswordChangedSinceIssue => "password_changed",
            AccessError::ResourceNotFoundOrExpired => "not_found_or_expired",
            AccessError::PermissionDenied => "permission_denied",
            AccessError::RateLimited { .. } => "rate_limited",
            AccessError::Blocked => "blocked",
            AccessError::AutomationSuspected => "request_rejected",
            AccessError::SessionTimedOut => "session_timed_out",
            AccessError::Unavailable => "unavailable",
            AccessError::Internal => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AccessError::AuthenticationMissing
            | AccessError::TokenExpired
            | AccessError::TokenInvalid
            | AccessError::TokenRevoked
            | AccessError::AccountInactive
            | AccessError::PasswordChangedSinceIssue
            | AccessError::SessionTimedOut => StatusCode::UNAUTHORIZED,
            AccessError::AudienceMismatch
            | AccessError::PermissionDenied
            | AccessError::Blocked
            | AccessError::AutomationSuspected => StatusCode::FORBIDDEN,
            AccessError::ResourceNotFoundOrExpired => StatusCode::NOT_FOUND,
            AccessError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AccessError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            AccessError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Retry hint in whole seconds, never zero for retryable denials.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AccessError::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            AccessError::Blocked => Some(BLOCKED_RETRY_AFTER.as_secs()),
            _ => None,
        }
    }

    /// True for denials that ask the client to sign in again.
    pub fn requires_reauthentication(&self) -> bool {
        self.status() == StatusCode::UNAUTHORIZED
    }
}

/// ErrorBody
///
/// JSON payload returned with every gateway denial.
#[derive(Debug, Serialize, ToSchema, TS)]
#[ts(export)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after();
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
            retry_after,
        };

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if self.requires_reauthentication() {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

/// StoreError
///
/// Failures from the backing store. None of these reach a client directly: each consumer
/// recovers with cached or default state and decides the outcome itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A table or column the query needs does not exist yet (migration pending).
    #[error("schema not present: {0}")]
    SchemaMissing(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("store lookup timed out")]
    Timeout,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // 42P01 undefined_table, 42703 undefined_column
            if matches!(db.code().as_deref(), Some("42P01") | Some("42703")) {
                return StoreError::SchemaMissing(db.message().to_string());
            }
        }
        StoreError::Database(err.to_string())
    }
}

/// Runs a store future under the configured bound, flattening the elapsed case into
/// `StoreError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_carries_retry_header() {
        let response = AccessError::RateLimited {
            retry_after: Duration::from_secs(42),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn sub_second_retry_is_rounded_up() {
        let err = AccessError::RateLimited {
            retry_after: Duration::from_millis(300),
        };
        assert_eq!(err.retry_after(), Some(1));
    }

    #[test]
    fn session_failures_ask_for_reauthentication() {
        assert!(AccessError::SessionTimedOut.requires_reauthentication());
        assert!(AccessError::TokenExpired.requires_reauthentication());
        assert!(!AccessError::PermissionDenied.requires_reauthentication());
        assert!(!AccessError::Blocked.requires_reauthentication());
    }

    #[test]
    fn heuristic_denials_share_a_generic_message() {
        assert_eq!(AccessError::AutomationSuspected.to_string(), "request rejected");
        assert_eq!(AccessError::AutomationSuspected.code(), "request_rejected");
    }
}
