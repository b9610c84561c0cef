//! Well-data service client
//!
//! Two ingestion paths against the same service: a bounded snapshot query
//! and a persistent event-stream subscription.

mod client;
mod stream;

pub use client::{TimeWindow, WellDataClient};
pub use stream::EventStream;

use std::time::Duration;
use thiserror::Error;

use crate::retry::{RetryClass, Retryable};

/// Fallback delay when a rate-limit response carries no usable
/// `Retry-After` header.
pub(crate) const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// API failure taxonomy.
///
/// Transient failures are eligible for retry; permanent ones propagate
/// immediately; rate limits carry the server's retry-after hint.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transient API failure (exhausted: {exhausted}): {message}")]
    Transient { message: String, exhausted: bool },

    #[error("permanent API failure (status: {status:?}): {message}")]
    Permanent {
        message: String,
        status: Option<u16>,
    },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

impl ApiError {
    pub(crate) fn transient(message: impl Into<String>) -> Self {
        ApiError::Transient {
            message: message.into(),
            exhausted: false,
        }
    }

    pub(crate) fn permanent(message: impl Into<String>, status: Option<u16>) -> Self {
        ApiError::Permanent {
            message: message.into(),
            status,
        }
    }

    /// Classify a failed HTTP response by status code.
    pub(crate) fn from_status(status: reqwest::StatusCode, context: &str, retry_after: Option<Duration>) -> Self {
        if status.as_u16() == 429 {
            return ApiError::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            };
        }
        if status.is_server_error() {
            return ApiError::transient(format!("{context}: HTTP {status}"));
        }
        ApiError::permanent(format!("{context}: HTTP {status}"), Some(status.as_u16()))
    }

    /// Classify a reqwest transport error. Timeouts, connect failures and
    /// mid-body resets are transient; request construction problems are not.
    pub(crate) fn from_transport(err: &reqwest::Error, context: &str) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_body() {
            return ApiError::transient(format!("{context}: {err}"));
        }
        if err.is_builder() || err.is_redirect() {
            return ApiError::permanent(format!("{context}: {err}"), None);
        }
        // Remaining cases (decode of a broken stream, dropped connection)
        // are network-shaped.
        ApiError::transient(format!("{context}: {err}"))
    }
}

impl Retryable for ApiError {
    fn retry_class(&self) -> RetryClass {
        match self {
            ApiError::Transient { .. } => RetryClass::Transient,
            ApiError::Permanent { .. } => RetryClass::Permanent,
            ApiError::RateLimited { retry_after } => RetryClass::RateLimited(*retry_after),
        }
    }

    fn into_exhausted(self) -> Self {
        match self {
            ApiError::Transient { message, .. } => ApiError::Transient {
                message,
                exhausted: true,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = ApiError::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "q", None);
        assert_eq!(err.retry_class(), RetryClass::Transient);

        let err = ApiError::from_status(reqwest::StatusCode::UNAUTHORIZED, "q", None);
        assert_eq!(err.retry_class(), RetryClass::Permanent);

        let err = ApiError::from_status(reqwest::StatusCode::BAD_REQUEST, "q", None);
        assert_eq!(err.retry_class(), RetryClass::Permanent);

        let err = ApiError::from_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "q",
            Some(Duration::from_secs(7)),
        );
        assert_eq!(
            err.retry_class(),
            RetryClass::RateLimited(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_rate_limit_without_hint_uses_default() {
        let err = ApiError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "q", None);
        assert_eq!(err.retry_class(), RetryClass::RateLimited(DEFAULT_RETRY_AFTER));
    }

    #[test]
    fn test_exhausted_tag_preserves_message() {
        let err = ApiError::transient("read timeout").into_exhausted();
        match err {
            ApiError::Transient { message, exhausted } => {
                assert_eq!(message, "read timeout");
                assert!(exhausted);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
