use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a provider failure. Retry logic reads this and nothing
/// else; the concrete cause only survives as the message.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    RateLimit,
    Timeout,
    Upstream,
    Transient,
    Permanent,
}

impl ErrorKind {
    /// Whether an error of this kind is worth asking the same provider again.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Upstream | ErrorKind::Transient
        )
    }
}

#[derive(Debug, Clone, Error, Diagnostic)]
#[error("{kind} error from {provider}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub provider: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn timeout(provider: impl Into<String>, after_ms: u128) -> Self {
        Self::new(
            ErrorKind::Timeout,
            provider,
            format!("call did not complete within {after_ms}ms"),
        )
    }

    /// Classify a reqwest transport error. Status-bearing errors are handled
    /// by [`ProviderError::from_status`]; everything that dies before a status
    /// arrives is treated as transient.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_decode() || err.is_body() {
            ErrorKind::Upstream
        } else {
            ErrorKind::Transient
        };
        Self::new(kind, provider, err.to_string())
    }

    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let kind = match status.as_u16() {
            401 | 403 => ErrorKind::Auth,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            400 | 404 | 413 | 422 => ErrorKind::Permanent,
            500..=599 => ErrorKind::Transient,
            _ => ErrorKind::Upstream,
        };
        // Upstream error bodies can be enormous. Keep enough to diagnose.
        let snippet: String = body.chars().take(300).collect();
        Self::new(kind, provider, format!("{status}: {snippet}"))
    }

    /// A response that arrived but didn't have the shape we asked for.
    pub fn malformed(provider: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, provider, detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(ErrorKind::Transient.is_retriable());
        assert!(ErrorKind::RateLimit.is_retriable());
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(ErrorKind::Upstream.is_retriable());
        assert!(!ErrorKind::Validation.is_retriable());
        assert!(!ErrorKind::Auth.is_retriable());
        assert!(!ErrorKind::Permanent.is_retriable());
    }

    #[test]
    fn status_classification() {
        let err = ProviderError::from_status(
            "test",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down",
        );
        assert_eq!(err.kind, ErrorKind::RateLimit);

        let err =
            ProviderError::from_status("test", reqwest::StatusCode::INTERNAL_SERVER_ERROR, "");
        assert_eq!(err.kind, ErrorKind::Transient);

        let err = ProviderError::from_status("test", reqwest::StatusCode::UNPROCESSABLE_ENTITY, "");
        assert_eq!(err.kind, ErrorKind::Permanent);
    }

    #[test]
    fn kind_round_trips_through_strings() {
        use std::str::FromStr;
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Auth,
            ErrorKind::RateLimit,
            ErrorKind::Timeout,
            ErrorKind::Upstream,
            ErrorKind::Transient,
            ErrorKind::Permanent,
        ] {
            assert_eq!(ErrorKind::from_str(&kind.to_string()).unwrap(), kind);
        }
    }
}
