//! Error classification for retry decisions

use std::time::Duration;

/// Top-level error classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient errors that should be retried after a delay
    Retryable(RetryableError),

    /// Terminal errors that should NOT be retried
    Permanent(PermanentError),
}

/// Transient errors (retry recommended)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryableError {
    #[error("Attempt timed out after {0}ms")]
    AttemptTimeout(u64),

    #[error("Server error (HTTP {status})")]
    ServerError { status: u16 },

    #[error("Transport failure")]
    Transport,
}

/// Terminal errors (do NOT retry)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermanentError {
    #[error("Cancelled by user")]
    Cancelled,

    #[error("Suppressed before reaching the network")]
    Suppressed,

    #[error("Rejected by server (HTTP {status})")]
    ClientError { status: u16 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Trait for error classification
pub trait RetryClassifiable {
    fn classify(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable(_))
    }

    /// Server-provided wait (e.g. `Retry-After`), when the error carries one.
    fn suggested_backoff(&self) -> Option<Duration>;
}

/// Classify a bare HTTP status code.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        500..=599 => ErrorClass::Retryable(RetryableError::ServerError { status }),
        _ => ErrorClass::Permanent(PermanentError::ClientError { status }),
    }
}
