//! Error types for submission operations

use std::time::Duration;
use thiserror::Error;

use crate::fingerprint::{Fingerprint, RequestId};
use crate::retry::classifier::{
    ErrorClass, PermanentError, RetryClassifiable, RetryableError, classify_status,
};

/// Submission result type alias
pub type Result<T> = std::result::Result<T, SubmitError>;

/// Submission error taxonomy
///
/// Only the outcome of the final attempt is ever returned to a caller;
/// intermediate failures surface as progress notifications.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Duplicate submission suppressed (fingerprint {fingerprint})")]
    DuplicateSuppressed {
        fingerprint: Fingerprint,
        /// Request that currently owns the fingerprint, if still in flight.
        existing: Option<RequestId>,
    },

    #[error("Submitted too soon, wait {retry_after:?} before sending again")]
    RateLimited { retry_after: Duration },

    #[error("No network connection")]
    Offline,

    #[error("Attempt timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("Submission cancelled by user")]
    UserCancelled,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error (HTTP {status}): {message}")]
    Server {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl SubmitError {
    /// Build the error for a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (500..600).contains(&status) {
            SubmitError::Server {
                status,
                message,
                retry_after: None,
            }
        } else {
            SubmitError::Rejected { status, message }
        }
    }

    /// True for timeout- or user-triggered cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SubmitError::TimedOut { .. } | SubmitError::UserCancelled)
    }

    /// True when the submission was refused locally without a network call.
    pub fn is_suppressed(&self) -> bool {
        matches!(
            self,
            SubmitError::DuplicateSuppressed { .. }
                | SubmitError::RateLimited { .. }
                | SubmitError::Offline
        )
    }
}

impl From<reqwest::Error> for SubmitError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SubmitError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            SubmitError::from_status(status.as_u16(), err.to_string())
        } else {
            SubmitError::Network(err.to_string())
        }
    }
}

impl RetryClassifiable for SubmitError {
    fn classify(&self) -> ErrorClass {
        match self {
            SubmitError::Network(_) => ErrorClass::Retryable(RetryableError::Transport),
            SubmitError::Server { status, .. } | SubmitError::Rejected { status, .. } => {
                classify_status(*status)
            }
            SubmitError::TimedOut { timeout } => ErrorClass::Retryable(
                RetryableError::AttemptTimeout(timeout.as_millis() as u64),
            ),
            SubmitError::UserCancelled => ErrorClass::Permanent(PermanentError::Cancelled),
            SubmitError::DuplicateSuppressed { .. }
            | SubmitError::RateLimited { .. }
            | SubmitError::Offline => ErrorClass::Permanent(PermanentError::Suppressed),
            SubmitError::Payload(err) => {
                ErrorClass::Permanent(PermanentError::InvalidPayload(err.to_string()))
            }
            SubmitError::Decode(msg) => {
                ErrorClass::Permanent(PermanentError::InvalidPayload(msg.clone()))
            }
        }
    }

    fn suggested_backoff(&self) -> Option<Duration> {
        match self {
            SubmitError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
