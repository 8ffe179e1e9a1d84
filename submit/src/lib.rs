//! Resilient form submission.
//!
//! Wraps a single network call (a [`Submitter`]) with duplicate suppression,
//! connection-aware timeouts, bounded retries and user cancellation. One
//! [`SubmissionCoordinator`] serves one logical form flow; its visible
//! [`SubmissionState`] and observer callbacks drive the UI.
//!
//! ```no_run
//! use portal_submit::{HttpSubmitter, RetryPolicy, SubmissionCoordinator};
//!
//! # async fn run() -> portal_submit::Result<()> {
//! let submitter: HttpSubmitter<serde_json::Value, serde_json::Value> =
//!     HttpSubmitter::new("http://localhost:8000/api/permit-request");
//! let coordinator = SubmissionCoordinator::new(submitter, RetryPolicy::permit_request());
//! let response = coordinator
//!     .submit(serde_json::json!({ "code": "A123", "date": ["2026-10-20"] }))
//!     .await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod coordinator;
pub mod error;
#[cfg(feature = "dev-faults")]
pub mod faults;
pub mod fingerprint;
pub mod http;
pub mod quality;
pub mod retry;
pub mod timeout;

pub use coordinator::{
    ConnectionIssue, FnObserver, NoopObserver, Stage, SubmissionCoordinator, SubmissionState,
    SubmitObserver, Submitter,
};
pub use error::{Result, SubmitError};
pub use fingerprint::{Fingerprint, RequestId};
pub use http::HttpSubmitter;
pub use portal_async_utils::{CancelReason, CancelSignal};
pub use quality::{ConnectionQuality, MonitorHandle, NetworkSignals, QualityMonitor, QualitySignal};
pub use retry::{DelayMode, RetryPolicy};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
