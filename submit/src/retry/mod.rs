//! Retry logic for submissions
//!
//! This module provides:
//! - Error classification (retryable vs terminal)
//! - Retry policy with the four coordinator parameters
//! - Constant or quality-scaled delay, with optional jitter
//! - The derived submit throttle

pub mod classifier;
pub mod strategy;

pub use classifier::{ErrorClass, PermanentError, RetryClassifiable, RetryableError};
pub use strategy::{DelayMode, GiveUpReason, RetryDecision, RetryPolicy, RetryScheduler};
