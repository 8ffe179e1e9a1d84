//! Retry policy and delay computation
//!
//! The scheduler is pure: it decides *whether* and *when* to retry. The
//! coordinator owns the loop and the waiting.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::classifier::RetryClassifiable;
use crate::quality::ConnectionQuality;

/// Share of the dedup window used as the default submit throttle.
const MIN_INTERVAL_WINDOW_RATIO: f64 = 0.6;

/// How the inter-retry delay reacts to connection quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    /// Same delay before every retry.
    #[default]
    Constant,
    /// Delay multiplied by [`ConnectionQuality::timeout_multiplier`].
    QualityScaled,
}

/// Immutable retry configuration supplied when a coordinator is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base timeout for a single attempt
    pub timeout_ms: u64,
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before each retry
    pub retry_delay_ms: u64,
    /// Window during which equal fingerprints count as one submission
    pub deduplication_window_ms: u64,
    #[serde(default)]
    pub delay_mode: DelayMode,
    /// Random spread applied to the retry delay (0.0 disables)
    #[serde(default)]
    pub jitter_factor: f64,
    /// Explicit submit throttle; derived from the dedup window when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interval_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn new(
        timeout_ms: u64,
        max_retries: u32,
        retry_delay_ms: u64,
        deduplication_window_ms: u64,
    ) -> Self {
        Self {
            timeout_ms,
            max_retries,
            retry_delay_ms,
            deduplication_window_ms,
            delay_mode: DelayMode::Constant,
            jitter_factor: 0.0,
            min_interval_ms: None,
        }
    }

    /// Permit request form: 45 s timeout, 3 retries 3 s apart, 8 s window.
    pub fn permit_request() -> Self {
        Self::new(45_000, 3, 3_000, 8_000)
    }

    /// Equipment request form, same budget as permits.
    pub fn equipment_request() -> Self {
        Self::new(45_000, 3, 3_000, 8_000)
    }

    /// Phone update: 30 s timeout, 2 retries 2 s apart, 5 s window.
    pub fn phone_update() -> Self {
        Self::new(30_000, 2, 2_000, 5_000)
    }

    pub fn with_delay_mode(mut self, mode: DelayMode) -> Self {
        self.delay_mode = mode;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Override the derived submit throttle. `Duration::ZERO` disables it.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn deduplication_window(&self) -> Duration {
        Duration::from_millis(self.deduplication_window_ms)
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Throttle at excellent quality.
    pub fn base_min_interval(&self) -> Duration {
        match self.min_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self
                .deduplication_window()
                .mul_f64(MIN_INTERVAL_WINDOW_RATIO),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            ));
        }
        Ok(())
    }
}

/// Retry decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    Terminal,
    Exhausted,
}

/// Decides whether a failed attempt is retried and after what delay.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify<E: RetryClassifiable>(&self, err: &E) -> bool {
        err.is_retryable()
    }

    /// Delay before retry number `attempt + 1`, where `attempt` is the
    /// 0-based index of the attempt that just failed. `None` once retries are
    /// exhausted.
    pub fn next_delay(&self, attempt: u32, quality: ConnectionQuality) -> Option<Duration> {
        if attempt >= self.policy.max_retries {
            return None;
        }
        let base = self.policy.retry_delay();
        let scaled = match self.policy.delay_mode {
            DelayMode::Constant => base,
            DelayMode::QualityScaled => base.mul_f64(quality.timeout_multiplier()),
        };
        Some(apply_jitter(scaled, self.policy.jitter_factor))
    }

    /// Full decision for a failed attempt. A server-suggested wait replaces
    /// the computed delay when it is longer, capped at the attempt timeout.
    pub fn decide<E: RetryClassifiable>(
        &self,
        err: &E,
        attempt: u32,
        quality: ConnectionQuality,
    ) -> RetryDecision {
        if !self.classify(err) {
            return RetryDecision::GiveUp(GiveUpReason::Terminal);
        }
        match self.next_delay(attempt, quality) {
            Some(delay) => {
                let delay = err
                    .suggested_backoff()
                    .map_or(delay, |hint| hint.min(self.policy.timeout()).max(delay));
                RetryDecision::RetryAfter(delay)
            }
            None => RetryDecision::GiveUp(GiveUpReason::Exhausted),
        }
    }

    /// Minimum spacing between two accepted submissions at `quality`.
    pub fn min_interval(&self, quality: ConnectionQuality) -> Duration {
        self.policy
            .base_min_interval()
            .mul_f64(quality.timeout_multiplier())
    }
}

/// Apply jitter to a duration
///
/// Adds random variation (±jitter_factor) to spread out retries.
/// Example: 100ms with 0.5 jitter → 50ms to 150ms
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    let jittered_ms = (duration.as_millis() as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubmitError;
    use pretty_assertions::assert_eq;

    fn scheduler(max_retries: u32) -> RetryScheduler {
        RetryScheduler::new(RetryPolicy::new(1_000, max_retries, 100, 5_000))
    }

    #[test]
    fn constant_delay_ignores_quality() {
        let s = scheduler(3);
        for quality in [
            ConnectionQuality::Excellent,
            ConnectionQuality::Good,
            ConnectionQuality::Poor,
        ] {
            assert_eq!(s.next_delay(0, quality), Some(Duration::from_millis(100)));
        }
    }

    #[test]
    fn quality_scaled_delay_grows_on_poor_links() {
        let s = RetryScheduler::new(
            RetryPolicy::new(1_000, 3, 100, 5_000).with_delay_mode(DelayMode::QualityScaled),
        );
        assert_eq!(
            s.next_delay(0, ConnectionQuality::Excellent),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            s.next_delay(0, ConnectionQuality::Poor),
            Some(Duration::from_millis(200))
        );
    }

    #[test]
    fn next_delay_stops_after_max_retries() {
        let s = scheduler(2);
        assert!(s.next_delay(0, ConnectionQuality::Excellent).is_some());
        assert!(s.next_delay(1, ConnectionQuality::Excellent).is_some());
        assert_eq!(s.next_delay(2, ConnectionQuality::Excellent), None);
        assert_eq!(scheduler(0).next_delay(0, ConnectionQuality::Excellent), None);
    }

    #[test]
    fn decide_short_circuits_terminal_errors() {
        let s = scheduler(3);
        let err = SubmitError::from_status(400, "invalid date");
        assert_eq!(
            s.decide(&err, 0, ConnectionQuality::Excellent),
            RetryDecision::GiveUp(GiveUpReason::Terminal)
        );
        assert_eq!(
            s.decide(&SubmitError::UserCancelled, 0, ConnectionQuality::Excellent),
            RetryDecision::GiveUp(GiveUpReason::Terminal)
        );
    }

    #[test]
    fn decide_reports_exhaustion() {
        let s = scheduler(1);
        let err = SubmitError::Network("reset".into());
        assert_eq!(
            s.decide(&err, 0, ConnectionQuality::Excellent),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            s.decide(&err, 1, ConnectionQuality::Excellent),
            RetryDecision::GiveUp(GiveUpReason::Exhausted)
        );
    }

    #[test]
    fn decide_honours_longer_retry_after() {
        let s = RetryScheduler::new(RetryPolicy::new(5_000, 3, 100, 5_000));
        let err = SubmitError::Server {
            status: 503,
            message: "maintenance".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(
            s.decide(&err, 0, ConnectionQuality::Excellent),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
    }

    #[test]
    fn decide_caps_retry_after_at_attempt_timeout() {
        let s = RetryScheduler::new(RetryPolicy::new(5_000, 3, 100, 5_000));
        let err = SubmitError::Server {
            status: 503,
            message: "maintenance".into(),
            retry_after: Some(Duration::from_secs(86_400)),
        };
        assert_eq!(
            s.decide(&err, 0, ConnectionQuality::Excellent),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );

        // The computed delay still wins when it is the longer of the two.
        let s = RetryScheduler::new(RetryPolicy::new(50, 3, 100, 5_000));
        assert_eq!(
            s.decide(&err, 0, ConnectionQuality::Excellent),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_jitter_range() {
        let duration = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered_ms = apply_jitter(duration, 0.5).as_millis() as f64;
            assert!(
                (500.0..=1500.0).contains(&jittered_ms),
                "Jittered value {jittered_ms} out of range [500, 1500]"
            );
        }
        assert_eq!(apply_jitter(duration, 0.0), duration);
    }

    #[test]
    fn min_interval_derives_from_window_and_quality() {
        let s = scheduler(3);
        assert_eq!(
            s.min_interval(ConnectionQuality::Excellent),
            Duration::from_millis(3_000)
        );
        assert_eq!(
            s.min_interval(ConnectionQuality::Poor),
            Duration::from_millis(6_000)
        );

        let disabled = RetryScheduler::new(
            RetryPolicy::new(1_000, 3, 100, 5_000).with_min_interval(Duration::ZERO),
        );
        assert_eq!(disabled.min_interval(ConnectionQuality::Poor), Duration::ZERO);
    }

    #[test]
    fn presets_match_form_flows() {
        let permit = RetryPolicy::permit_request();
        assert_eq!(permit.timeout(), Duration::from_secs(45));
        assert_eq!(permit.total_attempts(), 4);
        assert_eq!(permit.deduplication_window(), Duration::from_secs(8));
        assert_eq!(RetryPolicy::phone_update().max_retries, 2);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(RetryPolicy::new(0, 1, 1, 1).validate().is_err());
        let mut policy = RetryPolicy::new(1, 1, 1, 1);
        policy.jitter_factor = 1.5;
        assert!(policy.validate().is_err());
        assert!(RetryPolicy::permit_request().validate().is_ok());
    }
}
