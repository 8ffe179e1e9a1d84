//! Submission coordinator.
//!
//! Composes the deduplicator, quality monitor, retry scheduler and timeout
//! manager behind a single [`SubmissionCoordinator::submit`] entry point.
//!
//! State machine:
//!
//! ```text
//! idle -> preparing -> submitting -> completed
//!                          |  ^
//!                          v  |
//!                        retrying
//!                          |
//!                          v
//!                  cancelled | failed
//! ```
//!
//! Duplicate, throttled and offline submissions are refused before
//! `preparing` and leave the visible state untouched.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use portal_async_utils::{CancelReason, CancelSignal, OrCancelExt, sleep_or_cancel};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Result, SubmitError};
use crate::fingerprint::{AcquireResult, Deduplicator, Fingerprint, ReleaseOutcome, RequestId};
use crate::quality::{ConnectionQuality, MonitorHandle, QualityMonitor};
use crate::retry::{GiveUpReason, RetryDecision, RetryPolicy, RetryScheduler};
use crate::timeout::TimeoutManager;

/// The network-call collaborator. Implementations must observe `signal`
/// cooperatively and return promptly once it fires.
#[async_trait]
pub trait Submitter: Send + Sync {
    type Payload: Serialize + Send + Sync + 'static;
    type Output: Send + 'static;

    async fn submit(&self, payload: &Self::Payload, signal: CancelSignal) -> Result<Self::Output>;
}

#[async_trait]
impl<S> Submitter for Arc<S>
where
    S: Submitter + ?Sized,
{
    type Payload = S::Payload;
    type Output = S::Output;

    async fn submit(&self, payload: &Self::Payload, signal: CancelSignal) -> Result<Self::Output> {
        (**self).submit(payload, signal).await
    }
}

/// Externally visible phase of the most recent submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Idle,
    Preparing,
    Submitting,
    /// Waiting before retry `attempt` of `max`.
    Retrying {
        attempt: u32,
        max: u32,
    },
    Completed,
    Cancelled(CancelReason),
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Cancelled(_) | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Idle => f.write_str("Idle"),
            Stage::Preparing => f.write_str("Preparing submission"),
            Stage::Submitting => f.write_str("Sending request"),
            Stage::Retrying { attempt, max } => write!(f, "Retrying ({attempt}/{max})"),
            Stage::Completed => f.write_str("Completed"),
            Stage::Cancelled(CancelReason::User) => f.write_str("Cancelled by user"),
            Stage::Cancelled(CancelReason::Timeout) => f.write_str("Timed out"),
            Stage::Failed => f.write_str("Failed"),
        }
    }
}

/// Read-only snapshot published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionState {
    pub is_submitting: bool,
    pub is_retrying: bool,
    pub retry_count: u32,
    pub stage: Stage,
    pub connection_quality: ConnectionQuality,
    pub request_id: Option<RequestId>,
    /// Submissions currently holding a fingerprint slot.
    pub pending: usize,
}

/// Something the UI may want to tell the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionIssue {
    DuplicateSuppressed,
    RateLimited { retry_after: Duration },
    Offline,
    Degraded(ConnectionQuality),
    AttemptFailed { attempt: u32, max: u32, error: String },
    TimedOut,
    Cancelled,
    Failed(String),
}

impl fmt::Display for ConnectionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionIssue::DuplicateSuppressed => {
                f.write_str("Duplicate submission detected, request ignored")
            }
            ConnectionIssue::RateLimited { retry_after } => write!(
                f,
                "Please wait {}s before sending another request",
                retry_after.as_millis().div_ceil(1000)
            ),
            ConnectionIssue::Offline => f.write_str("No internet connection"),
            ConnectionIssue::Degraded(quality) => write!(f, "Connection quality is {quality}"),
            ConnectionIssue::AttemptFailed {
                attempt,
                max,
                error,
            } => write!(f, "Connection error, retrying ({attempt}/{max}): {error}"),
            ConnectionIssue::TimedOut => f.write_str("Request timed out, connection is too slow"),
            ConnectionIssue::Cancelled => f.write_str("Submission cancelled by user"),
            ConnectionIssue::Failed(error) => write!(f, "Submission failed: {error}"),
        }
    }
}

/// Callbacks invoked by the coordinator. Both default to no-ops.
pub trait SubmitObserver: Send + Sync {
    fn on_progress(&self, _stage: &Stage) {}

    fn on_connection_issue(&self, _issue: &ConnectionIssue) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl SubmitObserver for NoopObserver {}

type ProgressFn = Box<dyn Fn(&Stage) + Send + Sync>;
type IssueFn = Box<dyn Fn(&ConnectionIssue) + Send + Sync>;

/// Observer built from two closures.
pub struct FnObserver {
    progress: ProgressFn,
    issue: IssueFn,
}

impl FnObserver {
    pub fn new(
        on_progress: impl Fn(&Stage) + Send + Sync + 'static,
        on_connection_issue: impl Fn(&ConnectionIssue) + Send + Sync + 'static,
    ) -> Self {
        Self {
            progress: Box::new(on_progress),
            issue: Box::new(on_connection_issue),
        }
    }
}

impl SubmitObserver for FnObserver {
    fn on_progress(&self, stage: &Stage) {
        (self.progress)(stage);
    }

    fn on_connection_issue(&self, issue: &ConnectionIssue) {
        (self.issue)(issue);
    }
}

/// Releases a fingerprint slot exactly once, including when the submit
/// future is dropped mid-flight.
struct SlotGuard<'a> {
    dedup: &'a Deduplicator,
    fingerprint: Fingerprint,
    request_id: RequestId,
    outcome: ReleaseOutcome,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.dedup
            .release(&self.fingerprint, &self.request_id, self.outcome);
    }
}

/// One coordinator per logical submission flow (e.g. one per form).
pub struct SubmissionCoordinator<S: Submitter> {
    submitter: S,
    scheduler: RetryScheduler,
    dedup: Deduplicator,
    timeouts: TimeoutManager,
    monitor: QualityMonitor,
    observer: Arc<dyn SubmitObserver>,
    state: Arc<watch::Sender<SubmissionState>>,
    last_accepted: Mutex<Option<Instant>>,
}

impl<S: Submitter> fmt::Debug for SubmissionCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionCoordinator")
            .field("policy", self.scheduler.policy())
            .field("dedup_window", &self.dedup.window())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: Submitter> SubmissionCoordinator<S> {
    pub fn new(submitter: S, policy: RetryPolicy) -> Self {
        let (state, _rx) = watch::channel(SubmissionState::default());
        Self {
            submitter,
            dedup: Deduplicator::new(policy.deduplication_window()),
            scheduler: RetryScheduler::new(policy),
            timeouts: TimeoutManager::new(),
            monitor: QualityMonitor::default(),
            observer: Arc::new(NoopObserver),
            state: Arc::new(state),
            last_accepted: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: impl SubmitObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn with_monitor(mut self, monitor: QualityMonitor) -> Self {
        let quality = monitor.snapshot();
        self.state
            .send_modify(|state| state.connection_quality = quality);
        self.monitor = monitor;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.scheduler.policy()
    }

    pub fn monitor(&self) -> &QualityMonitor {
        &self.monitor
    }

    pub fn state(&self) -> SubmissionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SubmissionState> {
        self.state.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.dedup.in_flight()
    }

    /// Armed attempt timers; zero whenever nothing is in flight.
    pub fn live_timeouts(&self) -> usize {
        self.timeouts.live()
    }

    pub fn can_submit(&self) -> bool {
        let state = self.state.borrow();
        !state.is_submitting && state.connection_quality != ConnectionQuality::Offline
    }

    /// Sample connection quality every `period`, mirroring it into the
    /// visible state and reporting degradation. Stops when the handle drops.
    pub fn watch_connection(&self, period: Duration) -> MonitorHandle {
        let monitor = self.monitor.clone();
        let state = Arc::clone(&self.state);
        let observer = Arc::clone(&self.observer);
        MonitorHandle::from_task(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let quality = monitor.sample();
                let changed = state.send_if_modified(|s| {
                    let changed = s.connection_quality != quality;
                    s.connection_quality = quality;
                    changed
                });
                if changed && quality.is_degraded() {
                    let issue = if quality == ConnectionQuality::Offline {
                        ConnectionIssue::Offline
                    } else {
                        ConnectionIssue::Degraded(quality)
                    };
                    observer.on_connection_issue(&issue);
                }
            }
        }))
    }

    /// Submit `payload`, retrying transient failures per the policy.
    ///
    /// Returns the collaborator's result on success. Every terminal failure
    /// comes back as a classified [`SubmitError`]; intermediate failures are
    /// only reported through the observer.
    pub async fn submit(&self, payload: S::Payload) -> Result<S::Output> {
        let fingerprint = Fingerprint::of(&payload)?;
        let request_id = RequestId::new();
        let session = CancelSignal::new();

        if let AcquireResult::Rejected { reason, existing } =
            self.dedup.try_acquire(&fingerprint, &request_id, &session)
        {
            tracing::warn!(
                fingerprint = %fingerprint,
                existing = ?existing.as_ref().map(RequestId::as_str),
                ?reason,
                "duplicate submission suppressed"
            );
            self.issue(ConnectionIssue::DuplicateSuppressed);
            return Err(SubmitError::DuplicateSuppressed {
                fingerprint,
                existing,
            });
        }
        let mut slot = SlotGuard {
            dedup: &self.dedup,
            fingerprint,
            request_id: request_id.clone(),
            outcome: ReleaseOutcome::Abandoned,
        };

        let quality = self.monitor.sample();
        if quality == ConnectionQuality::Offline {
            tracing::warn!(request_id = %request_id, "offline, submission refused");
            self.state
                .send_modify(|state| state.connection_quality = quality);
            self.issue(ConnectionIssue::Offline);
            return Err(SubmitError::Offline);
        }

        if let Err(retry_after) = self.throttle(quality) {
            tracing::warn!(
                request_id = %request_id,
                retry_after_ms = retry_after.as_millis() as u64,
                "submission throttled"
            );
            self.issue(ConnectionIssue::RateLimited { retry_after });
            return Err(SubmitError::RateLimited { retry_after });
        }

        tracing::info!(
            request_id = %request_id,
            fingerprint = %slot.fingerprint,
            %quality,
            "submission accepted"
        );
        let pending = self.dedup.in_flight();
        self.state.send_modify(|state| {
            *state = SubmissionState {
                is_submitting: true,
                is_retrying: false,
                retry_count: 0,
                stage: Stage::Preparing,
                connection_quality: quality,
                request_id: Some(request_id.clone()),
                pending,
            };
        });
        self.progress(Stage::Preparing);

        let outcome = self
            .attempt_loop(&payload, &request_id, &session, quality)
            .await;

        let stage = match &outcome {
            Ok(_) => {
                slot.outcome = ReleaseOutcome::Completed;
                Stage::Completed
            }
            Err(SubmitError::UserCancelled) => Stage::Cancelled(CancelReason::User),
            Err(SubmitError::TimedOut { .. }) => Stage::Cancelled(CancelReason::Timeout),
            Err(_) => Stage::Failed,
        };
        drop(slot);
        self.finish(&request_id, stage);

        match &outcome {
            Ok(_) => tracing::info!(request_id = %request_id, "submission completed"),
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err, "submission failed");
                let issue = match err {
                    SubmitError::UserCancelled => ConnectionIssue::Cancelled,
                    SubmitError::TimedOut { .. } => ConnectionIssue::TimedOut,
                    other => ConnectionIssue::Failed(other.to_string()),
                };
                self.issue(issue);
            }
        }
        outcome
    }

    async fn attempt_loop(
        &self,
        payload: &S::Payload,
        request_id: &RequestId,
        session: &CancelSignal,
        initial_quality: ConnectionQuality,
    ) -> Result<S::Output> {
        let policy = self.scheduler.policy();
        let max = policy.max_retries;
        let mut quality = initial_quality;
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                quality = self.monitor.sample();
            }
            self.transition(request_id, |state| {
                state.stage = Stage::Submitting;
                state.connection_quality = quality;
            });
            self.progress(Stage::Submitting);

            let armed = self.timeouts.arm(session, policy.timeout(), quality);
            tracing::debug!(
                request_id = %request_id,
                attempt = attempt + 1,
                total = policy.total_attempts(),
                timeout_ms = armed.timeout().as_millis() as u64,
                %quality,
                "sending attempt"
            );

            let signal = armed.signal().clone();
            let result = match self
                .submitter
                .submit(payload, signal.clone())
                .or_cancel(&signal)
                .await
            {
                Ok(Ok(output)) => Ok(output),
                // A collaborator that noticed the signal reports its own
                // error; the signal's reason is authoritative.
                Ok(Err(err)) => match signal.reason() {
                    Some(reason) => Err(cancel_error(reason, armed.timeout())),
                    None => Err(err),
                },
                Err(cancelled) => Err(cancel_error(cancelled.reason(), armed.timeout())),
            };
            let timeout = armed.timeout();
            let timed_out = armed.timed_out();
            armed.disarm();

            let err = match result {
                Ok(output) => return Ok(output),
                Err(_) if session.is_cancelled() => return Err(SubmitError::UserCancelled),
                Err(err) => err,
            };

            match self.scheduler.decide(&err, attempt, quality) {
                RetryDecision::RetryAfter(delay) => {
                    attempt += 1;
                    tracing::warn!(
                        request_id = %request_id,
                        attempt,
                        max,
                        delay_ms = delay.as_millis() as u64,
                        timeout_ms = timeout.as_millis() as u64,
                        timed_out,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    self.issue(ConnectionIssue::AttemptFailed {
                        attempt,
                        max,
                        error: err.to_string(),
                    });
                    let stage = Stage::Retrying { attempt, max };
                    self.transition(request_id, |state| {
                        state.stage = stage;
                        state.is_retrying = true;
                        state.retry_count = attempt;
                    });
                    self.progress(stage);

                    if sleep_or_cancel(delay, session).await.is_err() {
                        return Err(SubmitError::UserCancelled);
                    }
                }
                RetryDecision::GiveUp(reason) => {
                    if reason == GiveUpReason::Exhausted {
                        tracing::debug!(request_id = %request_id, attempts = attempt + 1, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Cancel every in-flight submission, interrupting network calls and
    /// retry waits, and force the visible state to cancelled. Idempotent.
    pub fn cancel_all(&self) {
        let cancelled = self.dedup.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled pending submissions");
        }
        let changed = self.state.send_if_modified(|state| {
            let changed = state.stage != Stage::Cancelled(CancelReason::User)
                || state.is_submitting
                || state.pending != 0;
            state.is_submitting = false;
            state.is_retrying = false;
            state.stage = Stage::Cancelled(CancelReason::User);
            state.pending = 0;
            changed
        });
        if changed {
            self.progress(Stage::Cancelled(CancelReason::User));
        }
    }

    /// Enforce the minimum spacing between accepted submissions.
    fn throttle(&self, quality: ConnectionQuality) -> std::result::Result<(), Duration> {
        let min_interval = self.scheduler.min_interval(quality);
        let now = Instant::now();
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = now.duration_since(previous);
            if elapsed < min_interval {
                return Err(min_interval - elapsed);
            }
        }
        *last = Some(now);
        Ok(())
    }

    /// Apply `update` only while `request_id` is the submission the state
    /// currently describes.
    fn transition(&self, request_id: &RequestId, update: impl FnOnce(&mut SubmissionState)) {
        let pending = self.dedup.in_flight();
        self.state.send_modify(|state| {
            state.pending = pending;
            if state.request_id.as_ref() == Some(request_id)
                && state.stage != Stage::Cancelled(CancelReason::User)
            {
                update(state);
            }
        });
    }

    /// Settle `request_id`. The pending count always reflects the slots
    /// still held; the stage only moves for the submission the state
    /// describes, and never off a user cancel.
    fn finish(&self, request_id: &RequestId, stage: Stage) {
        let pending = self.dedup.in_flight();
        self.state.send_modify(|state| {
            state.pending = pending;
            state.is_submitting = pending > 0;
            if state.request_id.as_ref() == Some(request_id)
                && state.stage != Stage::Cancelled(CancelReason::User)
            {
                state.stage = stage;
                state.is_retrying = false;
            }
        });
        self.progress(stage);
    }

    fn progress(&self, stage: Stage) {
        self.observer.on_progress(&stage);
    }

    fn issue(&self, issue: ConnectionIssue) {
        self.observer.on_connection_issue(&issue);
    }
}

fn cancel_error(reason: CancelReason, timeout: Duration) -> SubmitError {
    match reason {
        CancelReason::Timeout => SubmitError::TimedOut { timeout },
        CancelReason::User => SubmitError::UserCancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stage_labels() {
        assert_eq!(Stage::Retrying { attempt: 1, max: 3 }.to_string(), "Retrying (1/3)");
        assert_eq!(Stage::Cancelled(CancelReason::Timeout).to_string(), "Timed out");
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Retrying { attempt: 1, max: 2 }.is_terminal());
    }

    #[test]
    fn rate_limit_message_rounds_up_to_seconds() {
        let issue = ConnectionIssue::RateLimited {
            retry_after: Duration::from_millis(2_100),
        };
        assert_eq!(
            issue.to_string(),
            "Please wait 3s before sending another request"
        );
    }
}
