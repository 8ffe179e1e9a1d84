//! Async utilities for cancellation-aware futures.
//!
//! Provides [`CancelSignal`], a cloneable cancellation handle that remembers
//! *why* it was cancelled, and the `OrCancelExt` trait for racing any future
//! against such a signal.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a [`CancelSignal`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// An armed timer expired.
    Timeout,
    /// Someone called `cancel` on behalf of the user (teardown, cancel button).
    User,
}

/// Error returned when a future is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled(CancelReason),
}

impl CancelErr {
    pub fn reason(self) -> CancelReason {
        match self {
            CancelErr::Cancelled(reason) => reason,
        }
    }
}

/// Cooperative cancellation signal with a first-writer-wins reason.
///
/// Children created with [`CancelSignal::child`] fire whenever their parent
/// fires and report the parent's reason unless they recorded their own first.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    parent: Option<Arc<CancelSignal>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a signal that is cancelled when `self` is, but can also be
    /// cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Cancel with `reason`. Only the first reason is kept; later calls are
    /// no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason this signal fired, or `None` while it is still live.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.recorded_reason()
    }

    fn recorded_reason(&self) -> Option<CancelReason> {
        self.reason
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.recorded_reason()))
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The underlying token, for APIs that only understand `CancellationToken`.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn cancel_err(&self) -> CancelErr {
        // A token cancelled through `CancellationToken::cancel` directly has no
        // recorded reason; treat it as a user request.
        CancelErr::Cancelled(self.recorded_reason().unwrap_or(CancelReason::User))
    }
}

/// Extension trait for making futures cancellable.
///
/// Allows any future to race against a [`CancelSignal`], returning
/// `Err(CancelErr::Cancelled(reason))` if the signal fires before the future
/// completes.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against the signal.
    async fn or_cancel(self, signal: &CancelSignal) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, signal: &CancelSignal) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(signal.cancel_err()),
            res = self => Ok(res),
        }
    }
}

/// Sleep for `duration` unless `signal` fires first.
pub async fn sleep_or_cancel(duration: Duration, signal: &CancelSignal) -> Result<(), CancelErr> {
    if signal.is_cancelled() {
        return Err(signal.cancel_err());
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::time::sleep(duration).or_cancel(signal).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::task;
    use tokio::time::sleep;

    #[tokio::test]
    async fn returns_ok_when_future_completes_first() {
        let signal = CancelSignal::new();

        let result = async { 42 }.or_cancel(&signal).await;

        assert_eq!(Ok(42), result);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_reason_when_signal_fires_first() {
        let signal = CancelSignal::new();
        let signal_clone = signal.clone();

        let cancel_handle = task::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            signal_clone.cancel(CancelReason::Timeout);
        });

        let result = async {
            sleep(Duration::from_millis(100)).await;
            7
        }
        .or_cancel(&signal)
        .await;

        cancel_handle.await.expect("cancel task panicked");
        assert_eq!(Err(CancelErr::Cancelled(CancelReason::Timeout)), result);
    }

    #[test]
    fn first_reason_wins() {
        let signal = CancelSignal::new();
        assert_eq!(None, signal.reason());

        signal.cancel(CancelReason::Timeout);
        signal.cancel(CancelReason::User);

        assert_eq!(Some(CancelReason::Timeout), signal.reason());
    }

    #[test]
    fn child_inherits_parent_reason() {
        let parent = CancelSignal::new();
        let child = parent.child();

        parent.cancel(CancelReason::User);

        assert!(child.is_cancelled());
        assert_eq!(Some(CancelReason::User), child.reason());
    }

    #[test]
    fn child_cancel_leaves_parent_live() {
        let parent = CancelSignal::new();
        let child = parent.child();

        child.cancel(CancelReason::Timeout);

        assert!(!parent.is_cancelled());
        assert_eq!(Some(CancelReason::Timeout), child.reason());
    }

    #[tokio::test]
    async fn sleep_or_cancel_rejects_already_cancelled_signal() {
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::User);

        let result = sleep_or_cancel(Duration::ZERO, &signal).await;

        assert_eq!(Err(CancelErr::Cancelled(CancelReason::User)), result);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_or_cancel_completes_when_not_cancelled() {
        let signal = CancelSignal::new();

        let result = sleep_or_cancel(Duration::from_secs(3), &signal).await;

        assert_eq!(Ok(()), result);
    }
}
