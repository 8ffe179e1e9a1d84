//! Per-attempt timeouts and cancellation tokens.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use portal_async_utils::{CancelReason, CancelSignal};
use tokio::task::JoinHandle;

use crate::quality::ConnectionQuality;

/// Base timeout stretched for the current link quality.
pub fn scaled_timeout(base: Duration, quality: ConnectionQuality) -> Duration {
    base.mul_f64(quality.timeout_multiplier())
}

/// Arms one timer per attempt and counts how many are still live.
#[derive(Debug, Clone, Default)]
pub struct TimeoutManager {
    live: Arc<AtomicUsize>,
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh attempt token under `parent` that fires with
    /// [`CancelReason::Timeout`] once the scaled timeout elapses.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(
        &self,
        parent: &CancelSignal,
        base: Duration,
        quality: ConnectionQuality,
    ) -> ArmedTimeout {
        let timeout = scaled_timeout(base, quality);
        let signal = parent.child();

        let timer_signal = signal.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timer_signal.cancel(CancelReason::Timeout),
                _ = timer_signal.cancelled() => {}
            }
        });

        self.live.fetch_add(1, Ordering::SeqCst);
        ArmedTimeout {
            signal,
            timeout,
            timer: Some(timer),
            live: Arc::clone(&self.live),
        }
    }

    /// Timers armed and not yet disarmed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// A live attempt token. Dropping it disarms the timer.
#[derive(Debug)]
pub struct ArmedTimeout {
    signal: CancelSignal,
    timeout: Duration,
    timer: Option<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
}

impl ArmedTimeout {
    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cancel this attempt on behalf of the user.
    pub fn cancel(&self) {
        self.signal.cancel(CancelReason::User);
    }

    pub fn timed_out(&self) -> bool {
        self.signal.reason() == Some(CancelReason::Timeout)
    }

    pub fn disarm(self) {}
}

impl Drop for ArmedTimeout {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASE: Duration = Duration::from_secs(10);

    #[test]
    fn poor_quality_doubles_timeout() {
        assert_eq!(scaled_timeout(BASE, ConnectionQuality::Excellent), BASE);
        assert_eq!(
            scaled_timeout(BASE, ConnectionQuality::Good),
            Duration::from_secs(15)
        );
        assert_eq!(
            scaled_timeout(BASE, ConnectionQuality::Poor),
            Duration::from_secs(20)
        );
        assert!(
            scaled_timeout(BASE, ConnectionQuality::Poor)
                > scaled_timeout(BASE, ConnectionQuality::Excellent)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn signal_fires_with_timeout_reason_on_expiry() {
        let manager = TimeoutManager::new();
        let session = CancelSignal::new();
        let armed = manager.arm(&session, BASE, ConnectionQuality::Excellent);

        tokio::time::sleep(BASE - Duration::from_millis(1)).await;
        assert!(!armed.signal().is_cancelled());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(armed.timed_out());
        assert!(!session.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_cancel_reports_user_reason() {
        let manager = TimeoutManager::new();
        let armed = manager.arm(&CancelSignal::new(), BASE, ConnectionQuality::Excellent);

        armed.cancel();

        assert_eq!(armed.signal().reason(), Some(CancelReason::User));
        assert!(!armed.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_releases_timer_and_never_fires() {
        let manager = TimeoutManager::new();
        let armed = manager.arm(&CancelSignal::new(), BASE, ConnectionQuality::Excellent);
        let signal = armed.signal().clone();
        assert_eq!(manager.live(), 1);

        armed.disarm();
        assert_eq!(manager.live(), 0);

        tokio::time::sleep(BASE * 2).await;
        assert!(!signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn each_attempt_gets_a_fresh_token() {
        let manager = TimeoutManager::new();
        let session = CancelSignal::new();

        let first = manager.arm(&session, BASE, ConnectionQuality::Excellent);
        first.cancel();
        let second = manager.arm(&session, BASE, ConnectionQuality::Excellent);

        assert!(first.signal().is_cancelled());
        assert!(!second.signal().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn session_cancel_propagates_to_attempt() {
        let manager = TimeoutManager::new();
        let session = CancelSignal::new();
        let armed = manager.arm(&session, BASE, ConnectionQuality::Poor);

        session.cancel(CancelReason::User);

        assert_eq!(armed.signal().reason(), Some(CancelReason::User));
    }
}
