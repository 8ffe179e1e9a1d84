//! Payload fingerprints and in-flight deduplication.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use portal_async_utils::{CancelReason, CancelSignal};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

/// Deterministic digest of a submission payload.
///
/// Computed as SHA-256 over the payload's `serde_json` encoding. Field order
/// follows the payload's `Serialize` impl, so repeated calls on an unchanged
/// value always agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of<T: Serialize + ?Sized>(payload: &T) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_vec(payload)?;
        let digest = Sha256::digest(&encoded);
        Ok(Self(format!("{digest:x}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Identifier for one accepted submission (all of its attempts).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(format!("req_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    Granted,
    Rejected {
        reason: DuplicateReason,
        /// Owner of the slot when the duplicate is still in flight.
        existing: Option<RequestId>,
    },
}

impl AcquireResult {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireResult::Granted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    InFlight,
    RecentlyCompleted { age: Duration },
}

/// How the owner of a fingerprint slot finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The server accepted the submission; repeats stay suppressed until the
    /// window elapses.
    Completed,
    /// Failed, timed out or cancelled; the slot frees immediately.
    Abandoned,
}

#[derive(Debug)]
struct InFlightEntry {
    request_id: RequestId,
    started_at: Instant,
    signal: CancelSignal,
}

#[derive(Debug, Default)]
struct DedupState {
    in_flight: HashMap<Fingerprint, InFlightEntry>,
    completed: HashMap<Fingerprint, Instant>,
}

/// Tracks in-flight and recently completed fingerprints.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    state: Mutex<DedupState>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(DedupState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `fingerprint` for `request_id`. The caller owns the slot until it
    /// calls [`Deduplicator::release`].
    pub fn try_acquire(
        &self,
        fingerprint: &Fingerprint,
        request_id: &RequestId,
        signal: &CancelSignal,
    ) -> AcquireResult {
        let now = Instant::now();
        let mut state = self.lock();

        let window = self.window;
        state
            .completed
            .retain(|_, finished_at| now.duration_since(*finished_at) < window);

        if let Some(entry) = state.in_flight.get(fingerprint) {
            return AcquireResult::Rejected {
                reason: DuplicateReason::InFlight,
                existing: Some(entry.request_id.clone()),
            };
        }
        if let Some(finished_at) = state.completed.get(fingerprint) {
            return AcquireResult::Rejected {
                reason: DuplicateReason::RecentlyCompleted {
                    age: now.duration_since(*finished_at),
                },
                existing: None,
            };
        }

        state.in_flight.insert(
            fingerprint.clone(),
            InFlightEntry {
                request_id: request_id.clone(),
                started_at: now,
                signal: signal.clone(),
            },
        );
        AcquireResult::Granted
    }

    /// Free the slot held by `request_id`. Unknown fingerprints, foreign
    /// request ids and repeated calls are ignored.
    pub fn release(
        &self,
        fingerprint: &Fingerprint,
        request_id: &RequestId,
        outcome: ReleaseOutcome,
    ) {
        let mut state = self.lock();
        let owned = state
            .in_flight
            .get(fingerprint)
            .is_some_and(|entry| &entry.request_id == request_id);
        if !owned {
            return;
        }

        if let Some(entry) = state.in_flight.remove(fingerprint) {
            tracing::trace!(
                fingerprint = %fingerprint,
                request_id = %entry.request_id,
                held_ms = entry.started_at.elapsed().as_millis() as u64,
                ?outcome,
                "released fingerprint"
            );
        }
        if outcome == ReleaseOutcome::Completed {
            state.completed.insert(fingerprint.clone(), Instant::now());
        }
    }

    /// Cancel every in-flight entry on behalf of the user and forget them.
    /// Returns how many entries were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<InFlightEntry> = {
            let mut state = self.lock();
            state.in_flight.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.signal.cancel(CancelReason::User);
        }
        drained.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    #[cfg(test)]
    fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().in_flight.contains_key(fingerprint)
    }
}
