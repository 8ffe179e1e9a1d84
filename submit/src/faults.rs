//! Fault injection for exercising retry paths.
//!
//! Feature-gated behind `dev-faults` to prevent accidental production use.
//!
//! ## Supported Fault Types
//! - **disconnect**: the attempt fails with a transport error
//! - **5xx**: the attempt fails with HTTP 503
//! - **timeout**: the attempt hangs until its deadline fires
//!
//! ## Configuration via Environment Variables
//! ```bash
//! PORTAL_FAULTS=disconnect:2,5xx:1,timeout:1
//! ```
//!
//! Faults are consumed in the order listed above, one per attempt, before
//! the wrapped submitter is reached.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use portal_async_utils::CancelSignal;
use rand::Rng;

use crate::coordinator::Submitter;
use crate::error::{Result, SubmitError};
use crate::quality::{EffectiveType, NetworkSignals, QualitySignal, SignalError};

/// Environment variable holding the fault plan.
pub const FAULTS_ENV: &str = "PORTAL_FAULTS";

/// Fault injected into a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Disconnect,
    ServerError,
    Timeout,
}

/// Remaining fault budget per kind.
#[derive(Debug, Default)]
pub struct FaultPlan {
    disconnect: AtomicUsize,
    server_error: AtomicUsize,
    timeout: AtomicUsize,
}

impl FaultPlan {
    /// Parse `disconnect:2,5xx:1,timeout:1`. Unknown labels are logged and
    /// skipped.
    pub fn parse(entries: &str) -> Self {
        let plan = Self::default();
        for entry in entries.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some((label, count)) = entry.split_once(':')
                && let Ok(num) = count.trim().parse::<usize>()
            {
                match label.trim() {
                    "disconnect" => plan.disconnect.store(num, Ordering::Relaxed),
                    "5xx" | "server_error" => plan.server_error.store(num, Ordering::Relaxed),
                    "timeout" => plan.timeout.store(num, Ordering::Relaxed),
                    other => tracing::warn!("[faults] Unknown fault type: {other}"),
                }
            } else {
                tracing::warn!("[faults] Malformed fault entry: {entry}");
            }
        }
        plan
    }

    /// Plan from [`FAULTS_ENV`]; empty when unset.
    pub fn from_env() -> Self {
        let plan = std::env::var(FAULTS_ENV)
            .map(|value| Self::parse(&value))
            .unwrap_or_default();
        if !plan.is_empty() {
            tracing::info!(
                disconnect = plan.disconnect.load(Ordering::Relaxed),
                server_error = plan.server_error.load(Ordering::Relaxed),
                timeout = plan.timeout.load(Ordering::Relaxed),
                "[faults] fault injection enabled"
            );
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.disconnect.load(Ordering::Relaxed) == 0
            && self.server_error.load(Ordering::Relaxed) == 0
            && self.timeout.load(Ordering::Relaxed) == 0
    }

    /// Take the next fault, if any budget remains.
    pub fn next_fault(&self) -> Option<InjectedFault> {
        [
            (&self.disconnect, InjectedFault::Disconnect),
            (&self.server_error, InjectedFault::ServerError),
            (&self.timeout, InjectedFault::Timeout),
        ]
        .into_iter()
        .find_map(|(counter, fault)| take_one(counter).then_some(fault))
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Wraps a submitter and fails attempts according to a [`FaultPlan`].
#[derive(Debug)]
pub struct FaultySubmitter<S> {
    inner: S,
    plan: FaultPlan,
}

impl<S> FaultySubmitter<S> {
    pub fn new(inner: S, plan: FaultPlan) -> Self {
        Self { inner, plan }
    }

    pub fn from_env(inner: S) -> Self {
        Self::new(inner, FaultPlan::from_env())
    }
}

#[async_trait]
impl<S: Submitter> Submitter for FaultySubmitter<S> {
    type Payload = S::Payload;
    type Output = S::Output;

    async fn submit(&self, payload: &Self::Payload, signal: CancelSignal) -> Result<Self::Output> {
        match self.plan.next_fault() {
            None => self.inner.submit(payload, signal).await,
            Some(fault) => {
                tracing::warn!(?fault, "[faults] injecting fault");
                match fault {
                    InjectedFault::Disconnect => Err(SubmitError::Network(
                        "injected disconnect".to_string(),
                    )),
                    InjectedFault::ServerError => {
                        Err(SubmitError::from_status(503, "injected server error"))
                    }
                    InjectedFault::Timeout => {
                        signal.cancelled().await;
                        Err(SubmitError::Network("injected hang".to_string()))
                    }
                }
            }
        }
    }
}

/// Quality signal that flips between random link conditions on every read.
#[derive(Debug, Clone)]
pub struct RandomSignal {
    offline_probability: f64,
}

impl Default for RandomSignal {
    fn default() -> Self {
        Self {
            offline_probability: 0.05,
        }
    }
}

impl RandomSignal {
    pub fn with_offline_probability(probability: f64) -> Self {
        Self {
            offline_probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl QualitySignal for RandomSignal {
    fn read(&self) -> std::result::Result<NetworkSignals, SignalError> {
        let mut rng = rand::rng();
        if rng.random_bool(self.offline_probability) {
            return Ok(NetworkSignals::offline());
        }
        let effective_type = match rng.random_range(0..4u8) {
            0 => EffectiveType::Slow2g,
            1 => EffectiveType::TwoG,
            2 => EffectiveType::ThreeG,
            _ => EffectiveType::FourG,
        };
        Ok(NetworkSignals::online().with_effective_type(effective_type))
    }
}
