//! Connection quality sensing.
//!
//! The monitor never performs network calls of its own. It reads whatever
//! local signals the platform exposes through a [`QualitySignal`] and maps
//! them onto the [`ConnectionQuality`] scale. Missing or unreadable signals
//! map to `Excellent` so that absent telemetry never blocks a submission.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default sampling period for [`QualityMonitor::spawn`].
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Ordinal classification of the current network condition.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    #[default]
    Excellent,
    Good,
    Poor,
    Offline,
}

impl ConnectionQuality {
    /// Factor applied to the base attempt timeout and to the submit throttle.
    pub fn timeout_multiplier(self) -> f64 {
        match self {
            ConnectionQuality::Excellent => 1.0,
            ConnectionQuality::Good => 1.5,
            ConnectionQuality::Poor | ConnectionQuality::Offline => 2.0,
        }
    }

    pub fn is_degraded(self) -> bool {
        self >= ConnectionQuality::Poor
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Offline => "offline",
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective link type as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl FromStr for EffectiveType {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => Ok(EffectiveType::Slow2g),
            "2g" => Ok(EffectiveType::TwoG),
            "3g" => Ok(EffectiveType::ThreeG),
            "4g" => Ok(EffectiveType::FourG),
            other => Err(SignalError::Read(format!("unknown effective type '{other}'"))),
        }
    }
}

/// Raw signals read from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSignals {
    pub online: bool,
    pub effective_type: Option<EffectiveType>,
}

impl NetworkSignals {
    pub fn online() -> Self {
        Self {
            online: true,
            effective_type: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            effective_type: None,
        }
    }

    pub fn with_effective_type(mut self, effective_type: EffectiveType) -> Self {
        self.effective_type = Some(effective_type);
        self
    }

    pub fn classify(self) -> ConnectionQuality {
        if !self.online {
            return ConnectionQuality::Offline;
        }
        match self.effective_type {
            Some(EffectiveType::Slow2g | EffectiveType::TwoG) => ConnectionQuality::Poor,
            Some(EffectiveType::ThreeG) => ConnectionQuality::Good,
            Some(EffectiveType::FourG) | None => ConnectionQuality::Excellent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("network signal unavailable on this platform")]
    Unavailable,

    #[error("failed to read network signal: {0}")]
    Read(String),
}

/// Source of platform network signals.
pub trait QualitySignal: Send + Sync {
    fn read(&self) -> Result<NetworkSignals, SignalError>;
}

impl<F> QualitySignal for F
where
    F: Fn() -> Result<NetworkSignals, SignalError> + Send + Sync,
{
    fn read(&self) -> Result<NetworkSignals, SignalError> {
        self()
    }
}

/// Signal with a value set by the host (UI shell, tests).
#[derive(Debug, Default)]
pub struct StaticSignal {
    current: Mutex<Option<NetworkSignals>>,
}

impl StaticSignal {
    pub fn new(signals: NetworkSignals) -> Self {
        Self {
            current: Mutex::new(Some(signals)),
        }
    }

    /// A signal that always reports [`SignalError::Unavailable`].
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn set(&self, signals: NetworkSignals) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(signals);
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl QualitySignal for StaticSignal {
    fn read(&self) -> Result<NetworkSignals, SignalError> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        (*current).ok_or(SignalError::Unavailable)
    }
}

/// Linux signal: online when any non-loopback interface under
/// `/sys/class/net` reports `operstate` `up`. Link type is not exposed there.
#[derive(Debug, Clone)]
pub struct SysfsSignal {
    root: PathBuf,
}

impl Default for SysfsSignal {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/class/net"),
        }
    }
}

impl SysfsSignal {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl QualitySignal for SysfsSignal {
    fn read(&self) -> Result<NetworkSignals, SignalError> {
        let entries = std::fs::read_dir(&self.root).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                SignalError::Unavailable
            } else {
                SignalError::Read(format!("{}: {err}", self.root.display()))
            }
        })?;

        let mut online = false;
        for entry in entries.flatten() {
            if entry.file_name() == "lo" {
                continue;
            }
            let state = std::fs::read_to_string(entry.path().join("operstate")).unwrap_or_default();
            if state.trim() == "up" {
                online = true;
                break;
            }
        }

        Ok(NetworkSignals {
            online,
            effective_type: None,
        })
    }
}

/// Samples a [`QualitySignal`] and publishes the latest classification.
///
/// Cheap to clone; clones share the same snapshot.
#[derive(Clone)]
pub struct QualityMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    signal: Arc<dyn QualitySignal>,
    tx: watch::Sender<ConnectionQuality>,
}

impl fmt::Debug for QualityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityMonitor")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new(Arc::new(StaticSignal::unavailable()))
    }
}

impl QualityMonitor {
    pub fn new(signal: Arc<dyn QualitySignal>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionQuality::default());
        Self {
            inner: Arc::new(MonitorInner { signal, tx }),
        }
    }

    /// Read the signal now and update the snapshot.
    pub fn sample(&self) -> ConnectionQuality {
        let quality = match self.inner.signal.read() {
            Ok(signals) => signals.classify(),
            Err(err) => {
                tracing::debug!(error = %err, "network signal unreadable, assuming excellent");
                ConnectionQuality::Excellent
            }
        };

        let previous = *self.inner.tx.borrow();
        self.inner.tx.send_if_modified(|current| {
            if *current == quality {
                false
            } else {
                *current = quality;
                true
            }
        });

        if quality != previous {
            if quality.is_degraded() {
                tracing::warn!(from = %previous, to = %quality, "connection quality degraded");
            } else {
                tracing::info!(from = %previous, to = %quality, "connection quality changed");
            }
        }
        quality
    }

    /// Last sampled quality without touching the signal.
    pub fn snapshot(&self) -> ConnectionQuality {
        *self.inner.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionQuality> {
        self.inner.tx.subscribe()
    }

    /// Sample on a fixed period until the returned handle is dropped.
    pub fn spawn(&self, period: Duration) -> MonitorHandle {
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.sample();
            }
        });
        MonitorHandle { task }
    }
}

/// Stops periodic sampling when dropped.
#[derive(Debug)]
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn from_task(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn stop(self) {}
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
