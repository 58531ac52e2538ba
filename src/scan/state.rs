use crate::interpreter::Prediction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Scan loop lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Starting => "starting",
            ScanState::Running => "running",
            ScanState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cycle counters since the controller was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub results_discarded: u64,
    pub manual_scans: u64,
}

/// Point-in-time view of a controller
#[derive(Debug, Clone, Serialize)]
pub struct ScanSession {
    pub state: ScanState,
    pub is_running: bool,
    pub backend_ready: bool,
    pub in_flight: bool,
    pub last_prediction: Option<Prediction>,
    /// Identifies the current start/stop session, if any
    pub session_id: Option<Uuid>,
    pub consecutive_failures: u32,
    pub stats: ScanStats,
}

#[derive(Debug, Default)]
pub(super) struct StatCounters {
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub discarded: AtomicU64,
    pub manual: AtomicU64,
}

impl StatCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScanStats {
        ScanStats {
            cycles_started: self.started.load(Ordering::Relaxed),
            cycles_completed: self.completed.load(Ordering::Relaxed),
            cycles_failed: self.failed.load(Ordering::Relaxed),
            results_discarded: self.discarded.load(Ordering::Relaxed),
            manual_scans: self.manual.load(Ordering::Relaxed),
        }
    }
}

/// Running loop task owned by the controller
pub(super) struct LoopHandle {
    pub session_id: Uuid,
    pub token: CancellationToken,
    pub task: Option<JoinHandle<()>>,
}

/// State guarded by one lock so results, stops and halts agree on the
/// generation.
///
/// `generation` is bumped on every start and stop; a cycle applies its
/// result only while the generation it started under is still current.
pub(super) struct Control {
    pub state: ScanState,
    pub generation: u64,
    pub handle: Option<LoopHandle>,
}

impl Control {
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            generation: 0,
            handle: None,
        }
    }
}

/// Exclusive claim on the single capture slot, released on drop
pub(super) struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
