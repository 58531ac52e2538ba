use super::state::{Control, InFlightGuard, LoopHandle, ScanSession, ScanState, StatCounters};
use crate::camera::ImageCapture;
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::events::{EventBus, ScanEvent};
use crate::inference::InferenceAdapter;
use crate::interpreter::{Prediction, ResultInterpreter};
use crate::preprocess::FramePreprocessor;
use crate::recovery::{FailureTracker, RateLimitGate};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(super) struct Inner {
    pub camera: Arc<dyn ImageCapture>,
    pub adapter: Arc<dyn InferenceAdapter>,
    pub preprocessor: FramePreprocessor,
    pub interpreter: ResultInterpreter,
    pub config: ScanConfig,
    pub event_bus: EventBus,

    pub control: Mutex<Control>,
    pub backend_ready: AtomicBool,
    pub in_flight: Arc<AtomicBool>,
    pub last_prediction: RwLock<Option<Prediction>>,
    pub rate_gate: RateLimitGate,
    pub failures: FailureTracker,
    pub stats: StatCounters,
    pub cycle_counter: AtomicU64,

    /// Serializes start/stop
    pub lifecycle: tokio::sync::Mutex<()>,
    /// Fires on shutdown; cancels a pending auto-start
    pub closing: CancellationToken,
}

/// Drives repeated capture -> preprocess -> infer -> interpret cycles.
///
/// `Idle -> Starting -> Running -> Stopping -> Idle`. Starting requires a
/// ready backend. At most one cycle is in flight at any time, whether it was
/// started by the loop or by [`scan_once`](Self::scan_once). Results that
/// resolve after `stop` are dropped. Cloning yields another handle to the
/// same controller.
#[derive(Clone)]
pub struct ScanLoopController {
    pub(super) inner: Arc<Inner>,
}

impl ScanLoopController {
    pub fn new(
        camera: Arc<dyn ImageCapture>,
        adapter: Arc<dyn InferenceAdapter>,
        preprocessor: FramePreprocessor,
        interpreter: ResultInterpreter,
        config: ScanConfig,
        event_bus: EventBus,
    ) -> Self {
        let failures = FailureTracker::new(config.max_consecutive_failures);
        Self {
            inner: Arc::new(Inner {
                camera,
                adapter,
                preprocessor,
                interpreter,
                config,
                event_bus,
                control: Mutex::new(Control::new()),
                backend_ready: AtomicBool::new(false),
                in_flight: Arc::new(AtomicBool::new(false)),
                last_prediction: RwLock::new(None),
                rate_gate: RateLimitGate::new(),
                failures,
                stats: StatCounters::default(),
                cycle_counter: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                closing: CancellationToken::new(),
            }),
        }
    }

    /// Initialize the backend and record whether it is ready.
    ///
    /// On success with `auto_start` enabled, the loop starts after the
    /// configured settling delay unless the controller is shut down first.
    pub async fn initialize_backend(&self) -> bool {
        let backend = self.inner.adapter.name().to_string();
        let ready = self.inner.adapter.initialize().await;
        self.inner.backend_ready.store(ready, Ordering::Release);

        if !ready {
            self.inner
                .event_bus
                .publish(ScanEvent::BackendUnavailable {
                    backend,
                    reason: "initialization failed".to_string(),
                })
                .await;
            return false;
        }

        self.inner
            .event_bus
            .publish(ScanEvent::BackendReady { backend })
            .await;

        if self.inner.config.auto_start {
            let controller = self.clone();
            let delay = self.inner.config.auto_start_delay();
            let closing = self.inner.closing.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = closing.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = controller.start().await {
                            debug!("Auto-start skipped: {}", e);
                        }
                    }
                }
            });
        }

        true
    }

    /// Begin the repeating scan loop
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if !self.is_backend_ready() {
            return Err(ScanError::BackendNotReady);
        }

        let session_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let generation = {
            let mut control = self.inner.control.lock();
            if control.state != ScanState::Idle {
                return Err(ScanError::InvalidState {
                    operation: "start",
                    state: control.state.to_string(),
                });
            }
            control.state = ScanState::Starting;
            control.generation += 1;
            control.handle = Some(LoopHandle {
                session_id,
                token: token.clone(),
                task: None,
            });
            control.generation
        };
        self.publish_transition(ScanState::Idle, ScanState::Starting)
            .await;

        self.inner.failures.reset();
        let task = tokio::spawn(super::cycle::run_loop(
            Arc::clone(&self.inner),
            generation,
            token,
        ));

        // The loop may already have halted itself
        if let Some(handle) = self
            .inner
            .control
            .lock()
            .handle
            .as_mut()
            .filter(|h| h.session_id == session_id)
        {
            handle.task = Some(task);
        }

        info!("Scan loop started (session {})", session_id);
        Ok(())
    }

    /// Stop the loop. An in-flight cycle is allowed to finish for up to the
    /// configured grace period, then detached; its result is discarded either
    /// way.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let (from, handle) = {
            let mut control = self.inner.control.lock();
            let from = control.state;
            if !matches!(from, ScanState::Running | ScanState::Starting) {
                return Err(ScanError::InvalidState {
                    operation: "stop",
                    state: from.to_string(),
                });
            }
            control.state = ScanState::Stopping;
            control.generation += 1;
            (from, control.handle.take())
        };
        self.publish_transition(from, ScanState::Stopping).await;

        if let Some(mut handle) = handle {
            handle.token.cancel();
            if let Some(task) = handle.task.take() {
                let grace = self.inner.config.stop_grace();
                if tokio::time::timeout(grace, task).await.is_err() {
                    warn!(
                        "In-flight cycle still running after {}ms, detaching it",
                        grace.as_millis()
                    );
                }
            }
            info!("Scan loop stopped (session {})", handle.session_id);
        }

        self.inner.control.lock().state = ScanState::Idle;
        self.publish_transition(ScanState::Stopping, ScanState::Idle)
            .await;
        Ok(())
    }

    /// Run one cycle outside the loop, e.g. a manual capture button.
    ///
    /// Refused with `RateLimited` (carrying the remaining wait) while a 429
    /// backoff is active, and with `CycleInFlight` while another cycle runs.
    pub async fn scan_once(&self) -> Result<Prediction> {
        if !self.is_backend_ready() {
            return Err(ScanError::BackendNotReady);
        }
        if let Err(e) = self.inner.rate_gate.check() {
            if let ScanError::RateLimited { retry_after } = &e {
                self.inner
                    .event_bus
                    .publish(ScanEvent::RateLimited {
                        retry_after: *retry_after,
                    })
                    .await;
            }
            return Err(e);
        }

        let _guard = InFlightGuard::acquire(&self.inner.in_flight).ok_or(ScanError::CycleInFlight)?;
        let generation = self.inner.control.lock().generation;
        StatCounters::bump(&self.inner.stats.manual);

        self.inner.execute(generation, true).await
    }

    /// Stop the loop if it runs and cancel any pending auto-start
    pub async fn shutdown(&self) {
        self.inner.closing.cancel();
        match self.stop().await {
            Ok(()) | Err(ScanError::InvalidState { .. }) => {}
            Err(e) => warn!("Error stopping scan loop: {}", e),
        }
    }

    pub fn state(&self) -> ScanState {
        self.inner.control.lock().state
    }

    /// Ready only while the last initialization succeeded and the adapter
    /// has not lost its backend since
    pub fn is_backend_ready(&self) -> bool {
        self.inner.backend_ready.load(Ordering::Acquire) && self.inner.adapter.is_ready()
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn last_prediction(&self) -> Option<Prediction> {
        self.inner.last_prediction.read().clone()
    }

    pub fn backend_name(&self) -> &str {
        self.inner.adapter.name()
    }

    pub fn session(&self) -> ScanSession {
        let (state, session_id) = {
            let control = self.inner.control.lock();
            (
                control.state,
                control.handle.as_ref().map(|h| h.session_id),
            )
        };

        ScanSession {
            state,
            is_running: matches!(state, ScanState::Starting | ScanState::Running),
            backend_ready: self.is_backend_ready(),
            in_flight: self.is_in_flight(),
            last_prediction: self.last_prediction(),
            session_id,
            consecutive_failures: self.inner.failures.consecutive_failures(),
            stats: self.inner.stats.snapshot(),
        }
    }

    async fn publish_transition(&self, from: ScanState, to: ScanState) {
        self.inner.publish_transition(from, to).await;
    }
}

impl Inner {
    pub(super) async fn publish_transition(&self, from: ScanState, to: ScanState) {
        debug!("Scan loop {} -> {}", from, to);
        self.event_bus
            .publish(ScanEvent::LoopStateChanged { from, to })
            .await;
    }
}
