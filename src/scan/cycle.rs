use super::controller::Inner;
use super::state::{InFlightGuard, ScanState, StatCounters};
use crate::error::{Result, ScanError};
use crate::events::ScanEvent;
use crate::inference::{BackendInput, InputKind};
use crate::interpreter::Prediction;
use crate::recovery::RecoveryAction;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

impl Inner {
    /// capture -> preprocess -> infer -> interpret
    async fn run_cycle(&self) -> Result<(Prediction, Duration)> {
        let frame = self.camera.capture().await?;
        trace!("Cycle captured frame {} ({}x{})", frame.id, frame.width, frame.height);

        let input = match self.adapter.input_kind() {
            InputKind::Tensor => BackendInput::Tensor(self.preprocessor.prepare(&frame)?),
            InputKind::EncodedImage => {
                BackendInput::Image(self.preprocessor.encode_for_upload(&frame)?)
            }
        };
        drop(frame);

        let output = match self.adapter.infer(input).await {
            Ok(output) => output,
            Err(ScanError::RateLimited { retry_after }) => {
                self.rate_gate.note(retry_after);
                return Err(ScanError::RateLimited { retry_after });
            }
            Err(e) => return Err(e),
        };

        let prediction = self.interpreter.interpret(&output.scores)?;
        Ok((prediction, output.elapsed))
    }

    /// Store a prediction unless the generation it started under has ended
    fn apply(&self, generation: u64, prediction: &Prediction) -> bool {
        let control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        *self.last_prediction.write() = Some(prediction.clone());
        true
    }

    /// One cycle with bookkeeping and events. The caller holds the in-flight
    /// guard.
    pub(super) async fn execute(&self, generation: u64, manual: bool) -> Result<Prediction> {
        let cycle_id = self.cycle_counter.fetch_add(1, Ordering::Relaxed) + 1;
        StatCounters::bump(&self.stats.started);
        self.event_bus
            .publish(ScanEvent::CycleStarted { cycle_id, manual })
            .await;

        match self.run_cycle().await {
            Ok((prediction, elapsed)) => {
                self.failures.record_success();
                let inference_ms = elapsed.as_millis() as u64;

                if self.apply(generation, &prediction) {
                    StatCounters::bump(&self.stats.completed);
                    info!(
                        "Detected {} ({:.1}%){}",
                        prediction.class_name(),
                        prediction.confidence * 100.0,
                        if prediction.actionable { "" } else { " below threshold" }
                    );
                    self.event_bus
                        .publish(ScanEvent::PredictionReady {
                            cycle_id,
                            prediction: prediction.clone(),
                            inference_ms,
                        })
                        .await;
                } else {
                    StatCounters::bump(&self.stats.discarded);
                    debug!("Discarding result of cycle {} after stop", cycle_id);
                    self.event_bus
                        .publish(ScanEvent::ResultDiscarded { cycle_id })
                        .await;
                }
                Ok(prediction)
            }
            Err(e) => {
                StatCounters::bump(&self.stats.failed);
                warn!("Scan cycle {} failed: {}", cycle_id, e);

                if let ScanError::RateLimited { retry_after } = &e {
                    self.event_bus
                        .publish(ScanEvent::RateLimited {
                            retry_after: *retry_after,
                        })
                        .await;
                }
                self.event_bus
                    .publish(ScanEvent::CycleFailed {
                        cycle_id,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        recoverable: e.is_recoverable(),
                    })
                    .await;
                self.note_backend_lost(&e).await;
                Err(e)
            }
        }
    }

    /// Drop readiness once the adapter reports its backend gone, so that
    /// `start` is refused and a retry re-initializes it
    async fn note_backend_lost(&self, error: &ScanError) {
        if self.adapter.is_ready() || !self.backend_ready.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!("{} backend lost: {}", self.adapter.name(), error);
        self.event_bus
            .publish(ScanEvent::BackendUnavailable {
                backend: self.adapter.name().to_string(),
                reason: error.to_string(),
            })
            .await;
    }

    /// Mark `Starting -> Running` once the first cycle resolved
    async fn mark_running(&self, generation: u64) {
        let promoted = {
            let mut control = self.control.lock();
            if control.generation == generation && control.state == ScanState::Starting {
                control.state = ScanState::Running;
                true
            } else {
                false
            }
        };
        if promoted {
            self.publish_transition(ScanState::Starting, ScanState::Running)
                .await;
        }
    }

    /// Stop from inside the loop task after repeated failures
    async fn halt(&self, generation: u64, reason: String) {
        let from = {
            let mut control = self.control.lock();
            if control.generation != generation {
                return;
            }
            let from = control.state;
            control.state = ScanState::Idle;
            control.generation += 1;
            if let Some(handle) = control.handle.take() {
                handle.token.cancel();
            }
            from
        };

        self.publish_transition(from, ScanState::Idle).await;
        self.event_bus
            .publish(ScanEvent::LoopHalted { reason })
            .await;
    }
}

/// Loop body: the first cycle runs immediately, each later one `interval`
/// after the previous resolved, so at most one is ever outstanding.
pub(super) async fn run_loop(inner: Arc<Inner>, generation: u64, token: CancellationToken) {
    let interval = inner.config.interval();
    let mut first = true;

    loop {
        if token.is_cancelled() {
            break;
        }

        // A 429 may predate this loop or arrive from a manual scan mid-sleep
        if let Some(remaining) = inner.rate_gate.remaining() {
            debug!(
                "Holding loop cycle for {:.1}s of rate-limit backoff",
                remaining.as_secs_f32()
            );
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
            continue;
        }

        let mut wait = interval;
        match InFlightGuard::acquire(&inner.in_flight) {
            Some(guard) => {
                let result = inner.execute(generation, false).await;
                drop(guard);

                if let Err(e) = result {
                    match inner.failures.record_failure(&e) {
                        RecoveryAction::Continue => {}
                        RecoveryAction::Backoff(delay) => wait = wait.max(delay),
                        RecoveryAction::Halt => {
                            let reason = if e.is_recoverable() {
                                format!(
                                    "{} consecutive failures, last: {}",
                                    inner.failures.consecutive_failures(),
                                    e
                                )
                            } else {
                                e.to_string()
                            };
                            inner.halt(generation, reason).await;
                            break;
                        }
                    }
                }
            }
            None => debug!("Skipping tick, another cycle is in flight"),
        }

        if first {
            first = false;
            inner.mark_running(generation).await;
        }

        if let Some(remaining) = inner.rate_gate.remaining() {
            wait = wait.max(remaining);
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!("Scan loop task for generation {} finished", generation);
}
