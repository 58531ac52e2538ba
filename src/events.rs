use crate::interpreter::Prediction;
use crate::scan::ScanState;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events that can occur while scanning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScanEvent {
    /// Backend initialization resolved
    BackendReady { backend: String },
    /// Backend initialization failed; scanning stays disabled
    BackendUnavailable { backend: String, reason: String },
    /// Scan loop moved between states
    LoopStateChanged { from: ScanState, to: ScanState },
    /// A capture cycle began
    CycleStarted { cycle_id: u64, manual: bool },
    /// A cycle produced a prediction that was applied
    PredictionReady {
        cycle_id: u64,
        prediction: Prediction,
        inference_ms: u64,
    },
    /// A cycle ended early
    CycleFailed {
        cycle_id: u64,
        kind: String,
        message: String,
        recoverable: bool,
    },
    /// Backend asked us to slow down
    RateLimited { retry_after: Duration },
    /// A result arrived after the loop was stopped and was dropped
    ResultDiscarded { cycle_id: u64 },
    /// Loop stopped itself after repeated failures
    LoopHalted { reason: String },
    /// System shutdown requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl ScanEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            ScanEvent::BackendReady { backend } => format!("{} backend ready", backend),
            ScanEvent::BackendUnavailable { backend, reason } => {
                format!("{} backend unavailable: {}", backend, reason)
            }
            ScanEvent::LoopStateChanged { from, to } => {
                format!("Scan loop {} -> {}", from, to)
            }
            ScanEvent::CycleStarted { cycle_id, manual } => {
                if *manual {
                    format!("Manual scan {} started", cycle_id)
                } else {
                    format!("Scan cycle {} started", cycle_id)
                }
            }
            ScanEvent::PredictionReady {
                cycle_id,
                prediction,
                inference_ms,
            } => format!(
                "Cycle {}: {} ({:.1}%) in {}ms",
                cycle_id,
                prediction.class_name(),
                prediction.confidence * 100.0,
                inference_ms
            ),
            ScanEvent::CycleFailed {
                cycle_id, message, ..
            } => format!("Cycle {} failed: {}", cycle_id, message),
            ScanEvent::RateLimited { retry_after } => {
                format!("Rate limited, wait {:.0}s", retry_after.as_secs_f32().ceil())
            }
            ScanEvent::ResultDiscarded { cycle_id } => {
                format!("Discarded late result of cycle {}", cycle_id)
            }
            ScanEvent::LoopHalted { reason } => format!("Scan loop halted: {}", reason),
            ScanEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            ScanEvent::BackendReady { .. } => "backend_ready",
            ScanEvent::BackendUnavailable { .. } => "backend_unavailable",
            ScanEvent::LoopStateChanged { .. } => "loop_state_changed",
            ScanEvent::CycleStarted { .. } => "cycle_started",
            ScanEvent::PredictionReady { .. } => "prediction_ready",
            ScanEvent::CycleFailed { .. } => "cycle_failed",
            ScanEvent::RateLimited { .. } => "rate_limited",
            ScanEvent::ResultDiscarded { .. } => "result_discarded",
            ScanEvent::LoopHalted { .. } => "loop_halted",
            ScanEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Async event bus for component coordination using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<ScanEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers, returning how many received it
    pub async fn publish(&self, event: ScanEvent) -> usize {
        match &event {
            ScanEvent::BackendReady { backend } => {
                info!("Inference backend '{}' ready", backend);
            }
            ScanEvent::BackendUnavailable { backend, reason } => {
                error!("Inference backend '{}' unavailable: {}", backend, reason);
            }
            ScanEvent::CycleFailed {
                recoverable: false,
                message,
                ..
            } => {
                error!("Scan cycle failed: {}", message);
            }
            ScanEvent::RateLimited { retry_after } => {
                warn!("Rate limited for {:.1}s", retry_after.as_secs_f32());
            }
            ScanEvent::LoopHalted { reason } => {
                warn!("Scan loop halted: {}", reason);
            }
            ScanEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => {
                debug!("Event: {}", event.description());
            }
        }

        // No subscribers is not an error for a fire-and-forget bus
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}
