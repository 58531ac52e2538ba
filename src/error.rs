use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Camera device is not ready")]
    DeviceNotReady,

    #[error("Capture failed: {details}")]
    CaptureFailed { details: String },

    #[error("Invalid frame: {details}")]
    InvalidFrame { details: String },

    #[error("Rate limited by backend, retry in {:.1}s", retry_after.as_secs_f32())]
    RateLimited { retry_after: Duration },

    #[error("Backend error{}: {detail}", status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    BackendError { status: Option<u16>, detail: String },

    #[error("Degenerate class scores: {details}")]
    DegenerateScores { details: String },

    #[error("Score cardinality mismatch: expected {expected} scores, got {actual}")]
    ScoreCardinalityMismatch { expected: usize, actual: usize },

    #[error("Backend initialization failed: {details}")]
    BackendInitFailed { details: String },

    #[error("Inference backend is not ready")]
    BackendNotReady,

    #[error("Cannot {operation} while scan loop is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("A scan cycle is already in flight")]
    CycleInFlight,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("System error: {message}")]
    System { message: String },
}

impl ScanError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn backend<S: Into<String>>(status: Option<u16>, detail: S) -> Self {
        Self::BackendError {
            status,
            detail: detail.into(),
        }
    }

    pub fn capture<S: Into<String>>(details: S) -> Self {
        Self::CaptureFailed {
            details: details.into(),
        }
    }

    pub fn invalid_frame<S: Into<String>>(details: S) -> Self {
        Self::InvalidFrame {
            details: details.into(),
        }
    }

    /// Whether the scan loop may simply try again on the next tick.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ScanError::BackendInitFailed { .. }
                | ScanError::BackendNotReady
                | ScanError::Config(_)
                | ScanError::System { .. }
        )
    }

    /// Short stable name used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::DeviceNotReady => "device_not_ready",
            ScanError::CaptureFailed { .. } => "capture_failed",
            ScanError::InvalidFrame { .. } => "invalid_frame",
            ScanError::RateLimited { .. } => "rate_limited",
            ScanError::BackendError { .. } => "backend_error",
            ScanError::DegenerateScores { .. } => "degenerate_scores",
            ScanError::ScoreCardinalityMismatch { .. } => "score_cardinality_mismatch",
            ScanError::BackendInitFailed { .. } => "backend_init_failed",
            ScanError::BackendNotReady => "backend_not_ready",
            ScanError::InvalidState { .. } => "invalid_state",
            ScanError::CycleInFlight => "cycle_in_flight",
            ScanError::Config(_) => "config",
            ScanError::Io(_) => "io",
            ScanError::Serialization(_) => "serialization",
            ScanError::System { .. } => "system",
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
