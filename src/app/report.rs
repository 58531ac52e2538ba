use crate::error::ScanError;
use crate::events::ScanEvent;
use crate::interpreter::Prediction;
use crate::scan::ScanState;
use std::fmt::Write;

/// Terminal rendering of a detection: headline, advice, then every label
/// with its score, highest first.
pub fn render_prediction(prediction: &Prediction) -> String {
    let mut out = format!(
        "Detected: {} ({:.1}%)",
        prediction.class_name(),
        prediction.confidence * 100.0
    );
    if !prediction.actionable {
        out.push_str(" [low confidence]");
    }
    let _ = write!(out, "\n  {}", prediction.advice());

    for entry in &prediction.ranked {
        let _ = write!(
            out,
            "\n  {:<18} {:>5.1}%",
            entry.label.as_str(),
            entry.score * 100.0
        );
    }
    out
}

/// Raw mode terminals do not return the carriage on `\n`
pub(super) fn emit(text: &str) {
    for line in text.lines() {
        print!("{}\r\n", line);
    }
}

/// Operator-facing line for an event, if it warrants one. Loop failures
/// only reach the debug log.
pub(super) fn user_message(event: &ScanEvent) -> Option<String> {
    match event {
        ScanEvent::PredictionReady { prediction, .. } => Some(render_prediction(prediction)),
        ScanEvent::BackendUnavailable { backend, reason } => Some(format!(
            "{} backend unavailable ({}), press r to retry",
            backend, reason
        )),
        ScanEvent::LoopStateChanged {
            to: ScanState::Running,
            ..
        } => Some("Scanning...".to_string()),
        ScanEvent::LoopStateChanged {
            to: ScanState::Idle,
            ..
        } => Some("Scanning stopped".to_string()),
        ScanEvent::LoopHalted { reason } => Some(format!("Scan loop halted: {}", reason)),
        _ => None,
    }
}

/// Outcome line for a refused or failed manual scan
pub fn manual_scan_failure(error: &ScanError) -> String {
    match error {
        ScanError::RateLimited { retry_after } => format!(
            "Rate limited by the classification service, please wait {:.0}s before scanning again",
            retry_after.as_secs_f32().ceil()
        ),
        ScanError::CycleInFlight => "A scan is already in progress".to_string(),
        ScanError::BackendNotReady => "Backend not ready, press r to retry".to_string(),
        other => format!("Scan failed: {}", other),
    }
}
