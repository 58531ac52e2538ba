mod lifecycle;
mod orchestrator;
mod report;
mod runtime;
mod types;


pub use orchestrator::ScannerApp;
pub use report::{manual_scan_failure, render_prediction};
pub use types::{ComponentState, ShutdownReason};
