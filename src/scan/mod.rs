mod controller;
mod cycle;
mod state;

#[cfg(test)]
mod tests;

pub use controller::ScanLoopController;
pub use state::{ScanSession, ScanState, ScanStats};
