use crate::error::{Result, ScanError};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Recovery action to take after a failed scan cycle
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Keep the loop running on its normal schedule
    Continue,
    /// Keep running, but hold the next cycle back for at least this long
    Backoff(Duration),
    /// Stop the loop
    Halt,
}

/// Time gate armed by HTTP 429 responses.
///
/// While armed, manual scans are refused with [`ScanError::RateLimited`]
/// carrying the remaining wait, and the scan loop sleeps until it expires
/// before starting its next cycle.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    blocked_until: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the gate for `retry_after`; never shortens an existing wait
    pub fn note(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut blocked = self.blocked_until.lock();
        match *blocked {
            Some(existing) if existing >= until => {}
            _ => {
                warn!(
                    "Backend rate limited, holding scans for {:.1}s",
                    retry_after.as_secs_f32()
                );
                *blocked = Some(until);
            }
        }
    }

    /// Remaining wait, if the gate is still armed
    pub fn remaining(&self) -> Option<Duration> {
        let mut blocked = self.blocked_until.lock();
        let until = (*blocked)?;
        let now = Instant::now();
        if now >= until {
            *blocked = None;
            None
        } else {
            Some(until - now)
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.remaining() {
            Some(retry_after) => Err(ScanError::RateLimited { retry_after }),
            None => Ok(()),
        }
    }

    pub fn clear(&self) {
        *self.blocked_until.lock() = None;
    }
}

/// Counts consecutive failed cycles and decides when the loop gives up
#[derive(Debug)]
pub struct FailureTracker {
    max_consecutive: u32,
    consecutive: Mutex<u32>,
}

impl FailureTracker {
    /// `max_consecutive == 0` never halts on recoverable failures
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            max_consecutive,
            consecutive: Mutex::new(0),
        }
    }

    /// Determine recovery action for a failed cycle
    pub fn record_failure(&self, error: &ScanError) -> RecoveryAction {
        if let ScanError::RateLimited { retry_after } = error {
            // Throttling says nothing about backend health
            return RecoveryAction::Backoff(*retry_after);
        }

        if !error.is_recoverable() {
            error!("Non-recoverable scan failure: {}", error);
            return RecoveryAction::Halt;
        }

        let mut consecutive = self.consecutive.lock();
        *consecutive += 1;

        if self.max_consecutive > 0 && *consecutive >= self.max_consecutive {
            error!(
                "{} consecutive scan failures, last: {}",
                *consecutive, error
            );
            return RecoveryAction::Halt;
        }

        debug!(
            "Scan failure {}/{}: {}",
            *consecutive, self.max_consecutive, error
        );
        RecoveryAction::Continue
    }

    /// Reset after a successful cycle
    pub fn record_success(&self) {
        let mut consecutive = self.consecutive.lock();
        if *consecutive > 0 {
            info!("Scan recovered after {} failed cycles", *consecutive);
            *consecutive = 0;
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        *self.consecutive.lock()
    }

    pub fn reset(&self) {
        *self.consecutive.lock() = 0;
    }
}
