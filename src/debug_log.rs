use crate::events::{EventBus, ScanEvent};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rolling, human-readable log of notable scan events.
///
/// Cheap to clone; clones share the same buffer. Lines are kept oldest first
/// and the oldest line is dropped once `capacity` is reached.
#[derive(Clone)]
pub struct DebugLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl DebugLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push<S: AsRef<str>>(&self, message: S) {
        let stamp: DateTime<Local> = Local::now();
        let line = format!("[{}] {}", stamp.format("%H:%M:%S"), message.as_ref());

        let mut lines = self.lines.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn record(&self, event: &ScanEvent) {
        self.push(event.description());
    }

    /// Newest `count` lines, oldest first
    pub fn recent(&self, count: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    /// Feed this log from the event bus until `cancel` fires or the bus closes
    pub fn attach(&self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let log = self.clone();
        let mut receiver = bus.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => log.record(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Debug log lagged behind by {} events", n);
                            log.push(format!("... {} events dropped", n));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Debug log detached from event bus");
        })
    }
}
