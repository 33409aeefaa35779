//! Observability collaborator.
//!
//! Discovery components report progress milestones through an [`Observer`].
//! Recording is fire-and-forget: implementations must not block and never
//! return errors into the discovery core.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Sink for human-readable progress messages.
pub trait Observer: Send + Sync {
    fn record_message(&self, message: &str);
}

/// Shared handle to an observer.
pub type SharedObserver = Arc<dyn Observer>;

/// Forwards every message to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record_message(&self, message: &str) {
        info!(target: "sync_discovery::observer", "{}", message);
    }
}

/// Keeps messages in memory so harnesses can inspect them after a run.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    messages: Mutex<Vec<String>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every message recorded so far.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Number of recorded messages containing `needle`.
    #[must_use]
    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }
}

impl Observer for MemoryObserver {
    fn record_message(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

/// Default observer used when a component is built without one.
pub fn default_observer() -> SharedObserver {
    Arc::new(TracingObserver)
}
