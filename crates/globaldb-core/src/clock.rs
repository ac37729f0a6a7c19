//! Priority clock for local writes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks the highest priority this replica has assigned or observed.
///
/// `tick` hands out strictly increasing values even under concurrent
/// callers, and always above anything passed to `observe` before it.
#[derive(Debug, Default)]
pub struct PriorityClock {
    max: AtomicU64,
}

impl PriorityClock {
    pub fn new() -> Self {
        PriorityClock::default()
    }

    /// Next priority for a local delta.
    pub fn tick(&self) -> u64 {
        self.max.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Account for a priority seen on an applied delta.
    pub fn observe(&self, priority: u64) {
        self.max.fetch_max(priority, Ordering::SeqCst);
    }

    /// Highest priority assigned or observed so far.
    pub fn current(&self) -> u64 {
        self.max.load(Ordering::SeqCst)
    }
}
