//! Global atomic counters for promoter workflows.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a CLI command).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters; no allocations, no locking.
pub struct Metrics {
    polls: AtomicU64,
    nudges: AtomicU64,
    timeouts: AtomicU64,
    items_reconciled: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            polls: AtomicU64::new(0),
            nudges: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            items_reconciled: AtomicU64::new(0),
        }
    }

    /// One fetch issued by a wait.
    pub fn inc_polls(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "polls", "counter incremented");
    }

    /// One rescan / refresh / synthetic commit issued by a wait.
    pub fn inc_nudges(&self) {
        self.nudges.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "nudges", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    pub fn inc_items_reconciled(&self) {
        self.items_reconciled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "items_reconciled", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            polls = self.polls(),
            nudges = self.nudges(),
            timeouts = self.timeouts(),
            items_reconciled = self.items_reconciled(),
        );
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn nudges(&self) -> u64 {
        self.nudges.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn items_reconciled(&self) -> u64 {
        self.items_reconciled.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.polls.store(0, Ordering::Relaxed);
        self.nudges.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.items_reconciled.store(0, Ordering::Relaxed);
    }
}
