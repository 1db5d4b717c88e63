//! Global atomic counters for live-state tracking.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (for example when a subscription closes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    events_applied: AtomicU64,
    stale_discarded: AtomicU64,
    messages_dropped: AtomicU64,
    identity_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_applied: AtomicU64::new(0),
            stale_discarded: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            identity_failures: AtomicU64::new(0),
        }
    }

    /// An event changed the collection.
    pub fn inc_events_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "events_applied", "counter incremented");
    }

    /// An update lost against a newer version or a tombstone.
    pub fn inc_stale_discarded(&self) {
        self.stale_discarded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stale_discarded", "counter incremented");
    }

    /// A whole inbound message failed to parse.
    pub fn inc_messages_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "messages_dropped", "counter incremented");
    }

    /// An event could not be keyed.
    pub fn inc_identity_failures(&self) {
        self.identity_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "identity_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_applied = self.events_applied(),
            stale_discarded = self.stale_discarded(),
            messages_dropped = self.messages_dropped(),
            identity_failures = self.identity_failures(),
        );
    }

    pub fn events_applied(&self) -> u64 {
        self.events_applied.load(Ordering::Relaxed)
    }

    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded.load(Ordering::Relaxed)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    pub fn identity_failures(&self) -> u64 {
        self.identity_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.events_applied.store(0, Ordering::Relaxed);
        self.stale_discarded.store(0, Ordering::Relaxed);
        self.messages_dropped.store(0, Ordering::Relaxed);
        self.identity_failures.store(0, Ordering::Relaxed);
    }
}
