//! Global atomic counters for grading activity.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a regrade finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters. No allocations, no locking.
pub struct Metrics {
    reviews_recorded: AtomicU64,
    elections: AtomicU64,
    oracle_calls: AtomicU64,
    oracle_failures: AtomicU64,
    persist_failures: AtomicU64,
    certificates_issued: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            reviews_recorded: AtomicU64::new(0),
            elections: AtomicU64::new(0),
            oracle_calls: AtomicU64::new(0),
            oracle_failures: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            certificates_issued: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_reviews(&self) {
        Self::bump(&self.reviews_recorded, "reviews_recorded");
    }

    pub fn inc_elections(&self) {
        Self::bump(&self.elections, "elections");
    }

    pub fn inc_oracle_calls(&self) {
        Self::bump(&self.oracle_calls, "oracle_calls");
    }

    pub fn inc_oracle_failures(&self) {
        Self::bump(&self.oracle_failures, "oracle_failures");
    }

    pub fn inc_persist_failures(&self) {
        Self::bump(&self.persist_failures, "persist_failures");
    }

    pub fn inc_certificates(&self) {
        Self::bump(&self.certificates_issued, "certificates_issued");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            reviews_recorded = self.reviews_recorded(),
            elections = self.elections(),
            oracle_calls = self.oracle_calls(),
            oracle_failures = self.oracle_failures(),
            persist_failures = self.persist_failures(),
            certificates_issued = self.certificates_issued(),
        );
    }

    pub fn reviews_recorded(&self) -> u64 {
        self.reviews_recorded.load(Ordering::Relaxed)
    }

    pub fn elections(&self) -> u64 {
        self.elections.load(Ordering::Relaxed)
    }

    pub fn oracle_calls(&self) -> u64 {
        self.oracle_calls.load(Ordering::Relaxed)
    }

    pub fn oracle_failures(&self) -> u64 {
        self.oracle_failures.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    pub fn certificates_issued(&self) -> u64 {
        self.certificates_issued.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.reviews_recorded,
            &self.elections,
            &self.oracle_calls,
            &self.oracle_failures,
            &self.persist_failures,
            &self.certificates_issued,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
