//! Admission decision counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for admission outcomes.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    store_failures: AtomicU64,
}

impl AdmissionMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of admission counters for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    /// Checks that were admitted, including fail-open admissions.
    pub allowed: u64,
    /// Checks that were denied.
    pub denied: u64,
    /// Store round trips that failed and fell open.
    pub store_failures: u64,
}

impl AdmissionSnapshot {
    /// Fraction of checks denied, 0 when no checks have run.
    #[allow(clippy::cast_precision_loss)]
    pub fn denial_rate(&self) -> f64 {
        let total = self.allowed + self.denied;
        if total == 0 {
            return 0.0;
        }
        self.denied as f64 / total as f64
    }
}
