//! Process-local job processing counters
//!
//! Store-of-truth totals come from `JobStore::stats`; these counters track
//! what this process did since startup and feed the periodic supervisor
//! log line and the stats CLI.

use std::sync::atomic::{AtomicU64, Ordering};

/// Job metrics collector
#[derive(Debug, Default)]
pub struct JobMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    batches_loaded: AtomicU64,
    locks_contended: AtomicU64,
    degraded_polls: AtomicU64,
}

impl JobMetrics {
    /// Create a zeroed collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_batches_loaded(&self) {
        self.batches_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_locks_contended(&self) {
        self.locks_contended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_degraded_polls(&self) {
        self.degraded_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot of all counters
    pub fn snapshot(&self) -> MetricsSummary {
        MetricsSummary {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            batches_loaded: self.batches_loaded.load(Ordering::Relaxed),
            locks_contended: self.locks_contended.load(Ordering::Relaxed),
            degraded_polls: self.degraded_polls.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub batches_loaded: u64,
    pub locks_contended: u64,
    pub degraded_polls: u64,
}

impl MetricsSummary {
    /// Fraction of processed jobs that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.processed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = JobMetrics::new();
        metrics.incr_processed();
        metrics.incr_processed();
        metrics.incr_succeeded();
        metrics.incr_dead_lettered();

        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.success_rate(), 0.5);
    }

    #[test]
    fn test_empty_success_rate() {
        assert_eq!(MetricsSummary::default().success_rate(), 0.0);
    }
}
