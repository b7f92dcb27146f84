//! Counters for assignment and deduction activity.
//!
//! One instance lives in each shared memory identity, so every compose
//! window writing to the same store reports into the same counters.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct MemoryMetrics {
    /// Deductions answered by an exact key match
    exact_hits: AtomicUsize,

    /// Deductions answered by the domain heuristic
    heuristic_hits: AtomicUsize,

    /// Deductions that found nothing
    misses: AtomicUsize,

    /// Store writes (one per changed key)
    saved_assignments: AtomicUsize,

    /// Entries pushed out of the store
    evictions: AtomicUsize,

    /// Language changes discarded for having too many recipients
    discarded_changes: AtomicUsize,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exact_hit(&self) {
        self.exact_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heuristic_hit(&self) {
        self.heuristic_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saved_assignment(&self) {
        self.saved_assignments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded_change(&self) {
        self.discarded_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn saved_assignments(&self) -> usize {
        self.saved_assignments.load(Ordering::Relaxed)
    }

    /// Generate a metrics report.
    pub fn report(&self) -> MetricsReport {
        let exact = self.exact_hits.load(Ordering::Relaxed);
        let heuristic = self.heuristic_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = exact + heuristic + misses;
        let hit_rate = if total > 0 {
            ((exact + heuristic) as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        MetricsReport {
            exact_hits: exact,
            heuristic_hits: heuristic,
            misses,
            hit_rate,
            saved_assignments: self.saved_assignments(),
            evictions: self.evictions(),
            discarded_changes: self.discarded_changes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`MemoryMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub exact_hits: usize,
    pub heuristic_hits: usize,
    pub misses: usize,

    /// Share of deductions that resolved a language, as a percentage (0-100)
    pub hit_rate: f64,

    pub saved_assignments: usize,
    pub evictions: usize,
    pub discarded_changes: usize,
}

impl MetricsReport {
    /// Format the report as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "Deductions: {} exact, {} heuristic, {} misses ({:.1}% resolved)\n\
             Assignments: {} saved, {} evicted, {} discarded changes",
            self.exact_hits,
            self.heuristic_hits,
            self.misses,
            self.hit_rate,
            self.saved_assignments,
            self.evictions,
            self.discarded_changes
        )
    }
}
