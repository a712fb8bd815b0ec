//! Process-wide atomic counters.
//!
//! Counters are bumped silently at the call site; [`Metrics::flush`] emits
//! them as a single `tracing::info!` event at natural boundaries (end of a
//! daemon tick, end of a CLI command).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    executions_recorded: AtomicU64,
    append_failures: AtomicU64,
    steps_failed: AtomicU64,
    batches_folded: AtomicU64,
    promotions: AtomicU64,
    rollbacks: AtomicU64,
    variations_spawned: AtomicU64,
    registry_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of all counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub executions_recorded: u64,
    pub append_failures: u64,
    pub steps_failed: u64,
    pub batches_folded: u64,
    pub promotions: u64,
    pub rollbacks: u64,
    pub variations_spawned: u64,
    pub registry_retries: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            executions_recorded: AtomicU64::new(0),
            append_failures: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            batches_folded: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            variations_spawned: AtomicU64::new(0),
            registry_retries: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_executions(&self) {
        Self::bump(&self.executions_recorded, "executions_recorded");
    }

    pub fn inc_append_failures(&self) {
        Self::bump(&self.append_failures, "append_failures");
    }

    pub fn inc_steps_failed(&self) {
        Self::bump(&self.steps_failed, "steps_failed");
    }

    pub fn inc_batches(&self) {
        Self::bump(&self.batches_folded, "batches_folded");
    }

    pub fn inc_promotions(&self) {
        Self::bump(&self.promotions, "promotions");
    }

    pub fn inc_rollbacks(&self) {
        Self::bump(&self.rollbacks, "rollbacks");
    }

    pub fn inc_variations(&self) {
        Self::bump(&self.variations_spawned, "variations_spawned");
    }

    pub fn inc_registry_retries(&self) {
        Self::bump(&self.registry_retries, "registry_retries");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions_recorded: self.executions_recorded.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            batches_folded: self.batches_folded.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            variations_spawned: self.variations_spawned.load(Ordering::Relaxed),
            registry_retries: self.registry_retries.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as one `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            executions_recorded = s.executions_recorded,
            append_failures = s.append_failures,
            steps_failed = s.steps_failed,
            batches_folded = s.batches_folded,
            promotions = s.promotions,
            rollbacks = s.rollbacks,
            variations_spawned = s.variations_spawned,
            registry_retries = s.registry_retries,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.executions_recorded,
            &self.append_failures,
            &self.steps_failed,
            &self.batches_folded,
            &self.promotions,
            &self.rollbacks,
            &self.variations_spawned,
            &self.registry_retries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_executions();
        m.inc_executions();
        m.inc_rollbacks();
        let s = m.snapshot();
        assert_eq!(s.executions_recorded, 2);
        assert_eq!(s.rollbacks, 1);
        assert_eq!(s.promotions, 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_steps_failed();
        m.inc_variations();
        m.inc_registry_retries();
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
