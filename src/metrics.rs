//! Engine counters
//!
//! One `StorageMetrics` instance is created per opened storage and handed to
//! the components that update it.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the engine components
#[derive(Debug, Default)]
pub struct StorageMetrics {
    txn_begun: AtomicU64,
    txn_committed: AtomicU64,
    txn_rolled_back: AtomicU64,
    txn_conflicts: AtomicU64,
    locks_resolved: AtomicU64,
    locks_rolled_back: AtomicU64,
    resolve_failures: AtomicU64,
    gc_tasks: AtomicU64,
    gc_versions_deleted: AtomicU64,
}

/// Point-in-time copy of [`StorageMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub txn_begun: u64,
    pub txn_committed: u64,
    pub txn_rolled_back: u64,
    pub txn_conflicts: u64,
    pub locks_resolved: u64,
    pub locks_rolled_back: u64,
    pub resolve_failures: u64,
    pub gc_tasks: u64,
    pub gc_versions_deleted: u64,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_begin(&self) {
        self.txn_begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.txn_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.txn_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.txn_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resolved(&self, committed: bool) {
        if committed {
            self.locks_resolved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.locks_rolled_back.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_gc_task(&self, deleted: u64) {
        self.gc_tasks.fetch_add(1, Ordering::Relaxed);
        self.gc_versions_deleted.fetch_add(deleted, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            txn_begun: self.txn_begun.load(Ordering::Relaxed),
            txn_committed: self.txn_committed.load(Ordering::Relaxed),
            txn_rolled_back: self.txn_rolled_back.load(Ordering::Relaxed),
            txn_conflicts: self.txn_conflicts.load(Ordering::Relaxed),
            locks_resolved: self.locks_resolved.load(Ordering::Relaxed),
            locks_rolled_back: self.locks_rolled_back.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            gc_tasks: self.gc_tasks.load(Ordering::Relaxed),
            gc_versions_deleted: self.gc_versions_deleted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = StorageMetrics::new();
        metrics.record_begin();
        metrics.record_begin();
        metrics.record_commit();
        metrics.record_resolved(true);
        metrics.record_resolved(false);
        metrics.record_gc_task(7);

        let snap = metrics.snapshot();
        assert_eq!(snap.txn_begun, 2);
        assert_eq!(snap.txn_committed, 1);
        assert_eq!(snap.locks_resolved, 1);
        assert_eq!(snap.locks_rolled_back, 1);
        assert_eq!(snap.gc_tasks, 1);
        assert_eq!(snap.gc_versions_deleted, 7);
    }
}
