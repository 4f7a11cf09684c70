//! Transactions and snapshots
//!
//! A [`Snapshot`] is a read-only view of the durable store at one version.
//! A [`Transaction`] layers its write buffer over a snapshot taken at its
//! start version through a [`UnionStore`], and commits with a two-phase
//! protocol: all keys are first locked (prewrite), then the primary key is
//! committed, which is the commit point, and finally the secondaries are
//! resolved in the background.

mod commit;
mod snapshot;
mod transaction;
mod union_store;

pub use snapshot::{Snapshot, SnapshotIter};
pub use transaction::{Transaction, TxnState};
pub use union_store::{UnionIter, UnionStore};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::StorageOptions;
use crate::gc::ActiveVersions;
use crate::kv::{ClockVersionProvider, Version, VersionProvider};
use crate::latch::LatchesScheduler;
use crate::metrics::StorageMetrics;
use crate::persistence::DurableStore;
use crate::resolver::Resolver;

/// Components shared by the transactions and snapshots of one storage
pub(crate) struct Engine {
    pub(crate) store: Arc<DurableStore>,
    pub(crate) versions: Arc<ClockVersionProvider>,
    pub(crate) latches: LatchesScheduler,
    pub(crate) resolver: Arc<Resolver>,
    pub(crate) active: Arc<ActiveVersions>,
    pub(crate) metrics: Arc<StorageMetrics>,
    pub(crate) options: StorageOptions,
    pub(crate) closed: AtomicBool,
}

impl Engine {
    pub(crate) fn current_version(&self) -> Version {
        self.versions.current_version()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persistence::DurableStore;
    use tempfile::TempDir;

    /// Engine over a fresh store in `dir` with small thread pools.
    pub(crate) fn test_engine(dir: &TempDir) -> Arc<Engine> {
        let options = StorageOptions {
            latch_slots: 16,
            resolver_workers: 2,
            resolver_queue_capacity: 64,
            lock_ttl_ms: 200,
            ..StorageOptions::default()
        };
        let store = Arc::new(DurableStore::open(dir.path(), &options).unwrap());
        let metrics = Arc::new(StorageMetrics::new());
        let resolver = Arc::new(
            Resolver::new(
                Arc::clone(&store),
                options.resolver_workers,
                options.resolver_queue_capacity,
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        Arc::new(Engine {
            versions: Arc::new(ClockVersionProvider::new(store.high_water().unwrap()).unwrap()),
            latches: LatchesScheduler::new(options.latch_slots).unwrap(),
            store,
            resolver,
            active: Arc::new(ActiveVersions::new()),
            metrics,
            options,
            closed: AtomicBool::new(false),
        })
    }
}
