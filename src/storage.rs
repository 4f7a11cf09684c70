//! Storage facade
//!
//! [`Storage`] wires the durable store, the version provider, the latch
//! scheduler, the resolver and the GC manager together and hands out
//! transactions and snapshots.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::StorageOptions;
use crate::gc::{ActiveVersions, GcManager, GcSettings, GcStats, LifetimeSafePoint, SweepPolicy};
use crate::kv::{ClockVersionProvider, KvError, KvResult, Version};
use crate::latch::LatchesScheduler;
use crate::metrics::{MetricsSnapshot, StorageMetrics};
use crate::persistence::DurableStore;
use crate::resolver::Resolver;
use crate::txn::{Engine, Snapshot, Transaction, TxnState};

/// Attempts made by [`Storage::run_in_txn`]
const MAX_TXN_ATTEMPTS: usize = 5;

/// Transactional MVCC key-value storage
pub struct Storage {
    engine: Arc<Engine>,
    gc: GcManager,
    path: PathBuf,
}

impl Storage {
    /// Open or create the storage in `path`.
    pub fn open(path: impl AsRef<Path>, options: StorageOptions) -> KvResult<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let store = Arc::new(DurableStore::open(&path, &options)?);

        let high_water = store.high_water()?;
        let versions = Arc::new(ClockVersionProvider::new(high_water)?);
        let metrics = Arc::new(StorageMetrics::new());
        let latches = LatchesScheduler::new(options.latch_slots)?;
        let resolver = Arc::new(Resolver::new(
            Arc::clone(&store),
            options.resolver_workers,
            options.resolver_queue_capacity,
            Arc::clone(&metrics),
        )?);

        let active = Arc::new(ActiveVersions::new());
        let safe_points = Arc::new(LifetimeSafePoint::new(
            Arc::clone(&active),
            versions.clone(),
            options.gc_life_time_ms,
        ));
        let gc = GcManager::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            versions.clone(),
            safe_points,
            Box::new(SweepPolicy::new(options.gc_batch_keys)),
            Arc::clone(&metrics),
            GcSettings {
                workers: options.gc_workers,
                queue_capacity: options.gc_queue_capacity,
                interval: options.gc_interval(),
                enabled: options.gc_enabled,
            },
        )?;

        info!(path = %path.display(), high_water = %high_water, "storage opened");
        Ok(Self {
            engine: Arc::new(Engine {
                store,
                versions,
                latches,
                resolver,
                active,
                metrics,
                options,
                closed: AtomicBool::new(false),
            }),
            gc,
            path,
        })
    }

    /// Open with [`StorageOptions::default`].
    pub fn open_default(path: impl AsRef<Path>) -> KvResult<Self> {
        Self::open(path, StorageOptions::default())
    }

    /// Start a transaction at the current version.
    pub fn begin(&self) -> KvResult<Transaction> {
        self.check_open()?;
        Ok(Transaction::new(Arc::clone(&self.engine)))
    }

    /// Read-only view at `ver`.
    pub fn snapshot(&self, ver: Version) -> KvResult<Snapshot> {
        self.check_open()?;
        if ver == Version::LOCK {
            return Err(KvError::InvalidStartVer);
        }
        Ok(Snapshot::new(Arc::clone(&self.engine), ver))
    }

    /// A new version, larger than every version handed out before.
    pub fn current_version(&self) -> Version {
        self.engine.current_version()
    }

    /// Run `f` in a transaction and commit it, retrying retryable failures
    /// with a fresh transaction.
    pub fn run_in_txn<T, F>(&self, mut f: F) -> KvResult<T>
    where
        F: FnMut(&mut Transaction) -> KvResult<T>,
    {
        let mut attempt = 1;
        loop {
            let mut txn = self.begin()?;
            let result = f(&mut txn).and_then(|out| txn.commit().map(|_| out));
            match result {
                Ok(out) => return Ok(out),
                Err(err) if err.is_retryable() && attempt < MAX_TXN_ATTEMPTS => {
                    debug!(attempt, start_ver = %txn.start_ver(), error = %err, "retrying transaction");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
            if txn.state() == TxnState::Active {
                txn.rollback()?;
            }
        }
    }

    /// Collect the whole keyspace now, on the calling thread.
    pub fn gc_now(&self) -> KvResult<GcStats> {
        self.check_open()?;
        self.gc.gc_now()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics.snapshot()
    }

    pub fn options(&self) -> &StorageOptions {
        &self.engine.options
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the background threads and persist the version high-water mark.
    ///
    /// Calling it again is a no-op.
    pub fn close(&self) -> KvResult<()> {
        if self.engine.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.gc.close();
        self.engine.latches.close();
        self.engine.resolver.close();

        let store = &self.engine.store;
        store.advance_high_water(self.engine.versions.last_version())?;
        store.flush()?;
        if !self.engine.active.is_empty() {
            warn!(pinned = self.engine.active.len(), "storage closed with live transactions");
        }
        info!(path = %self.path.display(), "storage closed");
        Ok(())
    }

    fn check_open(&self) -> KvResult<()> {
        if self.engine.is_closed() {
            return Err(KvError::Closed);
        }
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(error = %err, "failed to close storage");
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("closed", &self.engine.is_closed())
            .finish()
    }
}
