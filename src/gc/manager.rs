use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::worker::{collect, resolve_locks, GcStats, ResolvedLocks};
use super::{GcPolicy, GcTask, SafePointProvider};
use crate::kv::{KvError, KvResult, VersionProvider};
use crate::metrics::StorageMetrics;
use crate::persistence::DurableStore;
use crate::resolver::Resolver;

/// Settings of the background GC loops
#[derive(Debug, Clone, Copy)]
pub struct GcSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub interval: Duration,
    pub enabled: bool,
}

#[derive(Default)]
struct Pending {
    tasks: VecDeque<GcTask>,
    shutdown: bool,
}

struct Shared {
    store: Arc<DurableStore>,
    resolver: Arc<Resolver>,
    versions: Arc<dyn VersionProvider>,
    safe_points: Arc<dyn SafePointProvider>,
    policy: Mutex<Box<dyn GcPolicy>>,
    metrics: Arc<StorageMetrics>,
    pending: Mutex<Pending>,
    task_ready: Condvar,
    tick: Condvar,
    capacity: usize,
}

impl Shared {
    fn run_task(&self, task: &GcTask) -> KvResult<GcStats> {
        let stats = collect(&self.store, task)?;
        self.metrics.record_gc_task(stats.versions_deleted);
        Ok(stats)
    }

    /// Settle abandoned locks and return the safe point collection may use.
    fn resolve_locks(&self) -> KvResult<ResolvedLocks> {
        let safe_point = self.safe_points.safe_point();
        let resolved = resolve_locks(&self.store, &self.resolver, self.versions.as_ref(), safe_point)?;
        if resolved.safe_point < safe_point {
            debug!(
                safe_point = %safe_point,
                capped = %resolved.safe_point,
                "safe point held back by unresolved locks"
            );
        }
        Ok(resolved)
    }

    /// Queue new tasks when there is room.
    fn schedule(&self) -> KvResult<usize> {
        let room = {
            let pending = self.pending.lock();
            self.capacity.saturating_sub(pending.tasks.len())
        };
        if room == 0 {
            return Ok(0);
        }
        let safe_point = self.resolve_locks()?.safe_point;
        let tasks = self.policy.lock().schedule(self.store.db(), safe_point, room)?;
        let count = tasks.len();
        if count > 0 {
            let mut pending = self.pending.lock();
            pending.tasks.extend(tasks);
            self.task_ready.notify_all();
        }
        Ok(count)
    }
}

/// Schedules and runs garbage collection of old MVCC versions
///
/// A scheduler thread wakes every interval, settles abandoned locks and asks
/// the policy for key ranges; a pool of workers collects them.
pub struct GcManager {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl GcManager {
    pub fn new(
        store: Arc<DurableStore>,
        resolver: Arc<Resolver>,
        versions: Arc<dyn VersionProvider>,
        safe_points: Arc<dyn SafePointProvider>,
        policy: Box<dyn GcPolicy>,
        metrics: Arc<StorageMetrics>,
        settings: GcSettings,
    ) -> KvResult<Self> {
        let shared = Arc::new(Shared {
            store,
            resolver,
            versions,
            safe_points,
            policy: Mutex::new(policy),
            metrics,
            pending: Mutex::new(Pending::default()),
            task_ready: Condvar::new(),
            tick: Condvar::new(),
            capacity: settings.queue_capacity.max(1),
        });

        let mut handles = Vec::new();
        if settings.enabled {
            for id in 0..settings.workers.max(1) {
                let worker = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name(format!("samyama-gc-{}", id))
                    .spawn(move || worker_loop(worker))
                    .map_err(KvError::Io)?;
                handles.push(handle);
            }
            let scheduler = Arc::clone(&shared);
            let interval = settings.interval;
            let handle = std::thread::Builder::new()
                .name("samyama-gc-scheduler".to_string())
                .spawn(move || scheduler_loop(scheduler, interval))
                .map_err(KvError::Io)?;
            handles.push(handle);
            let interval_ms = interval.as_millis() as u64;
            info!(workers = settings.workers, interval_ms, "gc manager started");
        } else {
            info!("background gc disabled");
        }

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
        })
    }

    /// Collect the whole keyspace at the current safe point on this thread.
    pub fn gc_now(&self) -> KvResult<GcStats> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KvError::Closed);
        }
        let resolved = self.shared.resolve_locks()?;
        let task = GcTask::full(resolved.safe_point);
        let mut stats = self.shared.run_task(&task)?;
        stats.locks_resolved = resolved.locks_resolved;
        info!(
            safe_point = %task.safe_point,
            deleted = stats.versions_deleted,
            locks = stats.locks_resolved,
            "manual gc round finished"
        );
        Ok(stats)
    }

    /// Number of tasks waiting for a worker
    pub fn pending_tasks(&self) -> usize {
        self.shared.pending.lock().tasks.len()
    }

    /// Stop the loops; queued tasks are still collected.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut pending = self.shared.pending.lock();
            pending.shutdown = true;
            self.shared.task_ready.notify_all();
            self.shared.tick.notify_all();
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("gc thread panicked");
            }
        }
        info!("gc manager closed");
    }
}

impl Drop for GcManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn scheduler_loop(shared: Arc<Shared>, interval: Duration) {
    loop {
        {
            let mut pending = shared.pending.lock();
            if !pending.shutdown {
                shared.tick.wait_for(&mut pending, interval);
            }
            if pending.shutdown {
                break;
            }
        }
        match shared.schedule() {
            Ok(0) => {}
            Ok(count) => debug!(tasks = count, "scheduled gc tasks"),
            Err(err) => error!(error = %err, "gc scheduling failed"),
        }
    }
    debug!("gc scheduler exiting");
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut pending = shared.pending.lock();
            loop {
                if let Some(task) = pending.tasks.pop_front() {
                    break Some(task);
                }
                if pending.shutdown {
                    break None;
                }
                shared.task_ready.wait(&mut pending);
            }
        };
        let Some(task) = task else {
            break;
        };
        if let Err(err) = shared.run_task(&task) {
            error!(lower = %task.lower, upper = %task.upper, error = %err, "gc task failed");
        }
    }
    debug!("gc worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::gc::SweepPolicy;
    use crate::kv::Version;
    use crate::mvcc::{encode, Value, ValueType};

    struct FixedVersions(Version);

    impl VersionProvider for FixedVersions {
        fn current_version(&self) -> Version {
            self.0
        }
    }

    impl SafePointProvider for FixedVersions {
        fn safe_point(&self) -> Version {
            self.0
        }
    }

    fn manager(dir: &tempfile::TempDir, enabled: bool) -> (Arc<DurableStore>, Arc<StorageMetrics>, GcManager) {
        let store = Arc::new(DurableStore::open(dir.path(), &StorageOptions::default()).unwrap());
        let metrics = Arc::new(StorageMetrics::new());
        let resolver =
            Arc::new(Resolver::new(Arc::clone(&store), 1, 8, Arc::clone(&metrics)).unwrap());
        let fixed = Arc::new(FixedVersions(Version(100)));
        let gc = GcManager::new(
            Arc::clone(&store),
            resolver,
            fixed.clone(),
            fixed,
            Box::new(SweepPolicy::new(1)),
            Arc::clone(&metrics),
            GcSettings {
                workers: 2,
                queue_capacity: 4,
                interval: Duration::from_millis(10),
                enabled,
            },
        )
        .unwrap();
        (store, metrics, gc)
    }

    fn write_versions(store: &DurableStore, key: &[u8]) {
        for commit in [10u64, 20] {
            let value = Value {
                value_type: ValueType::Put,
                start_ver: Version(commit - 1),
                commit_ver: Version(commit),
                value: b"v".to_vec(),
            };
            store
                .db()
                .put(encode(key, Version(commit)), value.marshal().unwrap())
                .unwrap();
        }
    }

    #[test]
    fn test_gc_now() {
        let dir = tempfile::TempDir::new().unwrap();
        let (store, metrics, gc) = manager(&dir, false);
        write_versions(&store, b"a");
        write_versions(&store, b"b");

        let stats = gc.gc_now().unwrap();
        assert_eq!(stats.versions_deleted, 2);
        assert_eq!(metrics.snapshot().gc_versions_deleted, 2);
        assert!(store.db().get(encode(b"a", Version(10))).unwrap().is_none());
        assert!(store.db().get(encode(b"a", Version(20))).unwrap().is_some());

        gc.close();
        assert!(matches!(gc.gc_now(), Err(KvError::Closed)));
    }

    #[test]
    fn test_background_rounds() {
        let dir = tempfile::TempDir::new().unwrap();
        let (store, metrics, gc) = manager(&dir, true);
        for key in [b"a", b"b", b"c"] {
            write_versions(&store, key);
        }

        let mut deleted = 0;
        for _ in 0..200 {
            deleted = metrics.snapshot().gc_versions_deleted;
            if deleted == 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(deleted, 3);
        gc.close();
        gc.close();
        assert_eq!(gc.pending_tasks(), 0);
    }
}
