use parking_lot::{Condvar, Mutex};
use rocksdb::WriteBatch;
use rustc_hash::{FxBuildHasher, FxHashSet};
use std::collections::VecDeque;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use super::notifier::{MultiKeysNotifier, Notifier, ResolveFailure};
use super::resolve::{resolve, rollback};
use crate::kv::{Key, KvError, KvResult, Version};
use crate::metrics::StorageMetrics;
use crate::persistence::DurableStore;

/// One key to commit or roll back
pub struct Task {
    pub key: Key,
    pub start_ver: Version,
    /// Commit version, [`Version::MIN`] rolls the key back
    pub commit_ver: Version,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Task {
    fn finish(&self, result: KvResult<()>) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(&self.key, result);
        }
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct WorkerQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl WorkerQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, task: Task) {
        let mut state = self.state.lock();
        while state.tasks.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            drop(state);
            task.finish(Err(KvError::Closed));
            return;
        }
        state.tasks.push_back(task);
        self.not_empty.notify_one();
    }

    /// Take every queued task, blocking while the queue is empty.
    fn drain(&self) -> Option<Vec<Task>> {
        let mut state = self.state.lock();
        while state.tasks.is_empty() && !state.closed {
            self.not_empty.wait(&mut state);
        }
        if state.tasks.is_empty() {
            return None;
        }
        let tasks: Vec<Task> = state.tasks.drain(..).collect();
        self.not_full.notify_all();
        Some(tasks)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Background pool committing and rolling back write intents
///
/// Tasks are sharded by key hash, so every task for one key is handled by
/// the same worker in submission order.
pub struct Resolver {
    queues: Vec<Arc<WorkerQueue>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Resolver {
    /// Start `workers` resolver threads, each with a queue of `capacity`.
    pub fn new(
        store: Arc<DurableStore>,
        workers: usize,
        capacity: usize,
        metrics: Arc<StorageMetrics>,
    ) -> KvResult<Self> {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let queue = Arc::new(WorkerQueue::new(capacity.max(1)));
            let worker = ResolveWorker {
                store: Arc::clone(&store),
                queue: Arc::clone(&queue),
                metrics: Arc::clone(&metrics),
            };
            let handle = std::thread::Builder::new()
                .name(format!("samyama-resolver-{}", id))
                .spawn(move || worker.run())
                .map_err(KvError::Io)?;
            queues.push(queue);
            handles.push(handle);
        }

        info!(workers, capacity, "resolver started");
        Ok(Self {
            queues,
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
        })
    }

    fn shard(&self, key: &[u8]) -> usize {
        (FxBuildHasher.hash_one(key) % self.queues.len() as u64) as usize
    }

    /// Submit a single task.
    pub fn submit(&self, task: Task) {
        let shard = self.shard(&task.key);
        self.queues[shard].push(task);
    }

    /// Submit `keys` of transaction `start_ver`; a zero `commit_ver` rolls
    /// them back.
    pub fn resolve(
        &self,
        keys: &[Key],
        start_ver: Version,
        commit_ver: Version,
        notifier: Option<Arc<dyn Notifier>>,
    ) {
        for key in keys {
            self.submit(Task {
                key: key.clone(),
                start_ver,
                commit_ver,
                notifier: notifier.clone(),
            });
        }
    }

    /// Submit `keys` and block until every one of them was handled.
    pub fn resolve_and_wait(
        &self,
        keys: &[Key],
        start_ver: Version,
        commit_ver: Version,
    ) -> Vec<ResolveFailure> {
        if keys.is_empty() {
            return Vec::new();
        }
        let notifier = Arc::new(MultiKeysNotifier::new(keys.len()));
        let dyn_notifier: Arc<dyn Notifier> = notifier.clone();
        self.resolve(keys, start_ver, commit_ver, Some(dyn_notifier));
        notifier.wait()
    }

    /// Stop the workers after the queued tasks are processed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for queue in &self.queues {
            queue.close();
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("resolver worker panicked");
            }
        }
        info!("resolver closed");
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.close();
    }
}

struct ResolveWorker {
    store: Arc<DurableStore>,
    queue: Arc<WorkerQueue>,
    metrics: Arc<StorageMetrics>,
}

impl ResolveWorker {
    fn run(self) {
        while let Some(tasks) = self.queue.drain() {
            let mut batch_tasks = Vec::with_capacity(tasks.len());
            let mut seen = FxHashSet::default();
            for task in tasks {
                // A second task for a key must observe the first one's writes.
                if !seen.insert(task.key.clone()) {
                    self.execute(std::mem::take(&mut batch_tasks));
                    seen.clear();
                    seen.insert(task.key.clone());
                }
                batch_tasks.push(task);
            }
            self.execute(batch_tasks);
        }
        debug!("resolver worker exiting");
    }

    fn execute(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let db = self.store.db();
        let mut batch = WriteBatch::default();
        let mut results = Vec::with_capacity(tasks.len());

        for task in &tasks {
            let result = if task.commit_ver > Version::MIN {
                resolve(db, &mut batch, &task.key, task.start_ver, task.commit_ver)
            } else {
                rollback(db, &mut batch, &task.key, task.start_ver)
            };
            if let Err(err) = &result {
                error!(
                    key = %task.key,
                    start_ver = %task.start_ver,
                    commit_ver = %task.commit_ver,
                    error = %err,
                    "resolve key failed"
                );
            }
            results.push(result);
        }

        let write_error = self.store.write(batch).err();
        if let Some(err) = &write_error {
            error!(error = %err, tasks = tasks.len(), "commit resolve batch failed");
        }

        for (task, result) in tasks.iter().zip(results) {
            let result = match (&write_error, result) {
                (Some(err), Ok(())) => Err(KvError::Retryable(format!("resolve batch: {}", err))),
                (_, result) => result,
            };
            match &result {
                Ok(()) => self.metrics.record_resolved(task.commit_ver > Version::MIN),
                Err(_) => self.metrics.record_resolve_failure(),
            }
            task.finish(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::mvcc::{encode, lock_key, Lock, Op, Value, ValueType};
    use tempfile::TempDir;

    fn setup(workers: usize) -> (TempDir, Arc<DurableStore>, Arc<StorageMetrics>, Resolver) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::open(dir.path(), &StorageOptions::default()).unwrap());
        let metrics = Arc::new(StorageMetrics::new());
        let resolver = Resolver::new(Arc::clone(&store), workers, 8, Arc::clone(&metrics)).unwrap();
        (dir, store, metrics, resolver)
    }

    fn put_lock(store: &DurableStore, key: &[u8], start_ver: u64) {
        let lock = Lock {
            start_ver: Version(start_ver),
            primary: key.into(),
            value: key.to_vec(),
            op: Op::Put,
            ttl: 3000,
        };
        store.db().put(lock_key(key), lock.marshal().unwrap()).unwrap();
    }

    #[test]
    fn test_resolve_many_keys() {
        let (_dir, store, metrics, resolver) = setup(4);
        let keys: Vec<Key> = (0..100u32).map(|i| Key::new(i.to_be_bytes().to_vec())).collect();
        for key in &keys {
            put_lock(&store, key, 10);
        }

        let failures = resolver.resolve_and_wait(&keys, Version(10), Version(20));
        assert!(failures.is_empty());

        for key in &keys {
            assert!(store.db().get(lock_key(key)).unwrap().is_none());
            let raw = store.db().get(encode(key, Version(20))).unwrap().unwrap();
            let value = Value::unmarshal(&raw).unwrap();
            assert_eq!(value.value_type, ValueType::Put);
            assert_eq!(value.value, key.as_bytes());
        }
        assert_eq!(metrics.snapshot().locks_resolved, 100);
        resolver.close();
    }

    #[test]
    fn test_failures_are_reported_per_key() {
        let (_dir, store, metrics, resolver) = setup(2);
        put_lock(&store, b"locked", 10);

        let keys = vec![Key::from("locked"), Key::from("missing")];
        let failures = resolver.resolve_and_wait(&keys, Version(10), Version(20));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, Key::from("missing"));
        assert!(failures[0].error.is_retryable());
        assert_eq!(metrics.snapshot().resolve_failures, 1);
    }

    #[test]
    fn test_same_key_tasks_in_one_drain() {
        let (_dir, store, _metrics, resolver) = setup(1);
        put_lock(&store, b"k", 10);

        let notifier = Arc::new(MultiKeysNotifier::new(3));
        let dyn_notifier: Arc<dyn Notifier> = notifier.clone();
        for _ in 0..3 {
            resolver.submit(Task {
                key: Key::from("k"),
                start_ver: Version(10),
                commit_ver: Version(20),
                notifier: Some(Arc::clone(&dyn_notifier)),
            });
        }
        assert!(notifier.wait().is_empty());
        assert!(store.db().get(lock_key(b"k")).unwrap().is_none());
    }

    #[test]
    fn test_rollback_task() {
        let (_dir, store, metrics, resolver) = setup(1);
        put_lock(&store, b"k", 10);
        let failures = resolver.resolve_and_wait(&[Key::from("k")], Version(10), Version::MIN);
        assert!(failures.is_empty());
        let raw = store.db().get(encode(b"k", Version(10))).unwrap().unwrap();
        assert_eq!(Value::unmarshal(&raw).unwrap().value_type, ValueType::Rollback);
        assert_eq!(metrics.snapshot().locks_rolled_back, 1);
    }

    #[test]
    fn test_close_drains_and_rejects() {
        let (_dir, store, _metrics, resolver) = setup(2);
        let keys: Vec<Key> = (0..20u8).map(|i| Key::new(vec![i])).collect();
        for key in &keys {
            put_lock(&store, key, 10);
        }
        let notifier = Arc::new(MultiKeysNotifier::new(keys.len()));
        let dyn_notifier: Arc<dyn Notifier> = notifier.clone();
        resolver.resolve(&keys, Version(10), Version(20), Some(dyn_notifier));
        resolver.close();
        resolver.close();
        assert!(notifier.wait().is_empty());

        let failures = resolver.resolve_and_wait(&[Key::from("late")], Version(1), Version(2));
        assert!(matches!(failures[0].error, KvError::Closed));
    }
}
