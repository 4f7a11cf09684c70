//! GC task selection and safe points

use parking_lot::Mutex;
use rocksdb::DB;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::kv::{Key, KvResult, Version, VersionProvider};
use crate::mvcc::MvccCursor;

/// Range of user keys `[lower, upper)` to collect; an empty bound is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcTask {
    pub lower: Key,
    pub upper: Key,
    /// Versions at or below this one are only kept when still visible
    pub safe_point: Version,
}

impl GcTask {
    /// Task covering the whole keyspace
    pub fn full(safe_point: Version) -> Self {
        Self {
            lower: Key::default(),
            upper: Key::default(),
            safe_point,
        }
    }
}

/// Chooses the key ranges collected in each GC round
pub trait GcPolicy: Send {
    /// At most `capacity` tasks to run at `safe_point`.
    fn schedule(&mut self, db: &DB, safe_point: Version, capacity: usize) -> KvResult<Vec<GcTask>>;
}

/// Oldest version no reader may still need
pub trait SafePointProvider: Send + Sync {
    fn safe_point(&self) -> Version;
}

/// Start versions pinned by live transactions and snapshots
#[derive(Debug, Default)]
pub struct ActiveVersions {
    pinned: Mutex<BTreeMap<Version, usize>>,
}

impl ActiveVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `ver` until the returned guard is dropped.
    pub fn pin(self: &Arc<Self>, ver: Version) -> VersionGuard {
        *self.pinned.lock().entry(ver).or_insert(0) += 1;
        VersionGuard {
            registry: Arc::clone(self),
            ver,
        }
    }

    pub fn oldest(&self) -> Option<Version> {
        self.pinned.lock().keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.pinned.lock().values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pinned.lock().is_empty()
    }

    fn unpin(&self, ver: Version) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&ver) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&ver);
            }
        }
    }
}

/// Keeps a version pinned in [`ActiveVersions`]
#[derive(Debug)]
pub struct VersionGuard {
    registry: Arc<ActiveVersions>,
    ver: Version,
}

impl VersionGuard {
    pub fn version(&self) -> Version {
        self.ver
    }
}

impl Drop for VersionGuard {
    fn drop(&mut self) {
        self.registry.unpin(self.ver);
    }
}

/// Safe point trailing the clock by a fixed life time
///
/// Never passes the oldest pinned version, so pinned readers keep their view.
pub struct LifetimeSafePoint {
    active: Arc<ActiveVersions>,
    versions: Arc<dyn VersionProvider>,
    life_time_ms: u64,
}

impl LifetimeSafePoint {
    pub fn new(
        active: Arc<ActiveVersions>,
        versions: Arc<dyn VersionProvider>,
        life_time_ms: u64,
    ) -> Self {
        Self {
            active,
            versions,
            life_time_ms,
        }
    }
}

impl SafePointProvider for LifetimeSafePoint {
    fn safe_point(&self) -> Version {
        let by_time = self.versions.current_version().sub_millis(self.life_time_ms);
        match self.active.oldest() {
            Some(oldest) => by_time.min(Version(oldest.0.saturating_sub(1))),
            None => by_time,
        }
    }
}

/// Sweeps the keyspace round-robin in ranges of `batch_keys` user keys
pub struct SweepPolicy {
    batch_keys: usize,
    next: Key,
}

impl SweepPolicy {
    pub fn new(batch_keys: usize) -> Self {
        Self {
            batch_keys: batch_keys.max(1),
            next: Key::default(),
        }
    }

    /// First key of the next round; empty when the sweep restarts
    pub fn next_key(&self) -> &Key {
        &self.next
    }
}

impl GcPolicy for SweepPolicy {
    fn schedule(&mut self, db: &DB, safe_point: Version, capacity: usize) -> KvResult<Vec<GcTask>> {
        let mut tasks = Vec::new();
        let mut cursor = MvccCursor::new(db, None, None);
        if self.next.is_empty() {
            cursor.seek_to_first();
        } else {
            cursor.seek_key(&self.next);
        }

        while tasks.len() < capacity {
            let lower = match cursor.current()? {
                Some((key, _)) => key,
                None => break,
            };
            let mut upper = Key::default();
            let mut count = 0;
            while let Some((key, _)) = cursor.current()? {
                if count == self.batch_keys {
                    upper = key;
                    break;
                }
                cursor.skip_key(&key);
                count += 1;
            }
            let done = upper.is_empty();
            tasks.push(GcTask {
                lower,
                upper,
                safe_point,
            });
            if done {
                break;
            }
        }

        self.next = match tasks.last() {
            Some(task) => task.upper.clone(),
            None => Key::default(),
        };
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::{encode, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    struct FixedVersions(AtomicU64);

    impl VersionProvider for FixedVersions {
        fn current_version(&self) -> Version {
            Version(self.0.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_active_versions_pin_and_release() {
        let active = Arc::new(ActiveVersions::new());
        let a = active.pin(Version(20));
        let b = active.pin(Version(10));
        let c = active.pin(Version(10));
        assert_eq!(active.oldest(), Some(Version(10)));
        assert_eq!(active.len(), 3);
        drop(b);
        assert_eq!(active.oldest(), Some(Version(10)));
        drop(c);
        assert_eq!(active.oldest(), Some(Version(20)));
        assert_eq!(a.version(), Version(20));
        drop(a);
        assert!(active.is_empty());
    }

    #[test]
    fn test_safe_point_respects_pins() {
        let active = Arc::new(ActiveVersions::new());
        let versions = Arc::new(FixedVersions(AtomicU64::new(10_000_000_000)));
        let provider = LifetimeSafePoint::new(Arc::clone(&active), versions, 1000);

        assert_eq!(provider.safe_point(), Version(9_000_000_000));
        let _guard = active.pin(Version(5_000));
        assert_eq!(provider.safe_point(), Version(4_999));
    }

    #[test]
    fn test_sweep_policy_round_robin() {
        let dir = TempDir::new().unwrap();
        let db = DB::open_default(dir.path()).unwrap();
        let value = Value::rollback(Version(1)).marshal().unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            db.put(encode(key.as_bytes(), Version(1)), &value).unwrap();
            db.put(encode(key.as_bytes(), Version(2)), &value).unwrap();
        }

        let mut policy = SweepPolicy::new(2);
        let tasks = policy.schedule(&db, Version(5), 2).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].lower, Key::from("a"));
        assert_eq!(tasks[0].upper, Key::from("c"));
        assert_eq!(tasks[1].lower, Key::from("c"));
        assert_eq!(tasks[1].upper, Key::from("e"));
        assert_eq!(policy.next_key(), &Key::from("e"));

        let tasks = policy.schedule(&db, Version(5), 2).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].lower, Key::from("e"));
        assert!(tasks[0].upper.is_empty());
        assert!(policy.next_key().is_empty());
    }
}
