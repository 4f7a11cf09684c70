use std::sync::Arc;
use tracing::debug;

use super::Engine;
use crate::gc::VersionGuard;
use crate::kv::{Key, KvError, KvIterator, KvResult, LockedError, Version};
use crate::mvcc::{encode_key_prefix, Lock, MvccCursor, Op, ValueType};
use crate::resolver::{decide_lock, LockDecision};

/// Reads blocked by a lock resolve it and retry this many times
const MAX_RESOLVE_RETRIES: usize = 3;

/// Read-only view of the store at a fixed version
///
/// The version stays pinned for GC while the snapshot is alive.
pub struct Snapshot {
    engine: Arc<Engine>,
    ver: Version,
    _pin: VersionGuard,
}

impl Snapshot {
    pub(crate) fn new(engine: Arc<Engine>, ver: Version) -> Self {
        let pin = engine.active.pin(ver);
        Self {
            engine,
            ver,
            _pin: pin,
        }
    }

    pub fn version(&self) -> Version {
        self.ver
    }

    /// Newest value of `key` committed at or before the snapshot version.
    pub fn get(&self, key: &[u8]) -> KvResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.read(key) {
                Err(KvError::Locked(locked)) if attempt < MAX_RESOLVE_RETRIES => {
                    attempt += 1;
                    if !self.resolve_locked(&locked)? {
                        return Err(KvError::Locked(locked));
                    }
                }
                other => return other,
            }
        }
    }

    /// Ascending iterator over user keys in `[lower, upper)`; empty bounds are open.
    pub fn iter(&self, lower: &[u8], upper: &[u8]) -> KvResult<SnapshotIter<'_>> {
        SnapshotIter::new(self, lower, upper, false)
    }

    /// Descending iterator over user keys in `[lower, upper)`.
    pub fn iter_reverse(&self, lower: &[u8], upper: &[u8]) -> KvResult<SnapshotIter<'_>> {
        SnapshotIter::new(self, lower, upper, true)
    }

    fn read(&self, key: &[u8]) -> KvResult<Vec<u8>> {
        let mut cursor = MvccCursor::for_key(self.engine.store.db(), key);
        cursor.seek_key(key);
        self.read_at_cursor(&mut cursor, key)
    }

    /// Visible value of `key`, consuming its entries from `cursor`.
    fn read_at_cursor(&self, cursor: &mut MvccCursor<'_>, key: &[u8]) -> KvResult<Vec<u8>> {
        if let Some(lock) = cursor.read_lock(key)? {
            if lock.start_ver <= self.ver {
                return Err(KvError::Locked(LockedError {
                    key: Key::from(key),
                    primary: lock.primary,
                    start_ver: lock.start_ver,
                    ttl: lock.ttl,
                }));
            }
        }

        while let Some((ver, value)) = cursor.read_value(key)? {
            if ver > self.ver {
                continue;
            }
            match value.value_type {
                ValueType::Put => return Ok(value.value),
                ValueType::Delete => return Err(KvError::NotExist),
                ValueType::Rollback | ValueType::Lock => {}
            }
        }
        Err(KvError::NotExist)
    }

    /// Clean up the lock behind `locked` when its owner is finished.
    ///
    /// Returns false while the owner is still running.
    fn resolve_locked(&self, locked: &LockedError) -> KvResult<bool> {
        let lock = Lock {
            start_ver: locked.start_ver,
            primary: locked.primary.clone(),
            value: Vec::new(),
            op: Op::Put,
            ttl: locked.ttl,
        };
        let commit_ver = match decide_lock(
            &self.engine.store,
            &locked.key,
            &lock,
            self.engine.current_version(),
        )? {
            LockDecision::Alive => return Ok(false),
            LockDecision::Commit(commit_ver) => commit_ver,
            LockDecision::Rollback => Version::MIN,
        };

        let failures = self.engine.resolver.resolve_and_wait(
            std::slice::from_ref(&locked.key),
            locked.start_ver,
            commit_ver,
        );
        for failure in failures {
            // Someone else resolved the lock first; the retry will tell.
            if !failure.error.is_retryable() {
                return Err(failure.error);
            }
        }
        debug!(key = %locked.key, start_ver = %locked.start_ver, commit_ver = %commit_ver, "resolved lock on read");
        Ok(true)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("ver", &self.ver).finish()
    }
}

/// Iterator over the visible values of a [`Snapshot`]
pub struct SnapshotIter<'a> {
    snapshot: &'a Snapshot,
    cursor: MvccCursor<'a>,
    reverse: bool,
    current: Option<(Key, Vec<u8>)>,
}

impl<'a> SnapshotIter<'a> {
    fn new(snapshot: &'a Snapshot, lower: &[u8], upper: &[u8], reverse: bool) -> KvResult<Self> {
        let lower_bound = (!lower.is_empty()).then(|| encode_key_prefix(lower));
        let upper_bound = (!upper.is_empty()).then(|| encode_key_prefix(upper));
        let mut cursor = MvccCursor::new(snapshot.engine.store.db(), lower_bound, upper_bound);
        if reverse {
            cursor.seek_to_last();
        } else {
            cursor.seek_to_first();
        }
        let mut iter = Self {
            snapshot,
            cursor,
            reverse,
            current: None,
        };
        iter.advance()?;
        Ok(iter)
    }

    fn advance(&mut self) -> KvResult<()> {
        self.current = None;
        while let Some((key, _)) = self.cursor.current()? {
            let value = if self.reverse {
                // Positioned on the oldest entry of `key`; read it on its own
                // and step to the previous user key.
                let value = self.snapshot.get(&key);
                self.cursor.seek_before_key(&key);
                value
            } else {
                let value = match self.snapshot.read_at_cursor(&mut self.cursor, &key) {
                    Err(KvError::Locked(_)) => self.snapshot.get(&key),
                    other => other,
                };
                self.cursor.skip_key(&key);
                value
            };
            match value {
                Ok(value) => {
                    self.current = Some((key, value));
                    return Ok(());
                }
                Err(KvError::NotExist) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl<'a> KvIterator for SnapshotIter<'a> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_bytes()).unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or_default()
    }

    fn next(&mut self) -> KvResult<()> {
        self.advance()
    }
}
