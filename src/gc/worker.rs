//! Settling abandoned locks and removing obsolete versions

use rocksdb::WriteBatch;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::GcTask;
use crate::kv::{Key, KvResult, Version, VersionProvider};
use crate::mvcc::{encode, encode_key_prefix, Lock, MvccCursor, ValueType};
use crate::persistence::DurableStore;
use crate::resolver::{decide_lock, LockDecision, MultiKeysNotifier, Notifier, Resolver, Task};

/// Work done by one GC task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub keys_scanned: u64,
    pub versions_deleted: u64,
    pub locks_resolved: u64,
}

impl GcStats {
    pub fn merge(&mut self, other: GcStats) {
        self.keys_scanned += other.keys_scanned;
        self.versions_deleted += other.versions_deleted;
        self.locks_resolved += other.locks_resolved;
    }
}

/// Locks settled before a collection round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLocks {
    /// Safe point lowered below every lock still standing
    pub safe_point: Version,
    pub locks_resolved: u64,
}

/// Commit or roll back every abandoned lock at or below `safe_point` in the
/// whole keyspace and wait until the resolver applied the decisions.
///
/// Deciding a lock reads the commit record on its primary, and collection may
/// delete that record. Settling all locks first keeps the decision intact.
/// A lock that cannot be settled caps the returned safe point just below its
/// start version, which keeps its transaction's records out of reach.
pub fn resolve_locks(
    store: &DurableStore,
    resolver: &Resolver,
    versions: &dyn VersionProvider,
    safe_point: Version,
) -> KvResult<ResolvedLocks> {
    let current = versions.current_version();
    let mut capped = safe_point;

    let mut tasks = Vec::new();
    let mut cursor = MvccCursor::new(store.db(), None, None);
    cursor.seek_to_first();
    while let Some((key, ver)) = cursor.current()? {
        if ver == Version::LOCK {
            if let Some(lock) = cursor.read_lock(&key)? {
                if lock.start_ver <= safe_point {
                    match decide_abandoned(store, &key, &lock, current)? {
                        Some(commit_ver) => tasks.push((key.clone(), lock.start_ver, commit_ver)),
                        None => cap_below(&mut capped, lock.start_ver),
                    }
                }
            }
        }
        cursor.skip_key(&key);
    }

    if tasks.is_empty() {
        return Ok(ResolvedLocks {
            safe_point: capped,
            locks_resolved: 0,
        });
    }

    let notifier = Arc::new(MultiKeysNotifier::new(tasks.len()));
    let starts: FxHashMap<Key, Version> = tasks
        .iter()
        .map(|(key, start_ver, _)| (key.clone(), *start_ver))
        .collect();
    for (key, start_ver, commit_ver) in tasks {
        let dyn_notifier: Arc<dyn Notifier> = notifier.clone();
        resolver.submit(Task {
            key,
            start_ver,
            commit_ver,
            notifier: Some(dyn_notifier),
        });
    }
    let failures = notifier.wait();
    for failure in &failures {
        warn!(key = %failure.key, error = %failure.error, "cannot resolve abandoned lock");
        if let Some(start_ver) = starts.get(&failure.key) {
            cap_below(&mut capped, *start_ver);
        }
    }

    Ok(ResolvedLocks {
        safe_point: capped,
        locks_resolved: (starts.len() - failures.len()) as u64,
    })
}

fn cap_below(safe_point: &mut Version, start_ver: Version) {
    *safe_point = (*safe_point).min(Version(start_ver.0.saturating_sub(1)));
}

/// Commit version for an abandoned lock, [`Version::MIN`] to roll it back,
/// or `None` while its owner may still be running.
fn decide_abandoned(
    store: &DurableStore,
    key: &Key,
    lock: &Lock,
    current: Version,
) -> KvResult<Option<Version>> {
    if lock.expires_at() >= current {
        return Ok(None);
    }
    match decide_lock(store, key, lock, current) {
        Ok(LockDecision::Alive) => Ok(None),
        Ok(LockDecision::Commit(commit_ver)) => Ok(Some(commit_ver)),
        Ok(LockDecision::Rollback) => Ok(Some(Version::MIN)),
        Err(err) if err.is_retryable() => {
            warn!(key = %key, error = %err, "cannot decide abandoned lock");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Delete versions of `task`'s range no reader at or after the safe point
/// can observe.
///
/// Locks are left alone; [`resolve_locks`] must have settled every lock at
/// or below the safe point first.
pub fn collect(store: &DurableStore, task: &GcTask) -> KvResult<GcStats> {
    let lower = (!task.lower.is_empty()).then(|| encode_key_prefix(&task.lower));
    let upper = (!task.upper.is_empty()).then(|| encode_key_prefix(&task.upper));
    let mut cursor = MvccCursor::new(store.db(), lower, upper);
    cursor.seek_to_first();

    let mut stats = GcStats::default();
    let mut batch = WriteBatch::default();

    while let Some((key, _)) = cursor.current()? {
        stats.keys_scanned += 1;
        cursor.read_lock(&key)?;

        // Newest to oldest; once a visible version at or below the safe
        // point is found everything older is unreachable.
        let mut obsolete = false;
        while let Some((ver, value)) = cursor.read_value(&key)? {
            if ver > task.safe_point {
                continue;
            }
            let delete = obsolete
                || match value.value_type {
                    ValueType::Put => {
                        obsolete = true;
                        false
                    }
                    ValueType::Delete => {
                        obsolete = true;
                        true
                    }
                    ValueType::Lock | ValueType::Rollback => true,
                };
            if delete {
                batch.delete(encode(&key, ver));
                stats.versions_deleted += 1;
            }
        }
    }

    store.write(batch)?;
    debug!(
        lower = %task.lower,
        upper = %task.upper,
        safe_point = %task.safe_point,
        keys = stats.keys_scanned,
        deleted = stats.versions_deleted,
        "gc task finished"
    );
    Ok(stats)
}
