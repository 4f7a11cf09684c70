//! Two-phase commit of a transaction buffer

use rocksdb::WriteBatch;
use tracing::{debug, warn};

use super::Engine;
use crate::kv::{Key, KvError, KvIterator, KvResult, LockedError, Version};
use crate::memdb::MemDb;
use crate::mvcc::{lock_key, Lock, MvccCursor, Op, ValueType};
use crate::resolver::{decide_lock, resolve, LockDecision};

/// One key of the write set
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Mutation {
    pub(super) key: Key,
    pub(super) op: Op,
    pub(super) value: Vec<u8>,
    /// Checked in prewrite, never locked or committed
    pub(super) prewrite_only: bool,
}

impl Mutation {
    /// Existence checks and prewrite-only keys are verified during prewrite
    /// but leave no lock.
    fn writes_lock(&self) -> bool {
        self.op != Op::CheckNotExists && !self.prewrite_only
    }
}

/// Turn the buffer content into the write set of the transaction.
pub(super) fn collect_mutations(buffer: &MemDb) -> KvResult<Vec<Mutation>> {
    let mut mutations = Vec::new();
    let mut iter = buffer.iter_with_flags(b"", b"");
    while iter.valid() {
        let key = iter.key();
        let flags = iter.flags();
        let value = iter.value();
        let presume = flags.has_presume_key_not_exists();
        let op = if !value.is_empty() {
            Some(if presume { Op::Insert } else { Op::Put })
        } else if buffer.get(key).is_ok() {
            if presume {
                // Inserted and deleted again: the key must still be absent.
                Some(Op::CheckNotExists)
            } else if flags.has_newly_inserted() {
                None
            } else {
                Some(Op::Del)
            }
        } else if flags.has_locked() {
            Some(Op::Lock)
        } else if presume {
            Some(Op::CheckNotExists)
        } else {
            None
        };
        if let Some(op) = op {
            if presume && flags.has_locked_value_exists() {
                return Err(KvError::KeyAlreadyExist(Key::from(key)));
            }
            mutations.push(Mutation {
                key: Key::from(key),
                op,
                value: value.to_vec(),
                prewrite_only: flags.has_prewrite_only(),
            });
        }
        iter.next()?;
    }
    Ok(mutations)
}

/// Commit `mutations` of transaction `start_ver`.
///
/// Returns the commit version, or `None` when nothing had to be written.
pub(super) fn commit(
    engine: &Engine,
    start_ver: Version,
    mutations: Vec<Mutation>,
) -> KvResult<Option<Version>> {
    if engine.is_closed() {
        return Err(KvError::Closed);
    }
    if mutations.is_empty() {
        return Ok(None);
    }

    let keys: Vec<Key> = mutations.iter().map(|m| m.key.clone()).collect();
    let latch = engine.latches.lock(start_ver, keys);
    if latch.is_stale() {
        engine.latches.unlock(latch);
        return Err(KvError::TxnConflicts);
    }

    let result = two_phase(engine, start_ver, &mutations);
    if let Ok(Some(commit_ver)) = &result {
        latch.set_commit_ver(*commit_ver);
    }
    engine.latches.unlock(latch);
    result
}

fn two_phase(
    engine: &Engine,
    start_ver: Version,
    mutations: &[Mutation],
) -> KvResult<Option<Version>> {
    let primary = match prewrite(engine, start_ver, mutations)? {
        Some(primary) => primary,
        None => return Ok(None),
    };
    let commit_ver = engine.current_version();

    if let Err(err) = commit_primary(engine, &primary, start_ver, commit_ver) {
        let locked: Vec<Key> = mutations
            .iter()
            .filter(|m| m.writes_lock())
            .map(|m| m.key.clone())
            .collect();
        for failure in engine.resolver.resolve_and_wait(&locked, start_ver, Version::MIN) {
            warn!(key = %failure.key, start_ver = %start_ver, error = %failure.error, "rollback after failed commit");
        }
        return Err(err);
    }

    let secondaries: Vec<Key> = mutations
        .iter()
        .filter(|m| m.writes_lock() && m.key != primary)
        .map(|m| m.key.clone())
        .collect();
    for failure in engine.resolver.resolve_and_wait(&secondaries, start_ver, commit_ver) {
        // The primary is committed; readers and GC finish the key later.
        warn!(key = %failure.key, start_ver = %start_ver, commit_ver = %commit_ver, error = %failure.error, "resolve secondary failed");
    }

    debug!(start_ver = %start_ver, commit_ver = %commit_ver, keys = mutations.len(), "transaction committed");
    Ok(Some(commit_ver))
}

/// Check every key and write all locks in one batch.
///
/// Returns the primary key, or `None` when no key needs a lock.
fn prewrite(engine: &Engine, start_ver: Version, mutations: &[Mutation]) -> KvResult<Option<Key>> {
    let primary = match mutations.iter().find(|m| m.writes_lock()) {
        Some(m) => m.key.clone(),
        None => {
            for m in mutations {
                check_key(engine, start_ver, m)?;
            }
            return Ok(None);
        }
    };

    let mut batch = WriteBatch::default();
    for m in mutations {
        check_key(engine, start_ver, m)?;
        if !m.writes_lock() {
            continue;
        }
        let op = match m.op {
            Op::Insert => Op::Put,
            op => op,
        };
        let lock = Lock {
            start_ver,
            primary: primary.clone(),
            value: m.value.clone(),
            op,
            ttl: engine.options.lock_ttl_ms,
        };
        batch.put(lock_key(&m.key), lock.marshal()?);
    }
    engine.store.write(batch)?;
    Ok(Some(primary))
}

/// Conflict and constraint checks of one key.
fn check_key(engine: &Engine, start_ver: Version, m: &Mutation) -> KvResult<()> {
    let db = engine.store.db();
    let mut resolved = false;
    loop {
        let mut cursor = MvccCursor::for_key(db, &m.key);
        cursor.seek_key(&m.key);

        if let Some(lock) = cursor.read_lock(&m.key)? {
            if lock.start_ver != start_ver {
                if resolved || !resolve_foreign_lock(engine, &m.key, &lock)? {
                    return Err(KvError::Locked(LockedError {
                        key: m.key.clone(),
                        primary: lock.primary,
                        start_ver: lock.start_ver,
                        ttl: lock.ttl,
                    }));
                }
                resolved = true;
                continue;
            }
        }

        let mut exists = false;
        while let Some((ver, value)) = cursor.read_value(&m.key)? {
            if ver >= start_ver {
                if value.value_type == ValueType::Rollback {
                    if value.start_ver == start_ver {
                        return Err(KvError::Retryable(format!(
                            "transaction {} already rolled back",
                            start_ver
                        )));
                    }
                    continue;
                }
                return Err(KvError::Conflict {
                    key: m.key.clone(),
                    start_ver,
                    conflict_start_ver: value.start_ver,
                    conflict_commit_ver: value.commit_ver,
                });
            }
            match value.value_type {
                ValueType::Put => {
                    exists = true;
                    break;
                }
                ValueType::Delete => break,
                ValueType::Lock | ValueType::Rollback => {}
            }
        }

        if exists && matches!(m.op, Op::Insert | Op::CheckNotExists) {
            return Err(KvError::KeyAlreadyExist(m.key.clone()));
        }
        return Ok(());
    }
}

/// Try to clear a lock of another transaction; false when its owner is alive.
fn resolve_foreign_lock(engine: &Engine, key: &Key, lock: &Lock) -> KvResult<bool> {
    let commit_ver = match decide_lock(&engine.store, key, lock, engine.current_version())? {
        LockDecision::Alive => return Ok(false),
        LockDecision::Commit(commit_ver) => commit_ver,
        LockDecision::Rollback => Version::MIN,
    };
    let failures =
        engine
            .resolver
            .resolve_and_wait(std::slice::from_ref(key), lock.start_ver, commit_ver);
    for failure in failures {
        if !failure.error.is_retryable() {
            return Err(failure.error);
        }
    }
    Ok(true)
}

/// Commit point: the primary turns into a committed version.
fn commit_primary(
    engine: &Engine,
    primary: &Key,
    start_ver: Version,
    commit_ver: Version,
) -> KvResult<()> {
    let store = &engine.store;
    let _fence = store.fence(primary);
    let mut batch = WriteBatch::default();
    resolve(store.db(), &mut batch, primary, start_ver, commit_ver)?;
    store.record_high_water(&mut batch, commit_ver)?;
    store.write(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FlagsOp;
    use crate::mvcc::{encode, Value};
    use crate::txn::tests::test_engine;
    use tempfile::TempDir;

    fn put(engine: &Engine, key: &[u8], value: &[u8], start: u64, commit: u64) {
        let record = Value {
            value_type: ValueType::Put,
            start_ver: Version(start),
            commit_ver: Version(commit),
            value: value.to_vec(),
        };
        engine
            .store
            .db()
            .put(encode(key, Version(commit)), record.marshal().unwrap())
            .unwrap();
    }

    fn mutation(key: &str, op: Op, value: &str) -> Mutation {
        Mutation {
            key: Key::from(key),
            op,
            value: value.as_bytes().to_vec(),
            prewrite_only: false,
        }
    }

    #[test]
    fn test_collect_mutations() {
        let mut buffer = MemDb::new();
        buffer.set(b"a", b"1").unwrap();
        buffer
            .set_with_flags(b"b", b"2", &[FlagsOp::SetPresumeKeyNotExists])
            .unwrap();
        buffer.delete(b"c").unwrap();
        buffer.update_flags(b"d", &[FlagsOp::SetKeyLocked]);
        buffer.update_flags(b"e", &[FlagsOp::SetPresumeKeyNotExists]);
        buffer.update_flags(b"f", &[FlagsOp::SetNeedConstraintCheckInPrewrite]);
        buffer
            .set_with_flags(b"g", b"3", &[FlagsOp::SetPresumeKeyNotExists])
            .unwrap();
        buffer.delete(b"g").unwrap();
        buffer
            .set_with_flags(b"h", b"4", &[FlagsOp::SetNewlyInserted])
            .unwrap();
        buffer.delete(b"h").unwrap();
        buffer
            .set_with_flags(b"i", b"5", &[FlagsOp::SetPrewriteOnly])
            .unwrap();

        let mutations = collect_mutations(&buffer).unwrap();
        let mut prewrite_only = mutation("i", Op::Put, "5");
        prewrite_only.prewrite_only = true;
        assert_eq!(
            mutations,
            vec![
                mutation("a", Op::Put, "1"),
                mutation("b", Op::Insert, "2"),
                mutation("c", Op::Del, ""),
                mutation("d", Op::Lock, ""),
                mutation("e", Op::CheckNotExists, ""),
                mutation("g", Op::CheckNotExists, ""),
                prewrite_only,
            ]
        );
    }

    #[test]
    fn test_collect_mutations_locked_value_exists() {
        let mut buffer = MemDb::new();
        buffer.update_flags(
            b"a",
            &[FlagsOp::SetKeyLocked, FlagsOp::SetKeyLockedValueExists],
        );
        buffer
            .set_with_flags(b"a", b"1", &[FlagsOp::SetPresumeKeyNotExists])
            .unwrap();
        assert!(matches!(
            collect_mutations(&buffer),
            Err(KvError::KeyAlreadyExist(key)) if key == Key::from("a")
        ));
    }

    #[test]
    fn test_prewrite_only_key_is_checked_not_written() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let start = engine.current_version();
        let mut check = mutation("b", Op::Put, "2");
        check.prewrite_only = true;
        let commit_ver = commit(&engine, start, vec![mutation("a", Op::Put, "1"), check.clone()])
            .unwrap()
            .unwrap();
        let db = engine.store.db();
        assert!(db.get(encode(b"a", commit_ver)).unwrap().is_some());
        assert!(db.get(encode(b"b", commit_ver)).unwrap().is_none());
        assert!(db.get(lock_key(b"b")).unwrap().is_none());

        // Still conflicts with a newer commit on the key.
        let later = engine.current_version();
        put(&engine, b"b", b"other", later.0 + 1, later.0 + 2);
        let err = commit(&engine, later, vec![check]).unwrap_err();
        assert!(matches!(err, KvError::Conflict { .. }));
    }

    #[test]
    fn test_commit_writes_values_and_high_water() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let start = engine.current_version();
        let commit_ver = commit(
            &engine,
            start,
            vec![mutation("a", Op::Put, "1"), mutation("b", Op::Del, "")],
        )
        .unwrap()
        .unwrap();
        assert!(commit_ver > start);

        let db = engine.store.db();
        assert!(db.get(lock_key(b"a")).unwrap().is_none());
        assert!(db.get(lock_key(b"b")).unwrap().is_none());
        let raw = db.get(encode(b"a", commit_ver)).unwrap().unwrap();
        assert_eq!(Value::unmarshal(&raw).unwrap().value, b"1".to_vec());
        let raw = db.get(encode(b"b", commit_ver)).unwrap().unwrap();
        assert_eq!(Value::unmarshal(&raw).unwrap().value_type, ValueType::Delete);
        assert_eq!(engine.store.high_water().unwrap(), commit_ver);
    }

    #[test]
    fn test_empty_write_set() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        assert_eq!(commit(&engine, engine.current_version(), Vec::new()).unwrap(), None);
    }

    #[test]
    fn test_newer_commit_conflicts() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let start = engine.current_version();
        put(&engine, b"a", b"other", start.0 + 1, start.0 + 2);

        let err = commit(&engine, start, vec![mutation("a", Op::Put, "1")]).unwrap_err();
        match err {
            KvError::Conflict {
                conflict_commit_ver,
                ..
            } => assert_eq!(conflict_commit_ver, Version(start.0 + 2)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(engine.store.db().get(lock_key(b"a")).unwrap().is_none());
    }

    #[test]
    fn test_insert_existing_key() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        put(&engine, b"a", b"old", 1, 2);
        let start = engine.current_version();

        let err = commit(&engine, start, vec![mutation("a", Op::Insert, "1")]).unwrap_err();
        assert!(matches!(err, KvError::KeyAlreadyExist(key) if key == Key::from("a")));

        let err = commit(&engine, start, vec![mutation("a", Op::CheckNotExists, "")]).unwrap_err();
        assert!(matches!(err, KvError::KeyAlreadyExist(_)));
    }

    #[test]
    fn test_insert_after_delete() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        put(&engine, b"a", b"old", 1, 2);
        let record = Value {
            value_type: ValueType::Delete,
            start_ver: Version(3),
            commit_ver: Version(4),
            value: Vec::new(),
        };
        engine
            .store
            .db()
            .put(encode(b"a", Version(4)), record.marshal().unwrap())
            .unwrap();

        let start = engine.current_version();
        let commit_ver = commit(&engine, start, vec![mutation("a", Op::Insert, "new")])
            .unwrap()
            .unwrap();
        let raw = engine.store.db().get(encode(b"a", commit_ver)).unwrap().unwrap();
        let value = Value::unmarshal(&raw).unwrap();
        assert_eq!(value.value_type, ValueType::Put);
        assert_eq!(value.value, b"new".to_vec());
    }

    #[test]
    fn test_live_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let other = engine.current_version();
        let lock = Lock {
            start_ver: other,
            primary: Key::from("a"),
            value: b"x".to_vec(),
            op: Op::Put,
            ttl: 60_000,
        };
        engine
            .store
            .db()
            .put(lock_key(b"a"), lock.marshal().unwrap())
            .unwrap();

        let start = engine.current_version();
        let err = commit(&engine, start, vec![mutation("a", Op::Put, "1")]).unwrap_err();
        assert!(matches!(err, KvError::Locked(ref locked) if locked.start_ver == other));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_expired_foreign_lock_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let lock = Lock {
            start_ver: Version(10),
            primary: Key::from("a"),
            value: b"x".to_vec(),
            op: Op::Put,
            ttl: 1,
        };
        engine
            .store
            .db()
            .put(lock_key(b"a"), lock.marshal().unwrap())
            .unwrap();

        let start = engine.current_version();
        let commit_ver = commit(&engine, start, vec![mutation("a", Op::Put, "1")])
            .unwrap()
            .unwrap();
        let raw = engine.store.db().get(encode(b"a", Version(10))).unwrap().unwrap();
        assert_eq!(Value::unmarshal(&raw).unwrap().value_type, ValueType::Rollback);
        assert!(engine.store.db().get(encode(b"a", commit_ver)).unwrap().is_some());
    }

    #[test]
    fn test_rolled_back_primary_aborts_commit() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let start = engine.current_version();
        engine
            .store
            .db()
            .put(encode(b"a", start), Value::rollback(start).marshal().unwrap())
            .unwrap();

        let err = commit(&engine, start, vec![mutation("a", Op::Put, "1"), mutation("b", Op::Put, "2")])
            .unwrap_err();
        assert!(matches!(err, KvError::Retryable(_)));
        assert!(engine.store.db().get(lock_key(b"b")).unwrap().is_none());
    }

    #[test]
    fn test_stale_latch() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let old = engine.current_version();
        let start = engine.current_version();
        commit(&engine, start, vec![mutation("a", Op::Put, "1")]).unwrap();

        let err = commit(&engine, old, vec![mutation("a", Op::Put, "2")]).unwrap_err();
        assert!(matches!(err, KvError::TxnConflicts));
    }
}
