//! Integration tests for concurrent transactions and lock cleanup

use samyama_kv::mvcc::{encode, lock_key, Lock, Op, Value, ValueType};
use samyama_kv::persistence::DurableStore;
use samyama_kv::{Key, KvError, KvIterator, KvResult, Storage, StorageOptions, Version};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn options() -> StorageOptions {
    StorageOptions {
        gc_enabled: false,
        lock_ttl_ms: 100,
        ..StorageOptions::default()
    }
}

fn read_counter(storage: &Storage, key: &[u8]) -> u64 {
    let txn = storage.begin().unwrap();
    txn.get(key)
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap().parse().unwrap())
        .unwrap_or(0)
}

fn increment(storage: &Storage, key: &[u8]) -> KvResult<()> {
    let mut txn = storage.begin()?;
    let current: u64 = txn
        .get(key)?
        .map(|v| String::from_utf8(v).unwrap().parse().unwrap())
        .unwrap_or(0);
    txn.set(key, (current + 1).to_string().as_bytes())?;
    txn.commit()?;
    Ok(())
}

#[test]
fn test_concurrent_increments_are_serializable() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), options()).unwrap();
    let retries = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..10 {
                    loop {
                        match increment(&storage, b"counter") {
                            Ok(()) => break,
                            Err(err) if err.is_retryable() => {
                                retries.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => panic!("unexpected {:?}", err),
                        }
                    }
                }
            });
        }
    });

    assert_eq!(read_counter(&storage, b"counter"), 80);
    let metrics = storage.metrics();
    assert_eq!(metrics.txn_committed, 80);
    assert!(metrics.txn_conflicts as usize <= retries.load(Ordering::Relaxed));
}

#[test]
fn test_disjoint_writers_all_commit() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), options()).unwrap();

    std::thread::scope(|s| {
        for t in 0..4u8 {
            let storage = &storage;
            s.spawn(move || {
                for i in 0..25u8 {
                    let mut txn = storage.begin().unwrap();
                    txn.set(&[t, i], &[i]).unwrap();
                    txn.set(&[t, i, 0], &[i]).unwrap();
                    txn.commit().unwrap();
                }
            });
        }
    });

    let txn = storage.begin().unwrap();
    let pairs = txn.iter(b"", b"").unwrap().collect_pairs().unwrap();
    assert_eq!(pairs.len(), 200);
    assert_eq!(storage.metrics().txn_conflicts, 0);
}

#[test]
fn test_run_in_txn_under_contention() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), options()).unwrap();

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..5 {
                    let result = storage.run_in_txn(|txn| {
                        let current: u64 = txn
                            .get(b"n")?
                            .map(|v| String::from_utf8(v).unwrap().parse().unwrap())
                            .unwrap_or(0);
                        txn.set(b"n", (current + 1).to_string().as_bytes())
                    });
                    match result {
                        Ok(()) => {}
                        Err(err) if err.is_retryable() => {}
                        Err(err) => panic!("unexpected {:?}", err),
                    }
                }
            });
        }
    });

    let metrics = storage.metrics();
    assert_eq!(read_counter(&storage, b"n"), metrics.txn_committed);
}

/// Leave the locks of a transaction that never finished in `dir`.
fn crash_after_prewrite(dir: &TempDir, keys: &[&[u8]], start_ver: Version, ttl: u64) {
    let store = DurableStore::open(dir.path(), &StorageOptions::default()).unwrap();
    for key in keys {
        let lock = Lock {
            start_ver,
            primary: Key::from(keys[0]),
            value: b"orphan".to_vec(),
            op: Op::Put,
            ttl,
        };
        store.db().put(lock_key(key), lock.marshal().unwrap()).unwrap();
    }
}

#[test]
fn test_abandoned_locks_rolled_back_by_reader() {
    let dir = TempDir::new().unwrap();
    crash_after_prewrite(&dir, &[b"p", b"s"], Version(1_000), 1);

    let storage = Storage::open(dir.path(), options()).unwrap();
    let txn = storage.begin().unwrap();
    assert_eq!(txn.get(b"s").unwrap(), None);
    assert_eq!(txn.get(b"p").unwrap(), None);

    let mut txn = storage.begin().unwrap();
    txn.set(b"p", b"fresh").unwrap();
    txn.set(b"s", b"fresh").unwrap();
    txn.commit().unwrap();
    assert_eq!(storage.begin().unwrap().get(b"s").unwrap(), Some(b"fresh".to_vec()));
}

#[test]
fn test_committed_primary_rolls_secondaries_forward() {
    let dir = TempDir::new().unwrap();
    crash_after_prewrite(&dir, &[b"p", b"s"], Version(1_000), 1);
    {
        // The primary made it to the commit point before the crash.
        let store = DurableStore::open(dir.path(), &StorageOptions::default()).unwrap();
        let value = Value {
            value_type: ValueType::Put,
            start_ver: Version(1_000),
            commit_ver: Version(2_000),
            value: b"orphan".to_vec(),
        };
        store.db().delete(lock_key(b"p")).unwrap();
        store
            .db()
            .put(encode(b"p", Version(2_000)), value.marshal().unwrap())
            .unwrap();
    }

    let storage = Storage::open(dir.path(), options()).unwrap();
    let txn = storage.begin().unwrap();
    assert_eq!(txn.get(b"s").unwrap(), Some(b"orphan".to_vec()));
    assert_eq!(txn.get(b"p").unwrap(), Some(b"orphan".to_vec()));
    assert!(storage.metrics().locks_resolved >= 1);
}

#[test]
fn test_live_lock_reported_to_reader() {
    let dir = TempDir::new().unwrap();
    let start = {
        let storage = Storage::open(dir.path(), options()).unwrap();
        storage.current_version()
    };
    crash_after_prewrite(&dir, &[b"k"], start, 60_000);

    let storage = Storage::open(dir.path(), options()).unwrap();
    let txn = storage.begin().unwrap();
    match txn.get(b"k") {
        Err(KvError::Locked(locked)) => {
            assert_eq!(locked.start_ver, start);
            assert_eq!(locked.primary, Key::from("k"));
        }
        other => panic!("unexpected {:?}", other),
    }
}
