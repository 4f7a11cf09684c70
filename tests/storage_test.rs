//! Integration tests for the storage facade
//!
//! Verifies commits, snapshot reads, iteration and restarts through the
//! public API only.

use samyama_kv::{Key, KvError, KvIterator, Storage, StorageOptions, TxnState, Version};
use tempfile::TempDir;

fn options() -> StorageOptions {
    StorageOptions {
        gc_enabled: false,
        resolver_workers: 2,
        ..StorageOptions::default()
    }
}

fn pairs<I: KvIterator>(iter: I) -> Vec<(String, String)> {
    iter.collect_pairs()
        .unwrap()
        .into_iter()
        .map(|(k, v)| {
            (
                String::from_utf8(k.into_inner()).unwrap(),
                String::from_utf8(v).unwrap(),
            )
        })
        .collect()
}

fn owned(expected: &[(&str, &str)]) -> Vec<(String, String)> {
    expected
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_commit_and_read_back() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), options()).unwrap();

    let mut txn = storage.begin().unwrap();
    txn.set(b"a", b"1").unwrap();
    txn.set(b"b", b"2").unwrap();
    txn.set(b"c", b"3").unwrap();
    let commit_ver = txn.commit().unwrap();
    assert!(commit_ver > txn.start_ver());

    let mut txn = storage.begin().unwrap();
    assert_eq!(txn.get(b"b").unwrap(), Some(b"2".to_vec()));
    txn.delete(b"b").unwrap();
    txn.set(b"d", b"4").unwrap();
    txn.commit().unwrap();

    let txn = storage.begin().unwrap();
    assert_eq!(
        pairs(txn.iter(b"", b"").unwrap()),
        owned(&[("a", "1"), ("c", "3"), ("d", "4")])
    );
    assert_eq!(
        pairs(txn.iter_reverse(b"b", b"d").unwrap()),
        owned(&[("c", "3")])
    );
}

#[test]
fn test_snapshot_reads_history() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), options()).unwrap();

    let mut versions = Vec::new();
    for value in ["v1", "v2", "v3"] {
        let mut txn = storage.begin().unwrap();
        txn.set(b"key", value.as_bytes()).unwrap();
        versions.push(txn.commit().unwrap());
    }
    let mut txn = storage.begin().unwrap();
    txn.delete(b"key").unwrap();
    let deleted_at = txn.commit().unwrap();

    for (ver, expected) in versions.iter().zip(["v1", "v2", "v3"]) {
        let snapshot = storage.snapshot(*ver).unwrap();
        assert_eq!(snapshot.get(b"key").unwrap(), expected.as_bytes().to_vec());
    }
    let before = storage.snapshot(Version(versions[0].0 - 1)).unwrap();
    assert!(before.get(b"key").unwrap_err().is_not_exist());
    let after = storage.snapshot(deleted_at).unwrap();
    assert!(after.get(b"key").unwrap_err().is_not_exist());

    assert!(matches!(
        storage.snapshot(Version::LOCK),
        Err(KvError::InvalidStartVer)
    ));
}

#[test]
fn test_snapshot_iteration_merges_buffer() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), options()).unwrap();
    storage
        .run_in_txn(|txn| {
            for k in ["t1", "t3", "t5", "u1"] {
                txn.set(k.as_bytes(), k.as_bytes())?;
            }
            Ok(())
        })
        .unwrap();

    let mut txn = storage.begin().unwrap();
    txn.set(b"t2", b"t2").unwrap();
    txn.set(b"t3", b"new").unwrap();
    txn.delete(b"t5").unwrap();

    assert_eq!(
        pairs(txn.iter(b"t", b"u").unwrap()),
        owned(&[("t1", "t1"), ("t2", "t2"), ("t3", "new")])
    );
    assert_eq!(
        pairs(txn.iter_reverse(b"t", b"").unwrap()),
        owned(&[("u1", "u1"), ("t3", "new"), ("t2", "t2"), ("t1", "t1")])
    );
}

#[test]
fn test_insert_existing_key_fails() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), options()).unwrap();

    let mut txn = storage.begin().unwrap();
    txn.insert(b"user:1", b"alice").unwrap();
    txn.commit().unwrap();

    let mut txn = storage.begin().unwrap();
    txn.insert(b"user:1", b"bob").unwrap();
    match txn.commit() {
        Err(KvError::KeyAlreadyExist(key)) => assert_eq!(key, Key::from("user:1")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(txn.state(), TxnState::RolledBack);

    let txn = storage.begin().unwrap();
    assert_eq!(txn.get(b"user:1").unwrap(), Some(b"alice".to_vec()));
}

#[test]
fn test_insert_then_delete_of_existing_key_fails() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), options()).unwrap();
    storage.run_in_txn(|txn| txn.set(b"user:1", b"alice")).unwrap();

    let mut txn = storage.begin().unwrap();
    txn.insert(b"user:1", b"bob").unwrap();
    txn.delete(b"user:1").unwrap();
    match txn.commit() {
        Err(KvError::KeyAlreadyExist(key)) => assert_eq!(key, Key::from("user:1")),
        other => panic!("unexpected {:?}", other),
    }

    let txn = storage.begin().unwrap();
    assert_eq!(txn.get(b"user:1").unwrap(), Some(b"alice".to_vec()));
}

#[test]
fn test_restart_keeps_data_and_versions() {
    let dir = TempDir::new().unwrap();
    let last = {
        let storage = Storage::open(dir.path(), options()).unwrap();
        storage
            .run_in_txn(|txn| txn.set(b"persisted", b"yes"))
            .unwrap();
        let last = storage.current_version();
        storage.close().unwrap();
        last
    };

    let storage = Storage::open(dir.path(), options()).unwrap();
    assert!(storage.current_version() > last);
    let txn = storage.begin().unwrap();
    assert_eq!(txn.get(b"persisted").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn test_options_from_yaml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("storage.yaml");
    std::fs::write(&path, "gc_enabled: false\nlatch_slots: 64\nlock_ttl_ms: 500\n").unwrap();
    let options = StorageOptions::from_yaml_file(&path).unwrap();

    let storage = Storage::open(dir.path().join("data"), options).unwrap();
    assert_eq!(storage.options().latch_slots, 64);
    assert_eq!(storage.options().lock_ttl_ms, 500);
    storage.run_in_txn(|txn| txn.set(b"k", b"v")).unwrap();
    assert_eq!(storage.metrics().txn_committed, 1);
}

#[test]
fn test_entry_size_limit() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(
        dir.path(),
        StorageOptions {
            entry_size_limit: 16,
            ..options()
        },
    )
    .unwrap();
    let mut txn = storage.begin().unwrap();
    assert!(matches!(
        txn.set(b"key", &[7u8; 32]),
        Err(KvError::EntryTooLarge { limit: 16, .. })
    ));
    assert_eq!(txn.get(b"key").unwrap(), None);
}
