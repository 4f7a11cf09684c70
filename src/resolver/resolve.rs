//! Commit and roll back individual write intents

use rocksdb::{WriteBatch, DB};

use crate::kv::{KvError, KvResult, Version};
use crate::mvcc::{encode, lock_key, MvccCursor, Value, ValueType};

/// Turn the lock of `start_ver` on `key` into a committed version.
///
/// The value record is written at `(key, commit_ver)` and the lock deleted
/// in `batch`. When the lock is gone the transaction must already have
/// committed, otherwise a retryable error is returned.
pub fn resolve(
    db: &DB,
    batch: &mut WriteBatch,
    key: &[u8],
    start_ver: Version,
    commit_ver: Version,
) -> KvResult<()> {
    let mut cursor = MvccCursor::for_key(db, key);
    cursor.seek_key(key);

    match cursor.read_lock(key)? {
        Some(lock) if lock.start_ver == start_ver => {
            let value = Value {
                value_type: lock.op.into(),
                start_ver,
                commit_ver,
                value: lock.value,
            };
            batch.put(encode(key, commit_ver), value.marshal()?);
            batch.delete(lock_key(key));
            Ok(())
        }
        _ => match cursor.find_commit_record(key, start_ver)? {
            Some(record) if record.is_commit() => Ok(()),
            _ => Err(KvError::txn_not_found()),
        },
    }
}

/// Roll back the transaction `start_ver` on `key`.
///
/// A rollback record is left at `(key, start_ver)` so the transaction can
/// never commit on this key afterwards, even when it had not prewritten it.
pub fn rollback(db: &DB, batch: &mut WriteBatch, key: &[u8], start_ver: Version) -> KvResult<()> {
    let mut cursor = MvccCursor::for_key(db, key);
    cursor.seek_key(key);

    if let Some(lock) = cursor.read_lock(key)? {
        if lock.start_ver == start_ver {
            write_rollback(batch, key, start_ver)?;
            batch.delete(lock_key(key));
            return Ok(());
        }
    }

    match cursor.find_commit_record(key, start_ver)? {
        Some(record) if record.value_type == ValueType::Rollback => Ok(()),
        Some(record) => Err(KvError::AlreadyCommitted(record.commit_ver)),
        None => write_rollback(batch, key, start_ver),
    }
}

fn write_rollback(batch: &mut WriteBatch, key: &[u8], start_ver: Version) -> KvResult<()> {
    batch.put(encode(key, start_ver), Value::rollback(start_ver).marshal()?);
    Ok(())
}
