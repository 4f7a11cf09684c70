//! Transaction status checks on the primary key

use rocksdb::{WriteBatch, DB};
use tracing::debug;

use super::resolve::rollback;
use crate::kv::{Key, KvError, KvResult, Version};
use crate::mvcc::{Lock, MvccCursor, ValueType};
use crate::persistence::DurableStore;

/// What the checker concluded about a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnAction {
    /// The transaction still holds a live lock on its primary
    None,
    /// The primary lock outlived its TTL and may be rolled back
    TtlExpireRollback,
    /// The transaction was rolled back
    LockNotExistRollback,
    /// The transaction committed
    LockNotExistDoNothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnStatus {
    /// Commit version, set for [`TxnAction::LockNotExistDoNothing`]
    pub commit_ver: Version,
    pub action: TxnAction,
}

impl TxnStatus {
    fn action(action: TxnAction) -> Self {
        Self {
            commit_ver: Version::MIN,
            action,
        }
    }
}

/// Status of transaction `start_ver` as recorded on its `primary` key.
pub fn check_txn_status(
    db: &DB,
    primary: &[u8],
    start_ver: Version,
    current_ver: Version,
) -> KvResult<TxnStatus> {
    let mut cursor = MvccCursor::for_key(db, primary);
    cursor.seek_key(primary);

    if let Some(lock) = cursor.read_lock(primary)? {
        if lock.start_ver == start_ver {
            if lock.expires_at() < current_ver {
                return Ok(TxnStatus::action(TxnAction::TtlExpireRollback));
            }
            return Ok(TxnStatus::action(TxnAction::None));
        }
    }

    match cursor.find_commit_record(primary, start_ver)? {
        Some(record) if record.value_type == ValueType::Rollback => {
            Ok(TxnStatus::action(TxnAction::LockNotExistRollback))
        }
        Some(record) => Ok(TxnStatus {
            commit_ver: record.commit_ver,
            action: TxnAction::LockNotExistDoNothing,
        }),
        None => Err(KvError::Retryable("transaction status missing".to_string())),
    }
}

/// How a lock left by another transaction should be cleaned up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    /// The owner is still running
    Alive,
    /// The owner committed at this version
    Commit(Version),
    /// The owner is rolled back
    Rollback,
}

/// Decide the fate of `lock` found on `key`.
///
/// An expired owner is rolled back on its primary first, so that the
/// decision for the secondary can never race with a late commit.
pub fn decide_lock(
    store: &DurableStore,
    key: &[u8],
    lock: &Lock,
    current_ver: Version,
) -> KvResult<LockDecision> {
    let status = match check_txn_status(store.db(), &lock.primary, lock.start_ver, current_ver) {
        Ok(status) => status,
        Err(KvError::Retryable(_)) if lock.expires_at() < current_ver => {
            TxnStatus::action(TxnAction::TtlExpireRollback)
        }
        Err(KvError::Retryable(_)) => return Ok(LockDecision::Alive),
        Err(err) => return Err(err),
    };

    match status.action {
        TxnAction::None => Ok(LockDecision::Alive),
        TxnAction::LockNotExistDoNothing => Ok(LockDecision::Commit(status.commit_ver)),
        TxnAction::LockNotExistRollback => Ok(LockDecision::Rollback),
        TxnAction::TtlExpireRollback => {
            let _fence = store.fence(&lock.primary);
            let mut batch = WriteBatch::default();
            match rollback(store.db(), &mut batch, &lock.primary, lock.start_ver) {
                Ok(()) => {
                    store.write(batch)?;
                    debug!(
                        key = %Key::from(key),
                        primary = %lock.primary,
                        start_ver = %lock.start_ver,
                        "rolled back expired primary"
                    );
                    Ok(LockDecision::Rollback)
                }
                Err(KvError::AlreadyCommitted(commit_ver)) => Ok(LockDecision::Commit(commit_ver)),
                Err(err) => Err(err),
            }
        }
    }
}
