//! Storage engine errors

use thiserror::Error;

use super::{Key, Version};
use crate::codec::CodecError;

/// A read or write ran into an unresolved lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedError {
    pub key: Key,
    pub primary: Key,
    pub start_ver: Version,
    /// Lock time to live in milliseconds
    pub ttl: u64,
}

/// Storage engine errors
#[derive(Error, Debug)]
pub enum KvError {
    /// A newer transaction committed to the same keys
    #[error("transaction conflicts with a newer committed transaction")]
    TxnConflicts,

    /// Write conflict found during prewrite
    #[error(
        "write conflict on key {key}: start version {start_ver}, conflicting start version {conflict_start_ver}, conflicting commit version {conflict_commit_ver}"
    )]
    Conflict {
        key: Key,
        start_ver: Version,
        conflict_start_ver: Version,
        conflict_commit_ver: Version,
    },

    /// Key is locked by an unresolved transaction
    #[error("key {} is locked by transaction {} (primary {}, ttl {}ms)", .0.key, .0.start_ver, .0.primary, .0.ttl)]
    Locked(LockedError),

    /// Transient failure, the operation may be retried later
    #[error("retryable: {0}")]
    Retryable(String),

    /// Rollback attempted on a committed transaction
    #[error("transaction already committed at version {0}")]
    AlreadyCommitted(Version),

    /// Key not found
    #[error("key not exist")]
    NotExist,

    /// Empty values are reserved for deletes
    #[error("cannot set an empty value")]
    EmptyValue,

    /// Transaction already committed or rolled back
    #[error("invalid transaction")]
    InvalidTxn,

    #[error("invalid start version")]
    InvalidStartVer,

    /// A single key/value pair is larger than the configured limit
    #[error("entry too large: size {size}, limit {limit}")]
    EntryTooLarge { limit: u64, size: u64 },

    /// The transaction buffer grew past the configured limit
    #[error("transaction too large: size {size}")]
    TxnTooLarge { size: u64 },

    /// Insert of a key that already exists
    #[error("key already exists: {0}")]
    KeyAlreadyExist(Key),

    /// Staging handle released or cleaned up out of order
    #[error("staging handle {got} used out of order, innermost is {innermost}")]
    StagingOutOfOrder { got: usize, innermost: usize },

    /// Malformed encoded key or value
    #[error("invalid encoded key: {0}")]
    InvalidEncodedKey(#[from] CodecError),

    /// Record (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// RocksDB error
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family missing
    #[error("column family error: {0}")]
    ColumnFamily(String),

    /// Wall clock is behind the persisted version high-water mark
    #[error("clock moved backwards: persisted version {persisted}, wall clock {now}")]
    ClockRegression { persisted: Version, now: Version },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage already closed
    #[error("storage closed")]
    Closed,
}

pub type KvResult<T> = Result<T, KvError>;

impl KvError {
    /// Whether re-running the transaction or request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KvError::TxnConflicts
                | KvError::Conflict { .. }
                | KvError::Locked(_)
                | KvError::Retryable(_)
        )
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(self, KvError::NotExist)
    }

    pub(crate) fn txn_not_found() -> KvError {
        KvError::Retryable("txn not found".to_string())
    }
}
