//! Samyama KV
//!
//! An embeddable, transactional MVCC key-value storage engine on top of
//! RocksDB. It is the storage layer underneath the Samyama graph database:
//! graph vertices, edges and indexes are encoded into ordered byte keys
//! (see [`codec::graph`]) and read and written through optimistic
//! transactions.
//!
//! # Architecture
//!
//! - [`kv`]: keys, versions, key flags and the error taxonomy
//! - [`mvcc`]: versioned key encoding and the lock/value records
//! - [`memdb`]: the staged in-memory buffer of a transaction
//! - [`txn`]: snapshots, the union store and two-phase commit
//! - [`latch`]: serializes transactions that commit overlapping keys
//! - [`resolver`]: background workers committing or rolling back locks
//! - [`gc`]: removal of versions no reader can observe anymore
//! - [`persistence`]: the RocksDB handle and engine metadata
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use samyama_kv::{Storage, StorageOptions};
//!
//! # fn main() -> samyama_kv::KvResult<()> {
//! let storage = Storage::open("/tmp/samyama-kv", StorageOptions::default())?;
//!
//! let mut txn = storage.begin()?;
//! txn.set(b"alice", b"30")?;
//! txn.insert(b"bob", b"25")?;
//! txn.commit()?;
//!
//! let txn = storage.begin()?;
//! assert_eq!(txn.get(b"alice")?, Some(b"30".to_vec()));
//!
//! storage.close()?;
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod gc;
pub mod kv;
pub mod latch;
pub mod memdb;
pub mod metrics;
pub mod mvcc;
pub mod persistence;
pub mod resolver;
pub mod storage;
pub mod txn;

// Re-export main types for convenience
pub use config::StorageOptions;

pub use kv::{
    FlagsOp, Key, KeyFlags, KvError, KvIterator, KvResult, LockedError, Version,
    VersionProvider,
};

pub use memdb::{MemDb, StagingHandle};

pub use metrics::{MetricsSnapshot, StorageMetrics};

pub use gc::GcStats;

pub use storage::Storage;

pub use txn::{Snapshot, SnapshotIter, Transaction, TxnState, UnionIter, UnionStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}
