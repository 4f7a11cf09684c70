//! Persistence layer
//!
//! RocksDB is the durable, ordered key-value store underneath the MVCC
//! engine. Everything above this module talks to it through atomic write
//! batches, point lookups and bounded raw iterators.

pub mod storage;

pub use storage::{DurableStore, DATA_CF, META_CF};
