//! Storage engine configuration
//!
//! Every field has a default, so a configuration file only needs to list
//! the values it changes:
//!
//! ```yaml
//! resolver_workers: 8
//! gc_interval_ms: 10000
//! sync_writes: true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::kv::{KvError, KvResult};

/// Storage engine options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Number of latch slots; rounded up to a power of two
    pub latch_slots: usize,
    /// Number of resolver workers
    pub resolver_workers: usize,
    /// Capacity of each resolver worker queue
    pub resolver_queue_capacity: usize,
    /// Number of GC workers
    pub gc_workers: usize,
    /// Capacity of the GC task queue
    pub gc_queue_capacity: usize,
    /// Whether the background GC scheduler runs
    pub gc_enabled: bool,
    /// Interval between GC scheduling rounds
    pub gc_interval_ms: u64,
    /// How long old versions are retained when no transaction pins them
    pub gc_life_time_ms: u64,
    /// User keys per GC task
    pub gc_batch_keys: usize,
    /// Time to live of locks written during prewrite
    pub lock_ttl_ms: u64,
    /// Largest key plus value accepted by a transaction buffer
    pub entry_size_limit: u64,
    /// Largest total size of a transaction buffer
    pub txn_total_size_limit: u64,
    /// RocksDB memtable size
    pub write_buffer_size: usize,
    /// RocksDB memtable count
    pub max_write_buffer_number: i32,
    /// Fsync the WAL on every commit
    pub sync_writes: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            latch_slots: 8,
            resolver_workers: 4,
            resolver_queue_capacity: 512,
            gc_workers: 2,
            gc_queue_capacity: 32,
            gc_enabled: true,
            gc_interval_ms: 5_000,
            gc_life_time_ms: 10 * 60 * 1000,
            gc_batch_keys: 1024,
            lock_ttl_ms: 3_000,
            entry_size_limit: 6 * 1024 * 1024,
            txn_total_size_limit: 100 * 1024 * 1024,
            write_buffer_size: 64 * 1024 * 1024,
            max_write_buffer_number: 3,
            sync_writes: false,
        }
    }
}

impl StorageOptions {
    /// Parse options from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> KvResult<Self> {
        let options: StorageOptions =
            serde_yaml::from_str(yaml).map_err(|e| KvError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> KvResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> KvResult<()> {
        let positive = [
            ("latch_slots", self.latch_slots),
            ("resolver_workers", self.resolver_workers),
            ("resolver_queue_capacity", self.resolver_queue_capacity),
            ("gc_workers", self.gc_workers),
            ("gc_queue_capacity", self.gc_queue_capacity),
            ("gc_batch_keys", self.gc_batch_keys),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(KvError::Config(format!("{} must be positive", name)));
            }
        }
        if self.gc_interval_ms == 0 {
            return Err(KvError::Config("gc_interval_ms must be positive".to_string()));
        }
        if self.entry_size_limit == 0 || self.txn_total_size_limit == 0 {
            return Err(KvError::Config("size limits must be positive".to_string()));
        }
        Ok(())
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}
