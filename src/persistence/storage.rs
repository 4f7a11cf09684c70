//! RocksDB-backed durable store
//!
//! MVCC records live in the `default` column family. Engine metadata, such
//! as the highest commit version ever written, lives in `meta`.

use parking_lot::{Mutex, MutexGuard};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, WriteOptions, DB};
use rustc_hash::FxBuildHasher;
use std::hash::BuildHasher;
use std::path::Path;
use tracing::{debug, info};

use crate::config::StorageOptions;
use crate::kv::{KvError, KvResult, Version};

/// Column family holding MVCC keys
pub const DATA_CF: &str = "default";
/// Column family holding engine metadata
pub const META_CF: &str = "meta";

const MAX_VERSION_KEY: &[u8] = b"max_version";
const FENCE_SHARDS: usize = 64;

/// Durable store shared by all engine components
pub struct DurableStore {
    db: DB,
    sync_writes: bool,
    path: String,
    fences: Vec<Mutex<()>>,
}

impl DurableStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>, options: &StorageOptions) -> KvResult<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();

        info!("Opening durable store at: {}", path_str);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_write_buffer_size(options.write_buffer_size);
        opts.set_max_write_buffer_number(options.max_write_buffer_number);
        opts.set_min_write_buffer_number_to_merge(1);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::PointInTime);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(DATA_CF, Self::data_cf_options()),
            ColumnFamilyDescriptor::new(META_CF, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, &path_str, cf_descriptors)?;

        info!("Durable store opened successfully");

        Ok(Self {
            db,
            sync_writes: options.sync_writes,
            path: path_str,
            fences: (0..FENCE_SHARDS).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Column family options for MVCC data
    fn data_cf_options() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    /// Underlying RocksDB handle
    pub fn db(&self) -> &DB {
        &self.db
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Commit a batch atomically
    pub fn write(&self, batch: WriteBatch) -> KvResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    /// Serialize read-then-write sequences on the state of `key`.
    ///
    /// Committing a primary key and rolling it back both check the lock
    /// before writing; holding the fence makes the check and the write
    /// atomic with respect to each other.
    pub fn fence(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let shard = (FxBuildHasher.hash_one(key) % FENCE_SHARDS as u64) as usize;
        self.fences[shard].lock()
    }

    /// Highest version recorded by [`DurableStore::record_high_water`]
    pub fn high_water(&self) -> KvResult<Version> {
        let cf = self
            .db
            .cf_handle(META_CF)
            .ok_or_else(|| KvError::ColumnFamily(META_CF.to_string()))?;
        match self.db.get_cf(cf, MAX_VERSION_KEY)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    KvError::Config(format!("corrupt {} entry", String::from_utf8_lossy(MAX_VERSION_KEY)))
                })?;
                Ok(Version(u64::from_be_bytes(bytes)))
            }
            None => Ok(Version::MIN),
        }
    }

    /// Add a high-water update to `batch`
    pub fn record_high_water(&self, batch: &mut WriteBatch, ver: Version) -> KvResult<()> {
        let cf = self
            .db
            .cf_handle(META_CF)
            .ok_or_else(|| KvError::ColumnFamily(META_CF.to_string()))?;
        batch.put_cf(cf, MAX_VERSION_KEY, ver.0.to_be_bytes());
        Ok(())
    }

    /// Persist `ver` as the high-water mark when it is larger than the stored one
    pub fn advance_high_water(&self, ver: Version) -> KvResult<()> {
        if self.high_water()? >= ver {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        self.record_high_water(&mut batch, ver)?;
        self.write(batch)?;
        debug!(version = %ver, "advanced version high-water mark");
        Ok(())
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> KvResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
