//! Record-aware cursor over the MVCC keyspace

use rocksdb::{DBRawIterator, ReadOptions, DB};

use super::{decode, encode_key_prefix, Lock, Value};
use crate::kv::{Key, KvResult, Version};

/// Cursor over encoded MVCC keys in RocksDB.
///
/// The `read_*` helpers only consume the entry under the cursor when it
/// belongs to the expected user key, so callers can chain them to walk one
/// key's lock and versions in order.
pub struct MvccCursor<'a> {
    iter: DBRawIterator<'a>,
}

impl<'a> MvccCursor<'a> {
    /// Cursor bounded to encoded keys in `[lower, upper)`.
    pub fn new(db: &'a DB, lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) -> Self {
        let mut opts = ReadOptions::default();
        if let Some(lower) = lower {
            opts.set_iterate_lower_bound(lower);
        }
        if let Some(upper) = upper {
            opts.set_iterate_upper_bound(upper);
        }
        Self {
            iter: db.raw_iterator_opt(opts),
        }
    }

    /// Cursor restricted to the lock and versions of one user key.
    pub fn for_key(db: &'a DB, key: &[u8]) -> Self {
        let lower = encode_key_prefix(key);
        let upper = encode_key_prefix(&Key::from(key).next());
        Self::new(db, Some(lower), Some(upper))
    }

    pub fn seek(&mut self, encoded: &[u8]) {
        self.iter.seek(encoded);
    }

    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Position at the first entry of `key` (its lock, if any).
    pub fn seek_key(&mut self, key: &[u8]) {
        self.iter.seek(encode_key_prefix(key));
    }

    /// Position at the last entry of the greatest user key below `key`.
    ///
    /// The unversioned prefix of `key` sorts before all of its versions, so
    /// nothing of `key` itself is visited.
    pub fn seek_before_key(&mut self, key: &[u8]) {
        self.iter.seek_for_prev(encode_key_prefix(key));
    }

    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Decoded user key and version under the cursor.
    pub fn current(&self) -> KvResult<Option<(Key, Version)>> {
        match self.iter.key() {
            Some(raw) => Ok(Some(decode(raw)?)),
            None => {
                self.iter.status()?;
                Ok(None)
            }
        }
    }

    /// Raw encoded key under the cursor.
    pub fn raw_key(&self) -> Option<&[u8]> {
        self.iter.key()
    }

    /// Raw record bytes under the cursor.
    pub fn raw_value(&self) -> Option<&[u8]> {
        self.iter.value()
    }

    pub fn next(&mut self) {
        self.iter.next();
    }

    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// Surface any error that invalidated the cursor.
    pub fn status(&self) -> KvResult<()> {
        Ok(self.iter.status()?)
    }

    /// Consume the lock of `key` if the cursor is on it.
    pub fn read_lock(&mut self, key: &[u8]) -> KvResult<Option<Lock>> {
        let lock = match self.current()? {
            Some((k, ver)) if k.as_bytes() == key && ver == Version::LOCK => {
                let raw = self.iter.value().unwrap_or_default();
                Lock::unmarshal(raw)?
            }
            _ => return Ok(None),
        };
        self.iter.next();
        Ok(Some(lock))
    }

    /// Consume the next committed version of `key` if the cursor is on one.
    pub fn read_value(&mut self, key: &[u8]) -> KvResult<Option<(Version, Value)>> {
        let entry = match self.current()? {
            Some((k, ver)) if k.as_bytes() == key && ver != Version::LOCK => {
                let raw = self.iter.value().unwrap_or_default();
                (ver, Value::unmarshal(raw)?)
            }
            _ => return Ok(None),
        };
        self.iter.next();
        Ok(Some(entry))
    }

    /// Move past every remaining entry of `key`.
    pub fn skip_key(&mut self, key: &[u8]) {
        self.iter.seek(encode_key_prefix(&Key::from(key).next()));
    }

    /// Find the commit or rollback record written by `start_ver` for `key`.
    ///
    /// Such a record is stored at a version no smaller than `start_ver`, so
    /// the scan stops at the first older version.
    pub fn find_commit_record(&mut self, key: &[u8], start_ver: Version) -> KvResult<Option<Value>> {
        self.seek_key(key);
        self.read_lock(key)?;
        while let Some((ver, value)) = self.read_value(key)? {
            if ver < start_ver {
                break;
            }
            if value.start_ver == start_ver {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}
