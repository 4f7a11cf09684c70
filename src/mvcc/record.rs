//! Lock and value records
//!
//! Records are stored with bincode using fixed-width little-endian integers.
//! Unmarshal rejects trailing bytes so a truncated or padded record never
//! decodes silently.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::kv::{Key, KvResult, Version};

fn record_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Mutation kind carried by a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put,
    Del,
    Lock,
    Rollback,
    /// Put that requires the key to be absent. Prewrite checks the
    /// constraint and records the intent as [`Op::Put`].
    Insert,
    /// Prewrite-only existence check
    CheckNotExists,
}

/// Kind of a committed version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Put,
    Delete,
    Lock,
    Rollback,
}

impl From<Op> for ValueType {
    fn from(op: Op) -> Self {
        match op {
            Op::Put => ValueType::Put,
            Op::Lock => ValueType::Lock,
            _ => ValueType::Delete,
        }
    }
}

/// Write intent of an uncommitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub start_ver: Version,
    pub primary: Key,
    pub value: Vec<u8>,
    pub op: Op,
    /// Time to live in milliseconds, counted from `start_ver`
    pub ttl: u64,
}

impl Lock {
    pub fn marshal(&self) -> KvResult<Vec<u8>> {
        Ok(record_codec().serialize(self)?)
    }

    pub fn unmarshal(data: &[u8]) -> KvResult<Self> {
        Ok(record_codec().deserialize(data)?)
    }

    /// Version after which the lock is considered abandoned
    pub fn expires_at(&self) -> Version {
        self.start_ver.add_millis(self.ttl)
    }
}

/// Committed or rolled back version of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub value_type: ValueType,
    pub start_ver: Version,
    pub commit_ver: Version,
    pub value: Vec<u8>,
}

impl Value {
    /// Rollback tombstone for `start_ver`
    pub fn rollback(start_ver: Version) -> Self {
        Value {
            value_type: ValueType::Rollback,
            start_ver,
            commit_ver: start_ver,
            value: Vec::new(),
        }
    }

    pub fn marshal(&self) -> KvResult<Vec<u8>> {
        Ok(record_codec().serialize(self)?)
    }

    pub fn unmarshal(data: &[u8]) -> KvResult<Self> {
        Ok(record_codec().deserialize(data)?)
    }

    /// Whether the record is an actual write of the owning transaction
    pub fn is_commit(&self) -> bool {
        self.value_type != ValueType::Rollback
    }
}
