//! MVCC key encoding and records
//!
//! Every user key is stored as `encode_bytes(key) ++ !version` (big-endian).
//! For one user key a forward scan therefore visits the lock record first
//! (version `u64::MAX` encodes to all zeros) followed by committed versions
//! from newest to oldest.

pub mod cursor;
pub mod record;

pub use cursor::MvccCursor;
pub use record::{Lock, Op, Value, ValueType};

use crate::codec::{self, CodecError};
use crate::kv::{Key, KvResult, Version};

/// Encode `key` at `ver`.
pub fn encode(key: &[u8], ver: Version) -> Vec<u8> {
    let mut buf = Vec::with_capacity(codec::encoded_bytes_len(key.len()) + 8);
    codec::encode_bytes(&mut buf, key);
    codec::encode_uint_desc(&mut buf, ver.0);
    buf
}

/// Encode `key` without a version suffix.
///
/// The result sorts before every versioned form of `key` and after every
/// versioned form of smaller keys, which makes it a scan boundary.
pub fn encode_key_prefix(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(codec::encoded_bytes_len(key.len()));
    codec::encode_bytes(&mut buf, key);
    buf
}

/// Key of the lock record of `key`.
pub fn lock_key(key: &[u8]) -> Vec<u8> {
    encode(key, Version::LOCK)
}

/// Split an encoded key into user key and version.
///
/// A meta key without a version suffix decodes with [`Version::MIN`].
pub fn decode(encoded: &[u8]) -> KvResult<(Key, Version)> {
    let (key, rest) = codec::decode_bytes(encoded)?;
    if rest.is_empty() {
        return Ok((Key::new(key), Version::MIN));
    }
    let (ver, rest) = codec::decode_uint_desc(rest)?;
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len()).into());
    }
    Ok((Key::new(key), Version(ver)))
}
