//! Memcomparable byte codec
//!
//! Encodings in this module preserve ordering: comparing two encoded byte
//! strings lexicographically gives the same result as comparing the original
//! values. The MVCC key layout and the graph key layout are both built on it.
//!
//! `encode_bytes` splits the input into 8-byte groups. Each group is padded
//! with zeros and followed by a marker byte `0xFF - pad_count`, so an encoded
//! byte string is never a prefix of another encoded byte string.

pub mod graph;

pub use graph::{
    edge_non_unique_index_key, incoming_edge_key, label_key, outgoing_edge_key,
    parse_edge_key, parse_edge_non_unique_index_key, parse_unique_index_key, parse_vertex_key,
    parse_vertex_non_unique_index_key, unique_index_key, vertex_key,
    vertex_non_unique_index_key, EdgeDirection, EdgeIndexKey, EdgeKey, IndexKind, IndexTarget,
    UniqueIndexKey, VertexIndexKey, VertexKey,
};

use thiserror::Error;

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xFF;
const ENC_PAD: u8 = 0x00;
const SIGN_MASK: u64 = 0x8000_0000_0000_0000;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before a complete value could be read
    #[error("insufficient bytes to decode value: need {need}, have {have}")]
    Insufficient { need: usize, have: usize },

    /// Group marker outside the valid range
    #[error("invalid marker byte: {0:#04x}")]
    InvalidMarker(u8),

    /// Non-zero padding inside the last group
    #[error("invalid padding byte: {0:#04x}")]
    InvalidPadding(u8),

    /// Bytes left over after the value
    #[error("unexpected trailing bytes: {0}")]
    TrailingBytes(usize),

    /// Prefix or separator did not match the expected layout
    #[error("invalid key layout: {0}")]
    InvalidLayout(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Append the memcomparable form of `data` to `buf`.
pub fn encode_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    let groups = data.len() / ENC_GROUP_SIZE + 1;
    buf.reserve(groups * (ENC_GROUP_SIZE + 1));

    let mut chunks = data.chunks_exact(ENC_GROUP_SIZE);
    for chunk in chunks.by_ref() {
        buf.extend_from_slice(chunk);
        buf.push(ENC_MARKER);
    }

    let rest = chunks.remainder();
    let pad = ENC_GROUP_SIZE - rest.len();
    buf.extend_from_slice(rest);
    buf.extend(std::iter::repeat(ENC_PAD).take(pad));
    buf.push(ENC_MARKER - pad as u8);
}

/// Number of bytes `encode_bytes` produces for an input of `len` bytes.
pub fn encoded_bytes_len(len: usize) -> usize {
    (len / ENC_GROUP_SIZE + 1) * (ENC_GROUP_SIZE + 1)
}

/// Decode a memcomparable byte string from the front of `data`.
///
/// Returns the decoded bytes and the unread remainder.
pub fn decode_bytes(data: &[u8]) -> CodecResult<(Vec<u8>, &[u8])> {
    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;
    loop {
        if rest.len() < ENC_GROUP_SIZE + 1 {
            return Err(CodecError::Insufficient {
                need: ENC_GROUP_SIZE + 1,
                have: rest.len(),
            });
        }
        let (group, tail) = rest.split_at(ENC_GROUP_SIZE + 1);
        rest = tail;

        let marker = group[ENC_GROUP_SIZE];
        let pad = (ENC_MARKER - marker) as usize;
        if pad > ENC_GROUP_SIZE {
            return Err(CodecError::InvalidMarker(marker));
        }

        let real = ENC_GROUP_SIZE - pad;
        out.extend_from_slice(&group[..real]);

        if pad != 0 {
            if let Some(&b) = group[real..ENC_GROUP_SIZE].iter().find(|&&b| b != ENC_PAD) {
                return Err(CodecError::InvalidPadding(b));
            }
            return Ok((out, rest));
        }
    }
}

/// Append `v` so that larger values sort first.
pub fn encode_uint_desc(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&(!v).to_be_bytes());
}

/// Decode a value written by [`encode_uint_desc`].
pub fn decode_uint_desc(data: &[u8]) -> CodecResult<(u64, &[u8])> {
    let (v, rest) = decode_uint(data)?;
    Ok((!v, rest))
}

/// Append `v` in big-endian order.
pub fn encode_uint(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Decode a value written by [`encode_uint`].
pub fn decode_uint(data: &[u8]) -> CodecResult<(u64, &[u8])> {
    if data.len() < 8 {
        return Err(CodecError::Insufficient {
            need: 8,
            have: data.len(),
        });
    }
    let (head, rest) = data.split_at(8);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(head);
    Ok((u64::from_be_bytes(raw), rest))
}

/// Append a signed integer so that negative values sort before positive ones.
pub fn encode_int(buf: &mut Vec<u8>, v: i64) {
    encode_uint(buf, (v as u64) ^ SIGN_MASK);
}

/// Decode a value written by [`encode_int`].
pub fn decode_int(data: &[u8]) -> CodecResult<(i64, &[u8])> {
    let (u, rest) = decode_uint(data)?;
    Ok(((u ^ SIGN_MASK) as i64, rest))
}
