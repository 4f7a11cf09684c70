//! Graph key layout
//!
//! Every graph key starts with the `g` prefix followed by the memcomparable
//! graph id, so all data of one graph is contiguous in the keyspace.
//!
//! ```text
//! vertex:            g {graph} {vertex}
//! outgoing edge:     g {graph} {src} 'o' {dst}
//! incoming edge:     g {graph} {dst} 'i' {src}
//! unique index:      g {graph} 'x' {index} {kind}
//! vertex index:      g {graph} 'x' {index} 'v' {vertex}
//! edge index:        g {graph} 'x' {index} 'e' {src} {dst}
//! ```
//!
//! A vertex key is a prefix of all its outgoing and incoming edge keys, so a
//! prefix scan over a vertex returns its adjacency. Labels are stored as
//! non-unique indexes whose index id is the label id. Vertex ids are expected
//! to be non-negative; the index separator `'x'` sorts below the encoded form
//! of any non-negative id.

use super::{decode_int, encode_int, CodecError, CodecResult};

const PREFIX: u8 = b'g';
const INCOMING_EDGE_SEP: u8 = b'i';
const OUTGOING_EDGE_SEP: u8 = b'o';
const INDEX_SEP: u8 = b'x';
const VERTEX_KIND: u8 = b'v';
const EDGE_KIND: u8 = b'e';

/// Length of an encoded vertex key
pub const VERTEX_KEY_LEN: usize = 1 + 8 + 8;
/// Length of an encoded edge key
pub const EDGE_KEY_LEN: usize = VERTEX_KEY_LEN + 1 + 8;

const INDEX_PREFIX_LEN: usize = 1 + 8 + 1 + 8;

/// Decoded vertex key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexKey {
    pub graph_id: i64,
    pub vertex_id: i64,
}

/// Edge direction as seen from the vertex owning the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Incoming,
    Outgoing,
}

impl EdgeDirection {
    fn separator(self) -> u8 {
        match self {
            EdgeDirection::Incoming => INCOMING_EDGE_SEP,
            EdgeDirection::Outgoing => OUTGOING_EDGE_SEP,
        }
    }
}

/// Decoded edge key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeKey {
    pub graph_id: i64,
    pub src_vertex_id: i64,
    pub dst_vertex_id: i64,
    pub direction: EdgeDirection,
}

/// What an index entry points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Vertex,
    Edge,
}

impl IndexKind {
    fn as_byte(self) -> u8 {
        match self {
            IndexKind::Vertex => VERTEX_KIND,
            IndexKind::Edge => EDGE_KIND,
        }
    }

    fn from_byte(b: u8) -> CodecResult<Self> {
        match b {
            VERTEX_KIND => Ok(IndexKind::Vertex),
            EDGE_KIND => Ok(IndexKind::Edge),
            other => Err(CodecError::InvalidLayout(format!(
                "unknown index kind {:#04x}",
                other
            ))),
        }
    }
}

/// Entity a label or non-unique index entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTarget {
    Vertex(i64),
    Edge { src: i64, dst: i64 },
}

/// Decoded unique index key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueIndexKey {
    pub graph_id: i64,
    pub index_id: i64,
    pub kind: IndexKind,
}

/// Decoded vertex non-unique index key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexIndexKey {
    pub graph_id: i64,
    pub index_id: i64,
    pub vertex_id: i64,
}

/// Decoded edge non-unique index key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeIndexKey {
    pub graph_id: i64,
    pub index_id: i64,
    pub src_vertex_id: i64,
    pub dst_vertex_id: i64,
}

fn graph_prefix(capacity: usize, graph_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(capacity);
    key.push(PREFIX);
    encode_int(&mut key, graph_id);
    key
}

fn check_prefix(key: &[u8], min_len: usize) -> CodecResult<()> {
    if key.len() < min_len {
        return Err(CodecError::Insufficient {
            need: min_len,
            have: key.len(),
        });
    }
    if key[0] != PREFIX {
        return Err(CodecError::InvalidLayout(format!(
            "unexpected key prefix {:#04x}",
            key[0]
        )));
    }
    Ok(())
}

fn expect_byte(actual: u8, expected: u8) -> CodecResult<()> {
    if actual != expected {
        return Err(CodecError::InvalidLayout(format!(
            "expected separator {:?}, found {:#04x}",
            expected as char, actual
        )));
    }
    Ok(())
}

fn expect_end(rest: &[u8]) -> CodecResult<()> {
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len()));
    }
    Ok(())
}

/// Encode the key of a vertex.
pub fn vertex_key(graph_id: i64, vertex_id: i64) -> Vec<u8> {
    let mut key = graph_prefix(VERTEX_KEY_LEN, graph_id);
    encode_int(&mut key, vertex_id);
    key
}

/// Parse a key produced by [`vertex_key`].
pub fn parse_vertex_key(key: &[u8]) -> CodecResult<VertexKey> {
    check_prefix(key, VERTEX_KEY_LEN)?;
    let (graph_id, rest) = decode_int(&key[1..])?;
    let (vertex_id, rest) = decode_int(rest)?;
    expect_end(rest)?;
    Ok(VertexKey {
        graph_id,
        vertex_id,
    })
}

fn edge_key(graph_id: i64, owner: i64, sep: u8, other: i64) -> Vec<u8> {
    let mut key = graph_prefix(EDGE_KEY_LEN, graph_id);
    encode_int(&mut key, owner);
    key.push(sep);
    encode_int(&mut key, other);
    key
}

/// Encode the incoming edge key, stored under the destination vertex.
pub fn incoming_edge_key(graph_id: i64, src_vertex_id: i64, dst_vertex_id: i64) -> Vec<u8> {
    edge_key(
        graph_id,
        dst_vertex_id,
        EdgeDirection::Incoming.separator(),
        src_vertex_id,
    )
}

/// Encode the outgoing edge key, stored under the source vertex.
pub fn outgoing_edge_key(graph_id: i64, src_vertex_id: i64, dst_vertex_id: i64) -> Vec<u8> {
    edge_key(
        graph_id,
        src_vertex_id,
        EdgeDirection::Outgoing.separator(),
        dst_vertex_id,
    )
}

/// Parse an incoming or outgoing edge key.
pub fn parse_edge_key(key: &[u8]) -> CodecResult<EdgeKey> {
    check_prefix(key, EDGE_KEY_LEN)?;
    let (graph_id, rest) = decode_int(&key[1..])?;
    let (owner, rest) = decode_int(rest)?;
    let direction = match rest[0] {
        INCOMING_EDGE_SEP => EdgeDirection::Incoming,
        OUTGOING_EDGE_SEP => EdgeDirection::Outgoing,
        other => {
            return Err(CodecError::InvalidLayout(format!(
                "unknown edge separator {:#04x}",
                other
            )))
        }
    };
    let (other, rest) = decode_int(&rest[1..])?;
    expect_end(rest)?;

    let (src_vertex_id, dst_vertex_id) = match direction {
        EdgeDirection::Incoming => (other, owner),
        EdgeDirection::Outgoing => (owner, other),
    };
    Ok(EdgeKey {
        graph_id,
        src_vertex_id,
        dst_vertex_id,
        direction,
    })
}

fn index_prefix(capacity: usize, graph_id: i64, index_id: i64, kind: IndexKind) -> Vec<u8> {
    let mut key = graph_prefix(capacity, graph_id);
    key.push(INDEX_SEP);
    encode_int(&mut key, index_id);
    key.push(kind.as_byte());
    key
}

fn parse_index_prefix(key: &[u8]) -> CodecResult<(i64, i64, IndexKind, &[u8])> {
    check_prefix(key, INDEX_PREFIX_LEN + 1)?;
    let (graph_id, rest) = decode_int(&key[1..])?;
    expect_byte(rest[0], INDEX_SEP)?;
    let (index_id, rest) = decode_int(&rest[1..])?;
    let kind = IndexKind::from_byte(rest[0])?;
    Ok((graph_id, index_id, kind, &rest[1..]))
}

/// Encode a unique index key. The indexed property values live in the value.
pub fn unique_index_key(graph_id: i64, index_id: i64, kind: IndexKind) -> Vec<u8> {
    index_prefix(INDEX_PREFIX_LEN + 1, graph_id, index_id, kind)
}

/// Parse a key produced by [`unique_index_key`].
pub fn parse_unique_index_key(key: &[u8]) -> CodecResult<UniqueIndexKey> {
    let (graph_id, index_id, kind, rest) = parse_index_prefix(key)?;
    expect_end(rest)?;
    Ok(UniqueIndexKey {
        graph_id,
        index_id,
        kind,
    })
}

/// Encode a non-unique index key pointing at a vertex.
pub fn vertex_non_unique_index_key(graph_id: i64, index_id: i64, vertex_id: i64) -> Vec<u8> {
    let mut key = index_prefix(INDEX_PREFIX_LEN + 1 + 8, graph_id, index_id, IndexKind::Vertex);
    encode_int(&mut key, vertex_id);
    key
}

/// Parse a key produced by [`vertex_non_unique_index_key`].
pub fn parse_vertex_non_unique_index_key(key: &[u8]) -> CodecResult<VertexIndexKey> {
    let (graph_id, index_id, kind, rest) = parse_index_prefix(key)?;
    expect_byte(kind.as_byte(), VERTEX_KIND)?;
    let (vertex_id, rest) = decode_int(rest)?;
    expect_end(rest)?;
    Ok(VertexIndexKey {
        graph_id,
        index_id,
        vertex_id,
    })
}

/// Encode a non-unique index key pointing at an edge.
pub fn edge_non_unique_index_key(
    graph_id: i64,
    index_id: i64,
    src_vertex_id: i64,
    dst_vertex_id: i64,
) -> Vec<u8> {
    let mut key = index_prefix(INDEX_PREFIX_LEN + 1 + 16, graph_id, index_id, IndexKind::Edge);
    encode_int(&mut key, src_vertex_id);
    encode_int(&mut key, dst_vertex_id);
    key
}

/// Parse a key produced by [`edge_non_unique_index_key`].
pub fn parse_edge_non_unique_index_key(key: &[u8]) -> CodecResult<EdgeIndexKey> {
    let (graph_id, index_id, kind, rest) = parse_index_prefix(key)?;
    expect_byte(kind.as_byte(), EDGE_KIND)?;
    let (src_vertex_id, rest) = decode_int(rest)?;
    let (dst_vertex_id, rest) = decode_int(rest)?;
    expect_end(rest)?;
    Ok(EdgeIndexKey {
        graph_id,
        index_id,
        src_vertex_id,
        dst_vertex_id,
    })
}

/// Encode the label membership key of a vertex or an edge.
pub fn label_key(graph_id: i64, label_id: i64, target: IndexTarget) -> Vec<u8> {
    match target {
        IndexTarget::Vertex(vertex_id) => vertex_non_unique_index_key(graph_id, label_id, vertex_id),
        IndexTarget::Edge { src, dst } => edge_non_unique_index_key(graph_id, label_id, src, dst),
    }
}
