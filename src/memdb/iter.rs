use std::collections::btree_map::Range;

use super::arena::ValueArena;
use super::{MemDb, Node};
use crate::kv::{Key, KeyFlags, KvIterator, KvResult};

/// Iterator over a [`MemDb`] range.
///
/// Tombstones are yielded with an empty value so a union iterator can let
/// them shadow the snapshot.
pub struct MemDbIter<'a> {
    arena: &'a ValueArena,
    range: Range<'a, Key, Node>,
    reverse: bool,
    include_flags: bool,
    watermark: Option<usize>,
    current: Option<(&'a Key, &'a [u8], KeyFlags)>,
}

impl<'a> MemDbIter<'a> {
    pub(super) fn new(
        db: &'a MemDb,
        lower: &[u8],
        upper: &[u8],
        reverse: bool,
        include_flags: bool,
        watermark: Option<usize>,
    ) -> Self {
        let mut iter = Self {
            arena: &db.arena,
            range: db.range(lower, upper),
            reverse,
            include_flags,
            watermark,
            current: None,
        };
        iter.advance();
        iter
    }

    fn advance(&mut self) {
        let arena = self.arena;
        self.current = None;
        loop {
            let item = if self.reverse {
                self.range.next_back()
            } else {
                self.range.next()
            };
            let (key, node) = match item {
                Some(item) => item,
                None => return,
            };
            let value = match self.watermark {
                Some(mark) => arena.visible_at(node.value, mark),
                None => node.value,
            };
            match value {
                Some(r) => {
                    self.current = Some((key, arena.get(r), node.flags));
                    return;
                }
                None if self.include_flags && self.watermark.is_none() => {
                    self.current = Some((key, &[], node.flags));
                    return;
                }
                None => continue,
            }
        }
    }

    /// Flags of the current key.
    pub fn flags(&self) -> KeyFlags {
        self.current.map(|(_, _, f)| f).unwrap_or_default()
    }
}

impl<'a> KvIterator for MemDbIter<'a> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.map(|(k, _, _)| k.as_bytes()).unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        self.current.map(|(_, v, _)| v).unwrap_or_default()
    }

    fn next(&mut self) -> KvResult<()> {
        self.advance();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::kv::{FlagsOp, KvIterator};
    use crate::memdb::MemDb;

    fn keys(mut it: impl KvIterator) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while it.valid() {
            out.push(it.key().to_vec());
            it.next().unwrap();
        }
        out
    }

    fn sample() -> MemDb {
        let mut db = MemDb::new();
        for k in [b"a", b"b", b"c", b"d"] {
            db.set(k, k).unwrap();
        }
        db.delete(b"bb").unwrap();
        db.update_flags(b"cc", &[FlagsOp::SetKeyLocked]);
        db
    }

    #[test]
    fn test_forward_bounds() {
        let db = sample();
        assert_eq!(
            keys(db.iter(b"", b"")),
            vec![b"a".to_vec(), b"b".to_vec(), b"bb".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        assert_eq!(keys(db.iter(b"b", b"c")), vec![b"b".to_vec(), b"bb".to_vec()]);
        assert!(keys(db.iter(b"d", b"b")).is_empty());
    }

    #[test]
    fn test_reverse_bounds() {
        let db = sample();
        assert_eq!(
            keys(db.iter_reverse(b"b", b"d")),
            vec![b"c".to_vec(), b"bb".to_vec(), b"b".to_vec()]
        );
        assert_eq!(keys(db.iter_reverse(b"", b"b")), vec![b"a".to_vec()]);
    }

    #[test]
    fn test_tombstone_and_flag_nodes() {
        let db = sample();
        let mut it = db.iter(b"bb", b"c");
        assert_eq!(it.key(), b"bb");
        assert!(it.value().is_empty());
        it.next().unwrap();
        assert!(!it.valid());

        let with_flags = keys(db.iter_with_flags(b"c", b"d"));
        assert_eq!(with_flags, vec![b"c".to_vec(), b"cc".to_vec()]);
    }
}
