use std::cmp::Ordering;

use super::snapshot::{Snapshot, SnapshotIter};
use crate::kv::{KvError, KvIterator, KvResult};
use crate::memdb::{MemDb, MemDbIter};

/// A transaction's write buffer layered over its start snapshot
///
/// Reads check the buffer first; a buffered delete hides the snapshot value.
#[derive(Debug)]
pub struct UnionStore {
    buffer: MemDb,
    snapshot: Snapshot,
}

impl UnionStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            buffer: MemDb::new(),
            snapshot,
        }
    }

    pub(crate) fn with_buffer(buffer: MemDb, snapshot: Snapshot) -> Self {
        Self { buffer, snapshot }
    }

    pub fn buffer(&self) -> &MemDb {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut MemDb {
        &mut self.buffer
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn get(&self, key: &[u8]) -> KvResult<Vec<u8>> {
        match self.buffer.get(key) {
            Ok([]) => Err(KvError::NotExist),
            Ok(value) => Ok(value.to_vec()),
            Err(KvError::NotExist) => self.snapshot.get(key),
            Err(err) => Err(err),
        }
    }

    pub fn iter(&self, lower: &[u8], upper: &[u8]) -> KvResult<UnionIter<'_>> {
        let dirty = self.buffer.iter(lower, upper);
        let snapshot = self.snapshot.iter(lower, upper)?;
        UnionIter::new(dirty, snapshot, false)
    }

    pub fn iter_reverse(&self, lower: &[u8], upper: &[u8]) -> KvResult<UnionIter<'_>> {
        let dirty = self.buffer.iter_reverse(lower, upper);
        let snapshot = self.snapshot.iter_reverse(lower, upper)?;
        UnionIter::new(dirty, snapshot, true)
    }
}

/// Merge of a buffer iterator and a snapshot iterator
///
/// On equal keys the buffer entry wins and the snapshot entry is skipped.
/// Buffer tombstones hide the snapshot entry and are not yielded.
pub struct UnionIter<'a> {
    dirty: MemDbIter<'a>,
    snapshot: SnapshotIter<'a>,
    reverse: bool,
    cur_is_dirty: bool,
    valid: bool,
}

impl<'a> UnionIter<'a> {
    fn new(dirty: MemDbIter<'a>, snapshot: SnapshotIter<'a>, reverse: bool) -> KvResult<Self> {
        let mut iter = Self {
            dirty,
            snapshot,
            reverse,
            cur_is_dirty: false,
            valid: true,
        };
        iter.update_cur()?;
        Ok(iter)
    }

    fn update_cur(&mut self) -> KvResult<()> {
        self.valid = true;
        loop {
            let dirty_valid = self.dirty.valid();
            let snapshot_valid = self.snapshot.valid();
            if !dirty_valid && !snapshot_valid {
                self.valid = false;
                return Ok(());
            }
            if !dirty_valid {
                self.cur_is_dirty = false;
                return Ok(());
            }
            if !snapshot_valid {
                if self.dirty.value().is_empty() {
                    self.dirty.next()?;
                    continue;
                }
                self.cur_is_dirty = true;
                return Ok(());
            }

            let mut cmp = self.dirty.key().cmp(self.snapshot.key());
            if self.reverse {
                cmp = cmp.reverse();
            }
            match cmp {
                Ordering::Equal => {
                    if self.dirty.value().is_empty() {
                        self.dirty.next()?;
                        self.snapshot.next()?;
                        continue;
                    }
                    self.snapshot.next()?;
                    self.cur_is_dirty = true;
                    return Ok(());
                }
                Ordering::Less => {
                    if self.dirty.value().is_empty() {
                        self.dirty.next()?;
                        continue;
                    }
                    self.cur_is_dirty = true;
                    return Ok(());
                }
                Ordering::Greater => {
                    self.cur_is_dirty = false;
                    return Ok(());
                }
            }
        }
    }
}

impl<'a> KvIterator for UnionIter<'a> {
    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &[u8] {
        if self.cur_is_dirty {
            self.dirty.key()
        } else {
            self.snapshot.key()
        }
    }

    fn value(&self) -> &[u8] {
        if self.cur_is_dirty {
            self.dirty.value()
        } else {
            self.snapshot.value()
        }
    }

    fn next(&mut self) -> KvResult<()> {
        if self.cur_is_dirty {
            self.dirty.next()?;
        } else {
            self.snapshot.next()?;
        }
        self.update_cur()
    }
}
