//! In-memory transactional buffer
//!
//! `MemDb` holds a transaction's uncommitted writes. Keys live in an ordered
//! map of nodes; values live in an append-only [`arena`]. Deletes are stored
//! as empty values (tombstones) so they shadow the snapshot underneath.
//!
//! Nested staging lets callers undo a group of writes:
//!
//! ```text
//! let h = db.staging();
//! db.set(b"k", b"v")?;
//! db.cleanup(h)?;   // or db.release(h)? to keep the writes
//! ```
//!
//! A value slot is overwritten in place only when it was allocated in the
//! innermost live stage; otherwise a new slot is chained in front of the old
//! one so that cleanup can restore it.

mod arena;
mod iter;
mod snapshot;

pub use iter::MemDbIter;

use rustc_hash::FxHashSet;
use std::collections::btree_map::Range;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::kv::{FlagsOp, Key, KeyFlags, KvError, KvResult};
use arena::{ValueArena, ValueRef};

/// Handle returned by [`MemDb::staging`]
///
/// Every stage gets a fresh generation, so a handle of a finished stage
/// never matches a stage opened later at the same depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingHandle {
    depth: usize,
    generation: u64,
}

impl StagingHandle {
    /// Depth of the stage, starting at 1 for the outermost one.
    pub fn depth(self) -> usize {
        self.depth
    }
}

#[derive(Debug, Default)]
struct Node {
    value: Option<ValueRef>,
    flags: KeyFlags,
}

#[derive(Debug)]
enum Undo {
    Created(Key),
    Flags { key: Key, old: KeyFlags },
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    slots: usize,
    undo: usize,
    generation: u64,
}

/// Staged in-memory write buffer
#[derive(Debug)]
pub struct MemDb {
    nodes: BTreeMap<Key, Node>,
    arena: ValueArena,
    stages: Vec<Checkpoint>,
    next_generation: u64,
    undo: Vec<Undo>,
    size: usize,
    dirty: bool,
    entry_size_limit: u64,
    buffer_size_limit: u64,
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDb {
    /// Create an empty buffer without size limits
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            arena: ValueArena::default(),
            stages: Vec::new(),
            next_generation: 1,
            undo: Vec::new(),
            size: 0,
            dirty: false,
            entry_size_limit: u64::MAX,
            buffer_size_limit: u64::MAX,
        }
    }

    /// Create an empty buffer with the given limits
    pub fn with_limits(entry_size_limit: u64, buffer_size_limit: u64) -> Self {
        let mut db = Self::new();
        db.set_entry_size_limit(entry_size_limit, buffer_size_limit);
        db
    }

    /// Change the per-entry and total size limits. Zero keeps the current value.
    pub fn set_entry_size_limit(&mut self, entry_size_limit: u64, buffer_size_limit: u64) {
        if entry_size_limit != 0 {
            self.entry_size_limit = entry_size_limit;
        }
        if buffer_size_limit != 0 {
            self.buffer_size_limit = buffer_size_limit;
        }
    }

    /// Value of `key`. A deleted key yields an empty slice.
    pub fn get(&self, key: &[u8]) -> KvResult<&[u8]> {
        match self.nodes.get(key).and_then(|n| n.value) {
            Some(r) => Ok(self.arena.get(r)),
            None => Err(KvError::NotExist),
        }
    }

    /// Flags of `key`, present even when the key has no value.
    pub fn get_flags(&self, key: &[u8]) -> KvResult<KeyFlags> {
        self.nodes
            .get(key)
            .map(|n| n.flags)
            .ok_or(KvError::NotExist)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.set_with_flags(key, value, &[])
    }

    /// Set a value and apply flag operations in one step.
    pub fn set_with_flags(&mut self, key: &[u8], value: &[u8], ops: &[FlagsOp]) -> KvResult<()> {
        if value.is_empty() {
            return Err(KvError::EmptyValue);
        }
        self.write(key, value, ops)
    }

    /// Record a delete tombstone for `key`.
    pub fn delete(&mut self, key: &[u8]) -> KvResult<()> {
        self.write(key, &[], &[])
    }

    pub fn delete_with_flags(&mut self, key: &[u8], ops: &[FlagsOp]) -> KvResult<()> {
        self.write(key, &[], ops)
    }

    /// Apply flag operations, creating a value-less node when needed.
    pub fn update_flags(&mut self, key: &[u8], ops: &[FlagsOp]) {
        let staging = !self.stages.is_empty();
        if !self.nodes.contains_key(key) {
            self.nodes.insert(Key::from(key), Node::default());
            self.size += key.len();
            if staging {
                self.undo.push(Undo::Created(Key::from(key)));
            }
        }
        if let Some(node) = self.nodes.get_mut(key) {
            let old = node.flags;
            let flags = old.apply(ops);
            if flags != old {
                if staging {
                    self.undo.push(Undo::Flags {
                        key: Key::from(key),
                        old,
                    });
                }
                node.flags = flags;
            }
            if flags.has_persistent() {
                self.dirty = true;
            }
        }
    }

    fn write(&mut self, key: &[u8], value: &[u8], ops: &[FlagsOp]) -> KvResult<()> {
        let entry_size = (key.len() + value.len()) as u64;
        if entry_size > self.entry_size_limit {
            return Err(KvError::EntryTooLarge {
                limit: self.entry_size_limit,
                size: entry_size,
            });
        }

        let (exists, old_len) = match self.nodes.get(key) {
            Some(node) => (true, node.value.map_or(0, |r| self.arena.value_len(r))),
            None => (false, 0),
        };
        let key_cost = if exists { 0 } else { key.len() };
        let new_size = self.size - old_len + value.len() + key_cost;
        if new_size as u64 > self.buffer_size_limit {
            return Err(KvError::TxnTooLarge {
                size: new_size as u64,
            });
        }

        let staging = !self.stages.is_empty();
        if !staging {
            self.dirty = true;
        }
        if !exists {
            self.nodes.insert(Key::from(key), Node::default());
            if staging {
                self.undo.push(Undo::Created(Key::from(key)));
            }
        }

        let generation = self.stages.last().map_or(0, |cp| cp.slots);
        if let Some(node) = self.nodes.get_mut(key) {
            let old_flags = node.flags;
            let flags = if ops.is_empty() {
                old_flags.without_temporary()
            } else {
                old_flags.apply(ops)
            };
            if flags != old_flags {
                if staging {
                    self.undo.push(Undo::Flags {
                        key: Key::from(key),
                        old: old_flags,
                    });
                }
                node.flags = flags;
            }
            if flags.has_persistent() {
                self.dirty = true;
            }

            match node.value {
                Some(r) if r.index() >= generation && self.arena.value_len(r) == value.len() => {
                    self.arena.overwrite(r, value);
                }
                old => {
                    node.value = Some(self.arena.append(key, value, old));
                }
            }
        }
        self.size = new_size;
        Ok(())
    }

    /// Open a new nested stage.
    pub fn staging(&mut self) -> StagingHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.stages.push(Checkpoint {
            slots: self.arena.slot_count(),
            undo: self.undo.len(),
            generation,
        });
        StagingHandle {
            depth: self.stages.len(),
            generation,
        }
    }

    /// Checkpoint of `h` while its stage is still open.
    fn stage_of(&self, h: StagingHandle) -> Option<&Checkpoint> {
        h.depth
            .checked_sub(1)
            .and_then(|i| self.stages.get(i))
            .filter(|cp| cp.generation == h.generation)
    }

    fn out_of_order(&self, h: StagingHandle) -> KvError {
        KvError::StagingOutOfOrder {
            got: h.depth,
            innermost: self.stages.len(),
        }
    }

    /// Keep the writes of stage `h`, merging them into the parent stage.
    pub fn release(&mut self, h: StagingHandle) -> KvResult<()> {
        if self.stage_of(h).is_none() || h.depth != self.stages.len() {
            return Err(self.out_of_order(h));
        }
        let cp = self.stages.pop().ok_or_else(|| self.out_of_order(h))?;
        if self.stages.is_empty() {
            if self.arena.slot_count() > cp.slots {
                self.dirty = true;
            }
            self.undo.clear();
        }
        Ok(())
    }

    /// Discard every change made since stage `h` was opened.
    ///
    /// Persistent flags set during the stage are kept. Cleaning up a handle
    /// whose stage already ended is a no-op.
    pub fn cleanup(&mut self, h: StagingHandle) -> KvResult<()> {
        if self.stage_of(h).is_none() {
            return Ok(());
        }
        if h.depth != self.stages.len() {
            return Err(self.out_of_order(h));
        }
        let cp = match self.stages.pop() {
            Some(cp) => cp,
            None => return Ok(()),
        };

        for idx in (cp.slots..self.arena.slot_count()).rev() {
            let r = ValueRef::from_index(idx);
            let key = self.arena.key(r);
            if let Some(node) = self.nodes.get_mut(key.as_bytes()) {
                if node.value == Some(r) {
                    let old = self.arena.old(r);
                    self.size -= self.arena.value_len(r);
                    self.size += old.map_or(0, |o| self.arena.value_len(o));
                    node.value = old;
                }
            }
        }
        self.arena.truncate(cp.slots);

        let undone = self.undo.split_off(cp.undo);
        for record in undone.into_iter().rev() {
            match record {
                Undo::Flags { key, old } => {
                    if let Some(node) = self.nodes.get_mut(&key) {
                        node.flags = old | node.flags.persistent();
                    }
                }
                Undo::Created(key) => {
                    let removable = self
                        .nodes
                        .get(&key)
                        .map_or(false, |n| n.value.is_none() && !n.flags.has_persistent());
                    if removable {
                        self.nodes.remove(&key);
                        self.size -= key.len();
                    }
                }
            }
        }
        Ok(())
    }

    /// Visit every key written since stage `h` with its current value and flags.
    pub fn inspect_stage<F>(&self, h: StagingHandle, mut f: F)
    where
        F: FnMut(&Key, KeyFlags, &[u8]),
    {
        let cp = match self.stage_of(h) {
            Some(cp) => *cp,
            None => return,
        };
        let mut seen = FxHashSet::default();
        for idx in cp.slots..self.arena.slot_count() {
            let key = self.arena.key(ValueRef::from_index(idx));
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(key.as_bytes()) {
                if let Some(r) = node.value {
                    f(key, node.flags, self.arena.get(r));
                }
            }
        }
    }

    /// Ascending iterator over `[lower, upper)`; empty bounds are open.
    pub fn iter(&self, lower: &[u8], upper: &[u8]) -> MemDbIter<'_> {
        MemDbIter::new(self, lower, upper, false, false, None)
    }

    /// Descending iterator over `[lower, upper)`; empty bounds are open.
    pub fn iter_reverse(&self, lower: &[u8], upper: &[u8]) -> MemDbIter<'_> {
        MemDbIter::new(self, lower, upper, true, false, None)
    }

    /// Ascending iterator that also yields value-less flag nodes.
    pub fn iter_with_flags(&self, lower: &[u8], upper: &[u8]) -> MemDbIter<'_> {
        MemDbIter::new(self, lower, upper, false, true, None)
    }

    fn range(&self, lower: &[u8], upper: &[u8]) -> Range<'_, Key, Node> {
        if !lower.is_empty() && !upper.is_empty() && upper <= lower {
            return self
                .nodes
                .range::<[u8], _>((Bound::Included(lower), Bound::Excluded(lower)));
        }
        let start = if lower.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(lower)
        };
        let end = if upper.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(upper)
        };
        self.nodes.range::<[u8], _>((start, end))
    }

    /// Number of keys, including keys that only carry flags.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total size of keys and live values.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether any change reached the outermost scope or a persistent flag was set.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Number of open stages.
    pub fn stages(&self) -> usize {
        self.stages.len()
    }

    /// Drop all content, stages and the dirty mark.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.arena.reset();
        self.stages.clear();
        self.undo.clear();
        self.size = 0;
        self.dirty = false;
    }
}
