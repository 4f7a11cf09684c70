//! Append-only value arena backing the transactional buffer
//!
//! Values are copied into one growing byte buffer and addressed through slot
//! indexes. Each slot remembers the key it belongs to and the slot it
//! replaced, which lets staging cleanups walk back to older values and lets
//! snapshot readers see the value that was current at a checkpoint.

use crate::kv::Key;

/// Address of a value in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ValueRef(usize);

impl ValueRef {
    pub(crate) fn from_index(index: usize) -> Self {
        ValueRef(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Slot {
    key: Key,
    offset: usize,
    len: usize,
    old: Option<ValueRef>,
}

#[derive(Debug, Default)]
pub(crate) struct ValueArena {
    data: Vec<u8>,
    slots: Vec<Slot>,
}

impl ValueArena {
    /// Copy `value` into a fresh slot that replaces `old` for `key`.
    pub(crate) fn append(&mut self, key: &[u8], value: &[u8], old: Option<ValueRef>) -> ValueRef {
        let offset = self.data.len();
        self.data.extend_from_slice(value);
        self.slots.push(Slot {
            key: Key::from(key),
            offset,
            len: value.len(),
            old,
        });
        ValueRef(self.slots.len() - 1)
    }

    /// Overwrite a slot with a value of the same length.
    pub(crate) fn overwrite(&mut self, r: ValueRef, value: &[u8]) {
        let slot = &self.slots[r.0];
        debug_assert_eq!(slot.len, value.len());
        self.data[slot.offset..slot.offset + slot.len].copy_from_slice(value);
    }

    pub(crate) fn get(&self, r: ValueRef) -> &[u8] {
        let slot = &self.slots[r.0];
        &self.data[slot.offset..slot.offset + slot.len]
    }

    pub(crate) fn value_len(&self, r: ValueRef) -> usize {
        self.slots[r.0].len
    }

    pub(crate) fn key(&self, r: ValueRef) -> &Key {
        &self.slots[r.0].key
    }

    pub(crate) fn old(&self, r: ValueRef) -> Option<ValueRef> {
        self.slots[r.0].old
    }

    /// Newest value in the chain starting at `r` that was written before
    /// slot `watermark`.
    pub(crate) fn visible_at(&self, mut r: Option<ValueRef>, watermark: usize) -> Option<ValueRef> {
        while let Some(cur) = r {
            if cur.0 < watermark {
                return Some(cur);
            }
            r = self.slots[cur.0].old;
        }
        None
    }

    /// Number of slots, used as a checkpoint position.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Drop every slot at or after `slots`.
    pub(crate) fn truncate(&mut self, slots: usize) {
        if let Some(first) = self.slots.get(slots) {
            self.data.truncate(first.offset);
            self.slots.truncate(slots);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.slots.clear();
    }
}
