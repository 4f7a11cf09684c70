//! Reads of the buffer as it was when the outermost stage was opened
//!
//! Statement-level execution stages its writes; readers that must not see
//! the statement's own writes use these views.

use super::{MemDb, MemDbIter};
use crate::kv::{KvError, KvResult};

impl MemDb {
    fn snapshot_watermark(&self) -> Option<usize> {
        self.stages.first().map(|cp| cp.slots)
    }

    /// Value of `key` as of the outermost stage.
    pub fn snapshot_get(&self, key: &[u8]) -> KvResult<&[u8]> {
        let node = self.nodes.get(key).ok_or(KvError::NotExist)?;
        let value = match self.snapshot_watermark() {
            Some(mark) => self.arena.visible_at(node.value, mark),
            None => node.value,
        };
        value
            .map(|r| self.arena.get(r))
            .ok_or(KvError::NotExist)
    }

    /// Ascending iterator over `[lower, upper)` as of the outermost stage.
    pub fn snapshot_iter(&self, lower: &[u8], upper: &[u8]) -> MemDbIter<'_> {
        MemDbIter::new(self, lower, upper, false, false, self.snapshot_watermark())
    }
}
