//! Cursor-style iteration shared by the buffer, snapshot and union store

use super::{Key, KvResult};

/// A positioned cursor over ordered key/value pairs.
///
/// `key`/`value` may only be called while `valid` returns true.
pub trait KvIterator {
    fn valid(&self) -> bool;

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// Advance to the next entry in iteration order.
    fn next(&mut self) -> KvResult<()>;

    /// Drain the remaining entries into owned pairs.
    fn collect_pairs(mut self) -> KvResult<Vec<(Key, Vec<u8>)>>
    where
        Self: Sized,
    {
        let mut pairs = Vec::new();
        while self.valid() {
            pairs.push((Key::from(self.key()), self.value().to_vec()));
            self.next()?;
        }
        Ok(pairs)
    }
}

impl<I: KvIterator + ?Sized> KvIterator for Box<I> {
    fn valid(&self) -> bool {
        (**self).valid()
    }

    fn key(&self) -> &[u8] {
        (**self).key()
    }

    fn value(&self) -> &[u8] {
        (**self).value()
    }

    fn next(&mut self) -> KvResult<()> {
        (**self).next()
    }
}
