use std::sync::Arc;
use tracing::{debug, trace};

use super::commit::{collect_mutations, commit};
use super::snapshot::Snapshot;
use super::union_store::{UnionIter, UnionStore};
use super::Engine;
use crate::kv::{FlagsOp, KvError, KvResult, Version};
use crate::memdb::{MemDb, StagingHandle};

/// Lifecycle of a [`Transaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

/// An optimistic transaction
///
/// Writes are buffered in memory and only reach the store on
/// [`Transaction::commit`]. Reads see the buffered writes on top of the
/// snapshot taken at the start version. The snapshot, and with it the GC
/// pin on the start version, is dropped as soon as the transaction ends.
pub struct Transaction {
    engine: Arc<Engine>,
    start_ver: Version,
    state: TxnState,
    commit_ver: Option<Version>,
    /// `None` once committed or rolled back
    store: Option<UnionStore>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        let start_ver = engine.current_version();
        let snapshot = Snapshot::new(Arc::clone(&engine), start_ver);
        let buffer = MemDb::with_limits(
            engine.options.entry_size_limit,
            engine.options.txn_total_size_limit,
        );
        engine.metrics.record_begin();
        trace!(start_ver = %start_ver, "transaction started");
        Self {
            engine,
            start_ver,
            state: TxnState::Active,
            commit_ver: None,
            store: Some(UnionStore::with_buffer(buffer, snapshot)),
        }
    }

    pub fn start_ver(&self) -> Version {
        self.start_ver
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Commit version, once committed with at least one write.
    pub fn commit_ver(&self) -> Option<Version> {
        self.commit_ver
    }

    /// Whether nothing was written so far
    pub fn is_read_only(&self) -> bool {
        self.store.as_ref().map_or(true, |store| !store.buffer().dirty())
    }

    pub fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        match self.store()?.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(KvError::NotExist) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.store_mut()?.buffer_mut().set(key, value)
    }

    /// Write `key` only if it does not exist yet; checked at commit.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.store_mut()?
            .buffer_mut()
            .set_with_flags(key, value, &[FlagsOp::SetPresumeKeyNotExists])
    }

    pub fn delete(&mut self, key: &[u8]) -> KvResult<()> {
        self.store_mut()?.buffer_mut().delete(key)
    }

    /// Lock `key` at commit without changing its value.
    ///
    /// Concurrent writers of the key then conflict with this transaction.
    pub fn lock_key(&mut self, key: &[u8]) -> KvResult<()> {
        self.update_flags(key, &[FlagsOp::SetKeyLocked])
    }

    /// Apply flag operations to `key` in the write buffer.
    pub fn update_flags(&mut self, key: &[u8], ops: &[FlagsOp]) -> KvResult<()> {
        self.store_mut()?.buffer_mut().update_flags(key, ops);
        Ok(())
    }

    pub fn iter(&self, lower: &[u8], upper: &[u8]) -> KvResult<UnionIter<'_>> {
        self.store()?.iter(lower, upper)
    }

    pub fn iter_reverse(&self, lower: &[u8], upper: &[u8]) -> KvResult<UnionIter<'_>> {
        self.store()?.iter_reverse(lower, upper)
    }

    /// Open a nested stage of the write buffer.
    pub fn staging(&mut self) -> KvResult<StagingHandle> {
        Ok(self.store_mut()?.buffer_mut().staging())
    }

    /// Keep the writes of stage `h`.
    pub fn release(&mut self, h: StagingHandle) -> KvResult<()> {
        self.store_mut()?.buffer_mut().release(h)
    }

    /// Undo the writes of stage `h`.
    pub fn cleanup(&mut self, h: StagingHandle) -> KvResult<()> {
        self.store_mut()?.buffer_mut().cleanup(h)
    }

    /// Write buffer, `None` once the transaction ended
    pub fn buffer(&self) -> Option<&MemDb> {
        self.store.as_ref().map(|store| store.buffer())
    }

    /// Commit the buffered writes.
    ///
    /// Returns the commit version; a transaction without writes commits at
    /// its start version. On error the transaction is rolled back.
    pub fn commit(&mut self) -> KvResult<Version> {
        let result = collect_mutations(self.store()?.buffer())
            .and_then(|mutations| commit(&self.engine, self.start_ver, mutations));
        let metrics = Arc::clone(&self.engine.metrics);
        match result {
            Ok(commit_ver) => {
                self.finish(TxnState::Committed);
                self.commit_ver = commit_ver;
                metrics.record_commit();
                Ok(commit_ver.unwrap_or(self.start_ver))
            }
            Err(err) => {
                if matches!(err, KvError::TxnConflicts | KvError::Conflict { .. }) {
                    metrics.record_conflict();
                }
                debug!(start_ver = %self.start_ver, error = %err, "commit failed");
                self.finish(TxnState::RolledBack);
                metrics.record_rollback();
                Err(err)
            }
        }
    }

    /// Discard the buffered writes.
    pub fn rollback(&mut self) -> KvResult<()> {
        self.store()?;
        self.finish(TxnState::RolledBack);
        self.engine.metrics.record_rollback();
        trace!(start_ver = %self.start_ver, "transaction rolled back");
        Ok(())
    }

    /// Leave the active state, dropping the buffer and the snapshot pin.
    fn finish(&mut self, state: TxnState) {
        self.state = state;
        self.store = None;
    }

    fn store(&self) -> KvResult<&UnionStore> {
        match (self.state, &self.store) {
            (TxnState::Active, Some(store)) => Ok(store),
            _ => Err(KvError::InvalidTxn),
        }
    }

    fn store_mut(&mut self) -> KvResult<&mut UnionStore> {
        match (self.state, &mut self.store) {
            (TxnState::Active, Some(store)) => Ok(store),
            _ => Err(KvError::InvalidTxn),
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("start_ver", &self.start_ver)
            .field("state", &self.state)
            .field("commit_ver", &self.commit_ver)
            .field("keys", &self.buffer().map_or(0, |buffer| buffer.len()))
            .finish()
    }
}
