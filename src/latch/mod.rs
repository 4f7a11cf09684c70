//! Key latches
//!
//! Transactions inside one process serialize their commits on the keys they
//! write. Each key hashes to a slot of a fixed table; a slot owns one latch
//! node per key it has seen plus a FIFO queue of requests waiting on those
//! keys. A request acquires its keys in sorted order, so two requests can
//! never wait on each other.
//!
//! Every node remembers the largest commit version released through it. A
//! request whose start version is older than that has lost the race with a
//! newer commit and is marked stale.

mod scheduler;

pub use scheduler::LatchesScheduler;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxBuildHasher;
use std::collections::VecDeque;
use std::hash::BuildHasher;
use std::sync::Arc;
use tracing::debug;

use crate::kv::{Key, Version};

/// Idle latch nodes are recycled once their last commit is this old
pub(crate) const EXPIRE_DURATION_NANOS: u64 = 2 * 60 * 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireResult {
    Success,
    Locked,
    Stale,
}

#[derive(Debug, Default)]
struct LockState {
    acquired: usize,
    commit_ver: Version,
    stale: bool,
    granted: bool,
}

/// Latch request of one transaction
///
/// Returned by [`LatchesScheduler::lock`] once every key is held or the
/// request turned stale. It must be handed back through
/// [`LatchesScheduler::unlock`] in both cases.
pub struct Lock {
    start_ver: Version,
    keys: Vec<Key>,
    required_slots: Vec<usize>,
    state: Mutex<LockState>,
    cv: Condvar,
}

impl Lock {
    pub fn start_ver(&self) -> Version {
        self.start_ver
    }

    /// Sorted, deduplicated keys covered by this request
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// A newer transaction committed to one of the keys after `start_ver`
    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    pub fn commit_ver(&self) -> Version {
        self.state.lock().commit_ver
    }

    /// Record the commit version published to the latches on unlock
    pub fn set_commit_ver(&self, ver: Version) {
        self.state.lock().commit_ver = ver;
    }

    fn is_locked(&self) -> bool {
        let state = self.state.lock();
        !state.stale && state.acquired < self.required_slots.len()
    }

    /// Wake the owner parked in [`Lock::wait`].
    fn grant(&self) {
        let mut state = self.state.lock();
        state.granted = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !state.granted {
            self.cv.wait(&mut state);
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("start_ver", &self.start_ver)
            .field("keys", &self.keys)
            .finish()
    }
}

struct Node {
    key: Key,
    max_commit_ver: Version,
    holder: Option<Arc<Lock>>,
}

#[derive(Default)]
struct Slot {
    nodes: Vec<Node>,
    waiting: VecDeque<Arc<Lock>>,
}

impl Slot {
    fn find(&mut self, key: &[u8]) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.key.as_bytes() == key)
    }
}

/// Table of latch slots
pub(crate) struct Latches {
    slots: Vec<Mutex<Slot>>,
}

impl Latches {
    /// Table with `size` rounded up to a power of two slots
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            slots: (0..size).map(|_| Mutex::new(Slot::default())).collect(),
        }
    }

    fn slot_id(&self, key: &[u8]) -> usize {
        (FxBuildHasher.hash_one(key) as usize) & (self.slots.len() - 1)
    }

    /// Build a request for `keys`, sorted and deduplicated.
    pub(crate) fn gen_lock(&self, start_ver: Version, mut keys: Vec<Key>) -> Arc<Lock> {
        keys.sort();
        keys.dedup();
        let required_slots = keys.iter().map(|k| self.slot_id(k)).collect();
        Arc::new(Lock {
            start_ver,
            keys,
            required_slots,
            state: Mutex::new(LockState::default()),
            cv: Condvar::new(),
        })
    }

    /// Acquire as many of the remaining keys of `lock` as possible.
    pub(crate) fn acquire(&self, lock: &Arc<Lock>) -> AcquireResult {
        if lock.is_stale() {
            return AcquireResult::Stale;
        }
        loop {
            let acquired = lock.state.lock().acquired;
            if acquired >= lock.required_slots.len() {
                return AcquireResult::Success;
            }
            match self.acquire_slot(lock, acquired) {
                AcquireResult::Success => lock.state.lock().acquired += 1,
                other => return other,
            }
        }
    }

    fn acquire_slot(&self, lock: &Arc<Lock>, idx: usize) -> AcquireResult {
        let key = &lock.keys[idx];
        let mut slot = self.slots[lock.required_slots[idx]].lock();

        let node = match slot.find(key) {
            Some(node) => node,
            None => {
                slot.nodes.push(Node {
                    key: key.clone(),
                    max_commit_ver: Version::MIN,
                    holder: Some(Arc::clone(lock)),
                });
                return AcquireResult::Success;
            }
        };

        if lock.start_ver < node.max_commit_ver {
            lock.state.lock().stale = true;
            return AcquireResult::Stale;
        }
        if node.holder.is_none() {
            node.holder = Some(Arc::clone(lock));
            return AcquireResult::Success;
        }

        slot.waiting.push_back(Arc::clone(lock));
        AcquireResult::Locked
    }

    /// Release every key held by `lock`, collecting the waiters handed a key.
    pub(crate) fn release(&self, lock: &Arc<Lock>, wakeup: &mut Vec<Arc<Lock>>) {
        wakeup.clear();
        loop {
            let idx = {
                let mut state = lock.state.lock();
                if state.acquired == 0 {
                    break;
                }
                state.acquired -= 1;
                state.acquired
            };
            if let Some(next) = self.release_slot(lock, idx) {
                wakeup.push(next);
            }
        }
    }

    fn release_slot(&self, lock: &Arc<Lock>, idx: usize) -> Option<Arc<Lock>> {
        let key = &lock.keys[idx];
        let commit_ver = lock.commit_ver();
        let mut guard = self.slots[lock.required_slots[idx]].lock();
        let slot = &mut *guard;

        let node = slot.nodes.iter_mut().find(|n| n.key == *key)?;
        debug_assert!(node.holder.as_ref().is_some_and(|h| Arc::ptr_eq(h, lock)));
        node.max_commit_ver = node.max_commit_ver.max(commit_ver);
        node.holder = None;

        let pos = slot.waiting.iter().position(|w| {
            let acquired = w.state.lock().acquired;
            w.keys.get(acquired) == Some(key)
        })?;
        let next = slot.waiting.remove(pos)?;

        if node.max_commit_ver > next.start_ver {
            node.holder = Some(Arc::clone(&next));
            let mut state = next.state.lock();
            state.acquired += 1;
            state.stale = true;
        }
        Some(next)
    }

    /// Drop idle nodes whose last commit is older than the expiry window.
    pub(crate) fn recycle(&self, current: Version) -> usize {
        let mut removed = 0;
        for slot in &self.slots {
            let mut slot = slot.lock();
            let before = slot.nodes.len();
            slot.nodes.retain(|n| {
                n.holder.is_some()
                    || n.max_commit_ver.0.saturating_add(EXPIRE_DURATION_NANOS) >= current.0
            });
            removed += before - slot.nodes.len();
        }
        if removed > 0 {
            debug!(removed, current = %current, "recycled idle latch nodes");
        }
        removed
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        self.slots.iter().map(|s| s.lock().nodes.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<Key> {
        list.iter().map(|k| Key::from(*k)).collect()
    }

    fn unlock(latches: &Latches, lock: &Arc<Lock>) -> Vec<Arc<Lock>> {
        let mut wakeup = Vec::new();
        latches.release(lock, &mut wakeup);
        wakeup
    }

    #[test]
    fn test_gen_lock_sorts_and_dedups() {
        let latches = Latches::new(3);
        assert_eq!(latches.slots.len(), 4);
        let lock = latches.gen_lock(Version(1), keys(&["c", "a", "c", "b"]));
        assert_eq!(lock.keys(), keys(&["a", "b", "c"]).as_slice());
        assert_eq!(lock.required_slots.len(), 3);
    }

    #[test]
    fn test_wait_and_wake() {
        let latches = Latches::new(8);
        let first = latches.gen_lock(Version(1), keys(&["a", "b"]));
        let second = latches.gen_lock(Version(2), keys(&["b", "c"]));

        assert_eq!(latches.acquire(&first), AcquireResult::Success);
        assert_eq!(latches.acquire(&second), AcquireResult::Locked);
        assert!(second.is_locked());

        first.set_commit_ver(Version(1));
        let woken = unlock(&latches, &first);
        assert_eq!(woken.len(), 1);
        assert!(Arc::ptr_eq(&woken[0], &second));
        assert_eq!(latches.acquire(&second), AcquireResult::Success);
        assert!(!second.is_stale());
    }

    #[test]
    fn test_stale_after_newer_commit() {
        let latches = Latches::new(8);
        let writer = latches.gen_lock(Version(10), keys(&["a"]));
        assert_eq!(latches.acquire(&writer), AcquireResult::Success);
        writer.set_commit_ver(Version(20));
        unlock(&latches, &writer);

        let old = latches.gen_lock(Version(15), keys(&["a"]));
        assert_eq!(latches.acquire(&old), AcquireResult::Stale);
        assert!(old.is_stale());
        unlock(&latches, &old);

        let newer = latches.gen_lock(Version(25), keys(&["a"]));
        assert_eq!(latches.acquire(&newer), AcquireResult::Success);
    }

    #[test]
    fn test_waiter_turns_stale_on_wake() {
        let latches = Latches::new(1);
        let writer = latches.gen_lock(Version(10), keys(&["a"]));
        let waiter = latches.gen_lock(Version(11), keys(&["a", "b"]));
        assert_eq!(latches.acquire(&writer), AcquireResult::Success);
        assert_eq!(latches.acquire(&waiter), AcquireResult::Locked);

        writer.set_commit_ver(Version(12));
        let woken = unlock(&latches, &writer);
        assert_eq!(woken.len(), 1);
        assert_eq!(latches.acquire(&woken[0]), AcquireResult::Stale);

        // The stale waiter still holds "a" and gives it back on release.
        unlock(&latches, &waiter);
        let next = latches.gen_lock(Version(13), keys(&["a", "b"]));
        assert_eq!(latches.acquire(&next), AcquireResult::Success);
    }

    #[test]
    fn test_recycle_idle_nodes() {
        let latches = Latches::new(4);
        let held = latches.gen_lock(Version(1), keys(&["held"]));
        let idle = latches.gen_lock(Version(1), keys(&["idle"]));
        latches.acquire(&held);
        latches.acquire(&idle);
        idle.set_commit_ver(Version(2));
        unlock(&latches, &idle);
        assert_eq!(latches.node_count(), 2);

        assert_eq!(latches.recycle(Version(3)), 0);
        assert_eq!(latches.recycle(Version(EXPIRE_DURATION_NANOS + 3)), 1);
        assert_eq!(latches.node_count(), 1);
    }
}
