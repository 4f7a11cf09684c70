use parking_lot::{Mutex, RwLock};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use super::{AcquireResult, Latches, Lock};
use crate::kv::{Key, KvError, KvResult, Version};

const UNLOCK_CHANNEL_SIZE: usize = 100;
const CHECK_INTERVAL_NANOS: u64 = 60 * 1_000_000_000;
const CHECK_COUNTER: usize = 50_000;

/// Grants key latches to committing transactions
///
/// Unlocks are handed to a dedicated release thread which wakes the next
/// waiter of every released key.
pub struct LatchesScheduler {
    latches: Arc<Latches>,
    unlock_tx: RwLock<Option<SyncSender<Arc<Lock>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LatchesScheduler {
    /// Start a scheduler with `size` latch slots.
    pub fn new(size: usize) -> KvResult<Self> {
        let latches = Arc::new(Latches::new(size));
        let (tx, rx) = sync_channel(UNLOCK_CHANNEL_SIZE);

        let worker_latches = Arc::clone(&latches);
        let handle = std::thread::Builder::new()
            .name("samyama-latch".to_string())
            .spawn(move || release_loop(worker_latches, rx))
            .map_err(KvError::Io)?;

        Ok(Self {
            latches,
            unlock_tx: RwLock::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Block until every key is latched or the request turns stale.
    pub fn lock(&self, start_ver: Version, keys: Vec<Key>) -> Arc<Lock> {
        let lock = self.latches.gen_lock(start_ver, keys);
        if self.latches.acquire(&lock) == AcquireResult::Locked {
            lock.wait();
        }
        debug_assert!(!lock.is_locked());
        lock
    }

    /// Hand a granted or stale request back to the release thread.
    pub fn unlock(&self, lock: Arc<Lock>) {
        let tx = self.unlock_tx.read();
        let lock = match tx.as_ref() {
            Some(tx) => match tx.send(lock) {
                Ok(()) => return,
                Err(err) => err.0,
            },
            None => lock,
        };
        drop(tx);

        // The release thread is gone; release inline so waiters still wake.
        let mut wakeup = Vec::new();
        self.latches.release(&lock, &mut wakeup);
        wake(&self.latches, wakeup);
    }

    /// Stop accepting unlocks and wait for queued ones to be processed.
    pub fn close(&self) {
        let tx = self.unlock_tx.write().take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("latch release thread panicked");
            }
        }
        info!("latch scheduler closed");
    }
}

impl Drop for LatchesScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

fn wake(latches: &Latches, wakeup: Vec<Arc<Lock>>) {
    for lock in wakeup {
        if latches.acquire(&lock) != AcquireResult::Locked {
            lock.grant();
        }
    }
}

fn release_loop(latches: Arc<Latches>, rx: Receiver<Arc<Lock>>) {
    let mut counter = 0usize;
    let mut last_recycle = Version::MIN;
    let mut wakeup = Vec::new();

    for lock in rx.iter() {
        latches.release(&lock, &mut wakeup);
        if !wakeup.is_empty() {
            wake(&latches, std::mem::take(&mut wakeup));
        }

        let commit_ver = lock.commit_ver();
        if commit_ver > lock.start_ver() {
            let elapsed = commit_ver.0.saturating_sub(last_recycle.0);
            if elapsed > CHECK_INTERVAL_NANOS || counter > CHECK_COUNTER {
                latches.recycle(commit_ver);
                last_recycle = commit_ver;
                counter = 0;
            }
        }
        counter += 1;
    }
    debug!("latch release thread exiting");
}
