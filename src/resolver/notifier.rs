use parking_lot::{Condvar, Mutex};

use crate::kv::{Key, KvError, KvResult};

/// Receives the outcome of resolve tasks
pub trait Notifier: Send + Sync {
    fn notify(&self, key: &Key, result: KvResult<()>);
}

/// A key that could not be resolved
#[derive(Debug)]
pub struct ResolveFailure {
    pub key: Key,
    pub error: KvError,
}

#[derive(Debug, Default)]
struct NotifierState {
    remaining: usize,
    failures: Vec<ResolveFailure>,
}

/// Counts down a fixed number of completions
///
/// Each task notifies exactly once; [`MultiKeysNotifier::wait`] returns once
/// every task reported and yields the failures.
#[derive(Debug, Default)]
pub struct MultiKeysNotifier {
    state: Mutex<NotifierState>,
    done: Condvar,
}

impl MultiKeysNotifier {
    pub fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(NotifierState {
                remaining: size,
                failures: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    /// Block until every task reported.
    pub fn wait(&self) -> Vec<ResolveFailure> {
        let mut state = self.state.lock();
        while state.remaining > 0 {
            self.done.wait(&mut state);
        }
        std::mem::take(&mut state.failures)
    }
}

impl Notifier for MultiKeysNotifier {
    fn notify(&self, key: &Key, result: KvResult<()>) {
        let mut state = self.state.lock();
        if let Err(error) = result {
            state.failures.push(ResolveFailure {
                key: key.clone(),
                error,
            });
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_collects_failures() {
        let notifier = Arc::new(MultiKeysNotifier::new(3));
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|k| {
                let notifier = Arc::clone(&notifier);
                std::thread::spawn(move || {
                    let result = if k == "b" {
                        Err(KvError::txn_not_found())
                    } else {
                        Ok(())
                    };
                    notifier.notify(&Key::from(k), result);
                })
            })
            .collect();

        let failures = notifier.wait();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, Key::from("b"));
        assert!(failures[0].error.is_retryable());
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_zero_size_returns_immediately() {
        assert!(MultiKeysNotifier::new(0).wait().is_empty());
    }
}
