//! Lock resolution
//!
//! A transaction's locks are turned into committed versions (or rollback
//! records) here. The primary key is resolved synchronously during commit;
//! secondary keys, locks found by readers and locks found by GC go through
//! the background [`Resolver`] pool.

mod notifier;
mod resolve;
mod scheduler;
mod status;

pub use notifier::{MultiKeysNotifier, Notifier, ResolveFailure};
pub use resolve::{resolve, rollback};
pub use scheduler::{Resolver, Task};
pub use status::{check_txn_status, decide_lock, LockDecision, TxnAction, TxnStatus};
