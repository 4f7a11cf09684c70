//! Garbage collection of obsolete MVCC versions
//!
//! Every round first settles the locks dead transactions left at or below
//! the safe point, across the whole keyspace, and waits for the resolver.
//! Only then are versions older than the safe point removed once a newer
//! visible version (or a delete) shadows them. Rollback records and lock
//! records at or below the safe point are dropped too. A lock that cannot
//! be settled holds the safe point below its start version.
//!
//! The manager owns one scheduler thread and a small worker pool. What gets
//! collected each round is decided by a [`GcPolicy`]; the default
//! [`SweepPolicy`] walks the keyspace in fixed-size key ranges.

mod manager;
mod policy;
mod worker;

pub use manager::{GcManager, GcSettings};
pub use policy::{
    ActiveVersions, GcPolicy, GcTask, LifetimeSafePoint, SafePointProvider, SweepPolicy,
    VersionGuard,
};
pub use worker::{collect, resolve_locks, GcStats, ResolvedLocks};
