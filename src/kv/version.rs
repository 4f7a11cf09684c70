//! Versions and version providers
//!
//! Versions are wall-clock derived nanosecond counters. The provider never
//! hands out the same version twice and never goes backwards, even if the
//! system clock does after start-up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use super::{KvError, KvResult};

/// Transaction version
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    /// Lowest version, also the version of meta keys
    pub const MIN: Version = Version(0);
    /// Sentinel version of lock records
    pub const LOCK: Version = Version(u64::MAX);

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Version reached after `millis` milliseconds, saturating at [`Version::LOCK`] - 1.
    pub fn add_millis(self, millis: u64) -> Version {
        let nanos = millis.saturating_mul(1_000_000);
        Version(self.0.saturating_add(nanos).min(u64::MAX - 1))
    }

    /// Version `millis` milliseconds earlier, saturating at [`Version::MIN`].
    pub fn sub_millis(self, millis: u64) -> Version {
        Version(self.0.saturating_sub(millis.saturating_mul(1_000_000)))
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Version(v)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of new versions for transactions and TTL checks
pub trait VersionProvider: Send + Sync {
    fn current_version(&self) -> Version;
}

fn wall_clock_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or(u64::MAX - 1)
}

/// Monotonic wall-clock version provider
#[derive(Debug)]
pub struct ClockVersionProvider {
    last: AtomicU64,
}

impl ClockVersionProvider {
    /// Create a provider that only issues versions above `high_water`.
    ///
    /// `high_water` is the largest version already persisted. A wall clock
    /// that is not ahead of it means the clock moved backwards while the
    /// engine was down.
    pub fn new(high_water: Version) -> KvResult<Self> {
        let now = wall_clock_nanos();
        if now <= high_water.0 {
            return Err(KvError::ClockRegression {
                persisted: high_water,
                now: Version(now),
            });
        }
        Ok(Self {
            last: AtomicU64::new(high_water.0),
        })
    }

    /// Last version handed out
    pub fn last_version(&self) -> Version {
        Version(self.last.load(Ordering::Acquire))
    }
}

impl VersionProvider for ClockVersionProvider {
    fn current_version(&self) -> Version {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let now = wall_clock_nanos();
            if now <= last && last - now > 1_000_000_000 {
                warn!(now, last, "wall clock is behind the last issued version");
            }
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Version(next),
                Err(actual) => last = actual,
            }
        }
    }
}
