//! Core key-value types shared by every layer of the engine
//!
//! - [`Key`] raw user keys
//! - [`Version`] and the [`VersionProvider`] seam
//! - [`KeyFlags`] per-key buffer metadata
//! - [`KvError`] the engine-wide error taxonomy
//! - [`KvIterator`] cursor iteration

pub mod error;
pub mod flags;
pub mod iter;
pub mod key;
pub mod version;

pub use error::{KvError, KvResult, LockedError};
pub use flags::{FlagsOp, KeyFlags};
pub use iter::KvIterator;
pub use key::Key;
pub use version::{ClockVersionProvider, Version, VersionProvider};
