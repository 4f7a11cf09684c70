//! Per-key flags kept by the transactional buffer

use std::fmt;
use std::ops::BitOr;

/// Bit set of per-key flags
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KeyFlags(u16);

const FLAG_PRESUME_KEY_NOT_EXISTS: u16 = 1 << 0;
const FLAG_KEY_LOCKED: u16 = 1 << 1;
const FLAG_KEY_LOCKED_VAL_EXIST: u16 = 1 << 2;
const FLAG_NEED_CONSTRAINT_CHECK_IN_PREWRITE: u16 = 1 << 3;
const FLAG_PREWRITE_ONLY: u16 = 1 << 4;
const FLAG_NEWLY_INSERTED: u16 = 1 << 5;

/// Flags that survive a staging cleanup and mark the buffer dirty
const PERSISTENT_FLAGS: u16 = FLAG_KEY_LOCKED | FLAG_KEY_LOCKED_VAL_EXIST;

/// Flags dropped by a plain set without flag operations
const TEMPORARY_FLAGS: u16 = FLAG_NEED_CONSTRAINT_CHECK_IN_PREWRITE;

impl KeyFlags {
    pub const fn empty() -> Self {
        KeyFlags(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The key must not exist in storage; checked at prewrite.
    pub fn has_presume_key_not_exists(self) -> bool {
        self.0 & FLAG_PRESUME_KEY_NOT_EXISTS != 0
    }

    /// The key is locked by this transaction.
    pub fn has_locked(self) -> bool {
        self.0 & FLAG_KEY_LOCKED != 0
    }

    /// The locked key had a value when it was locked.
    pub fn has_locked_value_exists(self) -> bool {
        self.0 & FLAG_KEY_LOCKED_VAL_EXIST != 0
    }

    pub fn has_need_constraint_check_in_prewrite(self) -> bool {
        self.0 & FLAG_NEED_CONSTRAINT_CHECK_IN_PREWRITE != 0
    }

    /// The key only takes part in prewrite and is never committed.
    pub fn has_prewrite_only(self) -> bool {
        self.0 & FLAG_PREWRITE_ONLY != 0
    }

    /// Key did not exist before this transaction wrote it; deleting it
    /// again writes nothing.
    pub fn has_newly_inserted(self) -> bool {
        self.0 & FLAG_NEWLY_INSERTED != 0
    }

    /// Only the persistent bits of this set.
    pub fn persistent(self) -> KeyFlags {
        KeyFlags(self.0 & PERSISTENT_FLAGS)
    }

    pub fn has_persistent(self) -> bool {
        self.0 & PERSISTENT_FLAGS != 0
    }

    pub(crate) fn without_temporary(self) -> KeyFlags {
        KeyFlags(self.0 & !TEMPORARY_FLAGS)
    }

    /// Apply a sequence of flag operations.
    pub fn apply(self, ops: &[FlagsOp]) -> KeyFlags {
        ops.iter().fold(self, |flags, op| flags.apply_one(*op))
    }

    fn apply_one(self, op: FlagsOp) -> KeyFlags {
        let bits = match op {
            FlagsOp::SetPresumeKeyNotExists => self.0 | FLAG_PRESUME_KEY_NOT_EXISTS,
            FlagsOp::DelPresumeKeyNotExists => self.0 & !FLAG_PRESUME_KEY_NOT_EXISTS,
            FlagsOp::SetKeyLocked => self.0 | FLAG_KEY_LOCKED,
            FlagsOp::DelKeyLocked => self.0 & !(FLAG_KEY_LOCKED | FLAG_KEY_LOCKED_VAL_EXIST),
            FlagsOp::SetKeyLockedValueExists => self.0 | FLAG_KEY_LOCKED_VAL_EXIST,
            FlagsOp::SetKeyLockedValueNotExists => self.0 & !FLAG_KEY_LOCKED_VAL_EXIST,
            FlagsOp::SetNeedConstraintCheckInPrewrite => {
                self.0 | FLAG_NEED_CONSTRAINT_CHECK_IN_PREWRITE
            }
            FlagsOp::DelNeedConstraintCheckInPrewrite => {
                self.0 & !FLAG_NEED_CONSTRAINT_CHECK_IN_PREWRITE
            }
            FlagsOp::SetPrewriteOnly => self.0 | FLAG_PREWRITE_ONLY,
            FlagsOp::SetNewlyInserted => self.0 | FLAG_NEWLY_INSERTED,
        };
        KeyFlags(bits)
    }
}

impl fmt::Debug for KeyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (FLAG_PRESUME_KEY_NOT_EXISTS, "PresumeKeyNotExists"),
            (FLAG_KEY_LOCKED, "KeyLocked"),
            (FLAG_KEY_LOCKED_VAL_EXIST, "KeyLockedValueExists"),
            (FLAG_NEED_CONSTRAINT_CHECK_IN_PREWRITE, "NeedConstraintCheckInPrewrite"),
            (FLAG_PREWRITE_ONLY, "PrewriteOnly"),
            (FLAG_NEWLY_INSERTED, "NewlyInserted"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "KeyFlags({})", set.join(" | "))
    }
}

impl BitOr for KeyFlags {
    type Output = KeyFlags;

    fn bitor(self, rhs: KeyFlags) -> KeyFlags {
        KeyFlags(self.0 | rhs.0)
    }
}

/// Operation applied to a key's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsOp {
    SetPresumeKeyNotExists,
    DelPresumeKeyNotExists,
    SetKeyLocked,
    DelKeyLocked,
    SetKeyLockedValueExists,
    SetKeyLockedValueNotExists,
    SetNeedConstraintCheckInPrewrite,
    DelNeedConstraintCheckInPrewrite,
    SetPrewriteOnly,
    SetNewlyInserted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_ops() {
        let flags = KeyFlags::empty().apply(&[FlagsOp::SetKeyLocked, FlagsOp::SetPresumeKeyNotExists]);
        assert!(flags.has_locked());
        assert!(flags.has_presume_key_not_exists());
        assert!(flags.has_persistent());
        assert_eq!(flags.persistent(), KeyFlags::empty().apply(&[FlagsOp::SetKeyLocked]));

        let flags = flags.apply(&[FlagsOp::DelKeyLocked]);
        assert!(!flags.has_locked());
        assert!(!flags.has_persistent());
    }

    #[test]
    fn test_temporary_flags() {
        let flags = KeyFlags::empty().apply(&[
            FlagsOp::SetNeedConstraintCheckInPrewrite,
            FlagsOp::SetPresumeKeyNotExists,
        ]);
        let cleared = flags.without_temporary();
        assert!(!cleared.has_need_constraint_check_in_prewrite());
        assert!(cleared.has_presume_key_not_exists());
    }
}
