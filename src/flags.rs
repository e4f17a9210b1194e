//! Read flags and per-kind record masks.

use crate::types::EntryKind;
use bitflags::bitflags;

bitflags! {
    /// What a caller wants from a read.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ReadFlags: u32 {
        /// Registers, history, variables, search patterns, buffer list.
        const WANT_INFO = 1 << 0;
        /// Marks, jumps and changes.
        const WANT_MARKS = 1 << 1;
        /// Collect the file names of local marks into the old files list.
        const GET_OLDFILES = 1 << 2;
        /// File data wins over live data even when older.
        const FORCE = 1 << 3;
        /// A missing file is an error rather than a silent no-op.
        const MISSING_ERROR = 1 << 4;
    }
}

bitflags! {
    /// Set of record kinds a reader decodes; everything else is skipped.
    ///
    /// Bit `n` stands for type code `n`; [`EntryMask::UNKNOWN`] covers every
    /// code past [`EntryKind::LAST`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EntryMask: u32 {
        const HEADER = 1 << 1;
        const SEARCH_PATTERN = 1 << 2;
        const SUB_STRING = 1 << 3;
        const HISTORY = 1 << 4;
        const REGISTER = 1 << 5;
        const VARIABLE = 1 << 6;
        const GLOBAL_MARK = 1 << 7;
        const JUMP = 1 << 8;
        const BUFFER_LIST = 1 << 9;
        const LOCAL_MARK = 1 << 10;
        const CHANGE = 1 << 11;
        const UNKNOWN = 1 << 12;

        /// Kinds that are read and written regardless of the option string.
        const UNDISABLEABLE = Self::SEARCH_PATTERN.bits() | Self::SUB_STRING.bits() | Self::JUMP.bits();
    }
}

impl EntryMask {
    pub fn of(kind: EntryKind) -> Self {
        Self::from_bits_truncate(1 << kind.code())
    }

    /// Whether a record with this type code should be decoded.
    pub fn wants(self, type_code: u64) -> bool {
        if type_code > EntryKind::LAST {
            self.contains(EntryMask::UNKNOWN)
        } else {
            // Missing (code 0) has no bit and is never wanted.
            let bit = Self::from_bits_truncate(1u32 << type_code);
            !bit.is_empty() && self.contains(bit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_known_kinds() {
        let mask = EntryMask::REGISTER | EntryMask::JUMP;
        assert!(mask.wants(5));
        assert!(mask.wants(8));
        assert!(!mask.wants(7));
        assert!(!mask.wants(0));
        assert!(!EntryMask::all().wants(0));
    }

    #[test]
    fn test_wants_unknown() {
        assert!(!EntryMask::all().difference(EntryMask::UNKNOWN).wants(99));
        assert!(EntryMask::UNKNOWN.wants(12));
        assert!(EntryMask::UNKNOWN.wants(u64::MAX));
    }

    #[test]
    fn test_mask_of_kind() {
        assert_eq!(EntryMask::of(EntryKind::Change), EntryMask::CHANGE);
        assert!(EntryMask::UNDISABLEABLE.contains(EntryMask::of(EntryKind::SubString)));
    }
}
