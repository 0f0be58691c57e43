//! `bpos`: the 96-bit key all btrees are indexed by (spec §3 "Key").

use std::cmp::Ordering;
use std::fmt;

/// `(inode, offset, snapshot)`, totally ordered lexicographically in
/// that order. Mirrors the teacher's `btrfs_disk_key` three-field
/// ordering (`objectid`, `item_type`, `offset`) in `tree.rs::cmp_key_option`,
/// generalized to the versioned key this spec needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: u32,
}

impl Bpos {
    pub const fn new(inode: u64, offset: u64, snapshot: u32) -> Bpos {
        Bpos {
            inode,
            offset,
            snapshot,
        }
    }

    /// Least possible key.
    pub const POS_MIN: Bpos = Bpos::new(0, 0, 0);

    /// Greatest possible key at a given snapshot horizon: used when a
    /// range scan should run to the end of the keyspace regardless of
    /// snapshot.
    pub const fn spos_max() -> Bpos {
        Bpos::new(u64::MAX, u64::MAX, u32::MAX)
    }

    /// True if `self` and `other` are the same logical key ignoring
    /// snapshot (used by snapshot filtering, §4.D.3).
    pub fn same_logical_key(&self, other: &Bpos) -> bool {
        self.inode == other.inode && self.offset == other.offset
    }
}

impl Ord for Bpos {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.inode, self.offset, self.snapshot).cmp(&(
            other.inode,
            other.offset,
            other.snapshot,
        ))
    }
}

impl PartialOrd for Bpos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Bpos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{}:{})", self.inode, self.offset, self.snapshot)
    }
}

/// POS_MIN as a free function, for call sites that don't want to spell
/// out the associated const.
pub const POS_MIN: Bpos = Bpos::POS_MIN;
