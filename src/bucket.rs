//! Bucket state (spec §3 "Bucket"). Grounded on
//! `examples/original_source/libbcachefs/alloc_background.c`'s
//! `bkey_alloc_unpacked` and its `bucket_state()` helper: bucket state
//! is never stored directly, it is a pure function of a handful of
//! counters so it can never drift out of sync with them.

use std::fmt;

pub const MAX_DEVICES: usize = 64;

/// What a bucket is presently holding. Mirrors the teacher's
/// `BtrfsItemType` enum style (`#[repr(u8)]`, one variant per on-disk
/// tag) applied to bcachefs's `data_type` field instead of btrfs item
/// types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DataType {
    Free = 0,
    Superblock = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
    Parity = 6,
    Stripe = 7,
    NeedGcGens = 8,
    NeedDiscard = 9,
}

impl DataType {
    pub fn from_u8(v: u8) -> Option<DataType> {
        use DataType::*;
        Some(match v {
            0 => Free,
            1 => Superblock,
            2 => Journal,
            3 => Btree,
            4 => User,
            5 => Cached,
            6 => Parity,
            7 => Stripe,
            8 => NeedGcGens,
            9 => NeedDiscard,
            _ => return None,
        })
    }
}

/// The derived bucket state (spec §3), recomputed on every read of the
/// alloc key rather than stored. Order matters for `freespace`'s
/// "most-reclaimable-first" genbits (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Free,
    NeedDiscard,
    NeedGcGens,
    Cached,
    Dirty,
}

impl fmt::Display for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BucketState::Free => "free",
            BucketState::NeedDiscard => "need_discard",
            BucketState::NeedGcGens => "need_gc_gens",
            BucketState::Cached => "cached",
            BucketState::Dirty => "dirty",
        };
        write!(f, "{s}")
    }
}

/// Read-write clock tick recorded on each access, used by the LRU
/// invalidation scanner (§4.C "Invalidation").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoTime {
    pub read: u64,
    pub write: u64,
}

/// Full per-bucket record: this is what `alloc_v4` carries as its
/// value payload. `dev`/`bucket_nr` identify the bucket; everything
/// else is mutable state maintained transactionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocV4 {
    pub dev: u8,
    pub bucket_nr: u64,
    /// Monotonic, wrapping u8 generation. Every pointer into this
    /// bucket records the generation at write time.
    pub gen: u8,
    /// Generation observed the last time this bucket's contents were
    /// known fully consistent; used to detect a wrap past an
    /// outstanding pointer (original's `oldest_gen`).
    pub oldest_gen: u8,
    pub data_type: DataType,
    pub dirty_sectors: u32,
    pub cached_sectors: u32,
    pub io_time: IoTime,
    pub need_discard: bool,
    pub need_inc_gen: bool,
    pub stripe: Option<(u64, u8)>,
}

impl AllocV4 {
    pub fn new_free(dev: u8, bucket_nr: u64) -> AllocV4 {
        AllocV4 {
            dev,
            bucket_nr,
            gen: 0,
            oldest_gen: 0,
            data_type: DataType::Free,
            dirty_sectors: 0,
            cached_sectors: 0,
            io_time: IoTime::default(),
            need_discard: false,
            need_inc_gen: false,
            stripe: None,
        }
    }

    /// Total function from fields to derived state (spec §3).
    pub fn state(&self) -> BucketState {
        if self.need_discard {
            BucketState::NeedDiscard
        } else if self.dirty_sectors == 0 && self.cached_sectors == 0 {
            if self.need_inc_gen {
                BucketState::NeedGcGens
            } else {
                BucketState::Free
            }
        } else if self.dirty_sectors == 0 {
            BucketState::Cached
        } else {
            BucketState::Dirty
        }
    }

    /// 8-bit key used to order `freespace` scans "most reclaimable
    /// first" (§4.C). Buckets that need a generation bump sort after
    /// plain-free buckets so the allocator prefers the ones that need
    /// no extra work.
    pub fn freespace_genbits(&self) -> u8 {
        debug_assert_eq!(self.state(), BucketState::Free);
        if self.need_inc_gen {
            1
        } else {
            0
        }
    }

    /// Bump the generation, wrapping, clearing the flag that requested
    /// it. Called both by the allocator (before handing out a bucket
    /// with `need_inc_gen` set) and by LRU invalidation.
    pub fn bump_gen(&mut self) {
        self.gen = self.gen.wrapping_add(1);
        self.need_inc_gen = false;
    }

    /// Is `pointer_gen` still valid against this bucket's current
    /// generation? A pointer is stale unless its recorded generation
    /// equals the bucket's current generation (spec §8, gen
    /// wraparound invariant: a wrapped successor is never considered
    /// valid again — once bumped, only an exact match counts).
    pub fn gen_valid(&self, pointer_gen: u8) -> bool {
        self.gen == pointer_gen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_bucket_has_free_state() {
        let a = AllocV4::new_free(0, 10);
        assert_eq!(a.state(), BucketState::Free);
    }

    #[test]
    fn dirty_sectors_imply_dirty_state() {
        let mut a = AllocV4::new_free(0, 10);
        a.dirty_sectors = 4;
        a.data_type = DataType::User;
        assert_eq!(a.state(), BucketState::Dirty);
    }

    #[test]
    fn cached_only_is_cached_state() {
        let mut a = AllocV4::new_free(0, 10);
        a.cached_sectors = 4;
        a.data_type = DataType::Cached;
        assert_eq!(a.state(), BucketState::Cached);
    }

    #[test]
    fn need_discard_overrides_everything() {
        let mut a = AllocV4::new_free(0, 10);
        a.dirty_sectors = 4;
        a.need_discard = true;
        assert_eq!(a.state(), BucketState::NeedDiscard);
    }

    #[test]
    fn gen_bump_wraps() {
        let mut a = AllocV4::new_free(0, 10);
        a.gen = 255;
        a.bump_gen();
        assert_eq!(a.gen, 0);
    }

    #[test]
    fn stale_pointer_detected_after_bump() {
        let mut a = AllocV4::new_free(0, 10);
        let old_gen = a.gen;
        assert!(a.gen_valid(old_gen));
        a.bump_gen();
        assert!(!a.gen_valid(old_gen));
    }
}
