//! Bucket allocation (spec §4.C "Allocation"): scan for a free bucket
//! in `freespace` order — buckets that don't need a generation bump
//! first — claim it, retry past anything already taken, `NoSpace`
//! once nothing remains.
//!
//! Real bcachefs partitions allocation across several concurrent
//! "open buckets"/write points by data type so unrelated writers don't
//! serialize on one cursor; that partitioning is left out here as a
//! scale simplification (spec §1 scopes multi-writer throughput out of
//! the core's job) — this does the same selection, just through one
//! table at a time.

use crate::bucket::{AllocV4, BucketState, DataType};
use crate::error::FsError;

/// One device's full `alloc` state, in allocation order. A real mount
/// keeps this in the `alloc` btree and scans `freespace` for
/// candidates instead of a flat table; this is the in-memory
/// equivalent used for the allocation decision itself, with
/// [`crate::alloc::trees::mark_alloc`] translating a decision back
/// into the btree writes that keep on-disk state in sync.
pub struct AllocTable {
    #[allow(dead_code)]
    dev: u8,
    buckets: Vec<AllocV4>,
}

impl AllocTable {
    pub fn new_all_free(dev: u8, nbuckets: u64) -> AllocTable {
        AllocTable {
            dev,
            buckets: (0..nbuckets).map(|n| AllocV4::new_free(dev, n)).collect(),
        }
    }

    pub fn get(&self, bucket_nr: u64) -> Option<&AllocV4> {
        self.buckets.get(bucket_nr as usize)
    }

    pub fn set(&mut self, bucket_nr: u64, new: AllocV4) {
        if let Some(slot) = self.buckets.get_mut(bucket_nr as usize) {
            *slot = new;
        }
    }

    pub fn len(&self) -> u64 {
        self.buckets.len() as u64
    }

    /// Claim a free bucket for `data_type`, bumping its generation
    /// first if it was left needing one. Returns `(old, new)` so the
    /// caller can feed both into `trees::mark_alloc`.
    pub fn allocate(&mut self, data_type: DataType) -> Result<(AllocV4, AllocV4), FsError> {
        let candidate = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state() == BucketState::Free)
            .min_by_key(|(_, b)| u8::from(b.need_inc_gen))
            .map(|(i, _)| i);

        let idx = candidate.ok_or(FsError::NoSpace)?;
        let old = self.buckets[idx];
        let mut new = old;
        if new.need_inc_gen {
            new.bump_gen();
        }
        new.data_type = data_type;
        new.dirty_sectors = 1;
        self.buckets[idx] = new;
        Ok((old, new))
    }

    /// Release a bucket back to the free pool. The bucket is left
    /// `need_inc_gen` so the *next* allocation bumps its generation
    /// before handing it out again — any pointer still referencing the
    /// old generation must see it as stale (spec §8 gen wraparound
    /// invariant).
    pub fn free(&mut self, bucket_nr: u64) -> Result<(AllocV4, AllocV4), FsError> {
        let idx = bucket_nr as usize;
        let old = *self
            .buckets
            .get(idx)
            .ok_or_else(|| FsError::Inconsistent(format!("no bucket {bucket_nr}")))?;
        let mut new = old;
        new.data_type = DataType::Free;
        new.dirty_sectors = 0;
        new.cached_sectors = 0;
        new.need_inc_gen = true;
        self.buckets[idx] = new;
        Ok((old, new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_claims_a_free_bucket() {
        let mut t = AllocTable::new_all_free(0, 8);
        let (old, new) = t.allocate(DataType::Btree).unwrap();
        assert_eq!(old.state(), BucketState::Free);
        assert_eq!(new.state(), BucketState::Dirty);
    }

    #[test]
    fn freed_bucket_bumps_gen_on_reallocation() {
        let mut t = AllocTable::new_all_free(0, 1);
        let (_, first) = t.allocate(DataType::User).unwrap();
        t.free(first.bucket_nr).unwrap();
        let (old, new) = t.allocate(DataType::User).unwrap();
        assert_eq!(old.gen, first.gen);
        assert_eq!(new.gen, first.gen.wrapping_add(1));
    }

    #[test]
    fn exhaustion_is_no_space() {
        let mut t = AllocTable::new_all_free(0, 1);
        t.allocate(DataType::User).unwrap();
        assert!(matches!(t.allocate(DataType::User), Err(FsError::NoSpace)));
    }
}
