//! Bootstrap bucket placement for btree nodes and journal buckets.
//!
//! The alloc/freespace/need_discard/lru trees (spec §4.C) describe
//! bucket *state*, but something has to hand out the very buckets
//! those trees — and every other tree — live in before any tree can be
//! read. Real bcachefs bootstraps this with superblock-embedded
//! layout info; the teacher's own `sys_chunk_array`/`bootstrap_chunks`
//! (`btrfs.rs`) is the same idea for btrfs's chunk tree. This module
//! is that bootstrap layer: a flat free-bitmap of "meta" buckets
//! (btree nodes + journal), persisted as a superblock field, kept
//! intentionally simple because spec §1 scopes on-disk format details
//! ("beyond what is needed to bootstrap the core") out of the core's
//! job.

use std::sync::Mutex;

use crate::error::FsError;

/// One device's worth of meta-bucket bitmap.
pub struct MetaAllocator {
    free: Mutex<Vec<bool>>,
}

impl MetaAllocator {
    pub fn new(nbuckets: u64) -> MetaAllocator {
        MetaAllocator {
            free: Mutex::new(vec![true; nbuckets as usize]),
        }
    }

    /// Restore from a previously-persisted bitmap (mount path).
    pub fn from_bitmap(bits: Vec<bool>) -> MetaAllocator {
        MetaAllocator {
            free: Mutex::new(bits),
        }
    }

    pub fn snapshot(&self) -> Vec<bool> {
        self.free.lock().unwrap().clone()
    }

    pub fn reserve(&self, bucket_nr: u64) -> Result<(), FsError> {
        let mut free = self.free.lock().unwrap();
        let idx = bucket_nr as usize;
        if idx >= free.len() || !free[idx] {
            return Err(FsError::Inconsistent(format!(
                "bucket {bucket_nr} not available for reservation"
            )));
        }
        free[idx] = false;
        Ok(())
    }

    pub fn alloc_one(&self) -> Result<u64, FsError> {
        let mut free = self.free.lock().unwrap();
        match free.iter().position(|f| *f) {
            Some(idx) => {
                free[idx] = false;
                Ok(idx as u64)
            }
            None => Err(FsError::NoSpace),
        }
    }

    pub fn free_one(&self, bucket_nr: u64) {
        let mut free = self.free.lock().unwrap();
        if let Some(slot) = free.get_mut(bucket_nr as usize) {
            *slot = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_is_reusable() {
        let m = MetaAllocator::new(4);
        let a = m.alloc_one().unwrap();
        m.free_one(a);
        let b = m.alloc_one().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhaustion_is_no_space() {
        let m = MetaAllocator::new(1);
        m.alloc_one().unwrap();
        assert!(matches!(m.alloc_one(), Err(FsError::NoSpace)));
    }
}
