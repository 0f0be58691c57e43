//! LRU invalidation (spec §4.C "Invalidation"): reclaim the least
//! recently used cached-only bucket by picking the smallest
//! `io_time.read` among `Cached` buckets, bumping its generation to
//! invalidate any outstanding pointer, and zeroing it back to free.

use crate::alloc::allocator::AllocTable;
use crate::bucket::{AllocV4, BucketState, DataType};
use crate::error::FsError;

/// Pick and reclaim the coldest cached bucket among `candidates`
/// (bucket numbers as read from the `lru` tree, already in `io_time`
/// order on disk — re-sorted here since the in-memory table doesn't
/// preserve that ordering). Returns the bucket number and its
/// before/after state for the caller to fold into `trees::mark_alloc`.
pub fn invalidate_one(
    table: &mut AllocTable,
    candidates: &[u64],
) -> Result<(u64, AllocV4, AllocV4), FsError> {
    let victim = candidates
        .iter()
        .filter_map(|&n| table.get(n).map(|a| (n, *a)))
        .filter(|(_, a)| a.state() == BucketState::Cached)
        .min_by_key(|(_, a)| a.io_time.read)
        .ok_or(FsError::NotFound)?;

    let (bucket_nr, old) = victim;
    let mut new = old;
    new.bump_gen();
    new.cached_sectors = 0;
    new.data_type = DataType::Free;
    table.set(bucket_nr, new);
    Ok((bucket_nr, old, new))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached_bucket(table: &mut AllocTable, bucket_nr: u64, read_time: u64) {
        let mut a = *table.get(bucket_nr).unwrap();
        a.data_type = DataType::Cached;
        a.cached_sectors = 4;
        a.io_time.read = read_time;
        table.set(bucket_nr, a);
    }

    #[test]
    fn picks_the_coldest_candidate() {
        let mut table = AllocTable::new_all_free(0, 8);
        cached_bucket(&mut table, 1, 50);
        cached_bucket(&mut table, 2, 5);
        cached_bucket(&mut table, 3, 80);

        let (bucket_nr, old, new) = invalidate_one(&mut table, &[1, 2, 3]).unwrap();
        assert_eq!(bucket_nr, 2);
        assert_eq!(new.state(), BucketState::Free);
        assert_eq!(new.gen, old.gen.wrapping_add(1));
    }

    #[test]
    fn no_cached_candidates_is_not_found() {
        let mut table = AllocTable::new_all_free(0, 8);
        assert!(matches!(invalidate_one(&mut table, &[1, 2]), Err(FsError::NotFound)));
    }
}
