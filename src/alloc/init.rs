//! Freespace initialisation (spec §4.C "Freespace initialisation"): a
//! newly-formatted device has `alloc` keys but no `freespace` keys
//! yet. A one-shot pass walks `alloc` and emits the missing secondary
//! keys, then the `freespace_initialized` flag on the member record
//! (spec §6, `MemberRecord::freespace_initialized`) is set so later
//! mounts skip it.

use crate::alloc::allocator::AllocTable;
use crate::alloc::trees::{mark_alloc, TreeUpdate};
use crate::bucket::BucketState;

/// Emit the `freespace`/`need_discard`/`lru` keys implied by every
/// bucket currently in `table`, as if each had just been written for
/// the first time (`old = None`, matching `trans_mark_alloc`'s
/// first-write path in [`crate::alloc::trees::mark_alloc`]). Returns
/// one `TreeUpdate` batch per bucket so the caller can fold them into
/// however many transactions it likes — the original does this a few
/// thousand buckets at a time per commit, which this crate leaves to
/// the caller since it has no fixed transaction-size budget here.
pub fn build_freespace_index(table: &AllocTable) -> Vec<TreeUpdate> {
    let mut out = Vec::new();
    for bucket_nr in 0..table.len() {
        let a = match table.get(bucket_nr) {
            Some(a) => a,
            None => continue,
        };
        // Skip buckets whose state implies no secondary index entry at
        // all (plain dirty/user data with no discard/LRU relevance) —
        // mark_alloc would emit nothing extra for those besides the
        // alloc key itself, which this pass doesn't need to re-touch.
        if a.state() == BucketState::Dirty && !a.need_discard {
            continue;
        }
        out.extend(mark_alloc(a.dev, bucket_nr, None, a));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree_id::BtreeId;

    #[test]
    fn free_buckets_get_a_freespace_entry_each() {
        let table = AllocTable::new_all_free(0, 8);
        let updates = build_freespace_index(&table);
        let freespace_count = updates.iter().filter(|u| u.btree == BtreeId::Freespace).count();
        assert_eq!(freespace_count, 8);
    }

    #[test]
    fn plain_dirty_buckets_produce_no_secondary_entries() {
        let mut table = AllocTable::new_all_free(0, 4);
        table.allocate(crate::bucket::DataType::User).unwrap();
        let updates = build_freespace_index(&table);
        // 3 remaining free buckets get freespace entries; the allocated
        // one contributes nothing besides its own alloc key, which this
        // pass doesn't emit.
        assert_eq!(updates.iter().filter(|u| u.btree == BtreeId::Freespace).count(), 3);
    }
}
