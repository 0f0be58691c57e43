//! `trans_mark_alloc`: keeps `freespace`, `need_discard`, and `lru`
//! in lockstep with `alloc` (spec §4.C, grounded on
//! `examples/original_source/libbcachefs/alloc_background.c`'s
//! `bch2_trans_mark_alloc`). `alloc` is authoritative; the other three
//! are pure secondary indices over it, so every `alloc` write is
//! accompanied by the matching insert/retire pair on whichever of them
//! the bucket's old and new derived state touches.
//!
//! This only *computes* the set of btree mutations an alloc update
//! implies — applying them transactionally is the caller's job
//! (`trans.rs`), same separation the original keeps between marking
//! and the actual trans_update calls.

use crate::bkey::Bkey;
use crate::bkey::BkeyValue;
use crate::bpos::Bpos;
use crate::btree_id::BtreeId;
use crate::bucket::{AllocV4, BucketState};

/// A single tree/key pair to apply. A `BkeyValue::Deleted` value
/// retires a stale secondary-index entry (spec §4.D.3 treats a
/// deleted key as a hole, which is exactly what "this bucket no
/// longer needs this index entry" means).
pub struct TreeUpdate {
    pub btree: BtreeId,
    pub key: Bkey,
}

/// Compute the mutations needed to move a bucket from `old` (`None` on
/// first write) to `new`. Always includes the `alloc` write itself.
pub fn mark_alloc(dev: u8, bucket_nr: u64, old: Option<&AllocV4>, new: &AllocV4) -> Vec<TreeUpdate> {
    let mut out = Vec::new();

    if let Some(old) = old {
        retire_secondary_entries(dev, bucket_nr, old, new, &mut out);
    }
    insert_secondary_entries(dev, bucket_nr, new, &mut out);

    let alloc_pos = Bpos::new(dev as u64, bucket_nr, 0);
    out.push(TreeUpdate {
        btree: BtreeId::Alloc,
        key: Bkey::new(BtreeId::Alloc, alloc_pos, BkeyValue::Alloc(*new)),
    });
    out
}

fn retire_secondary_entries(
    dev: u8,
    bucket_nr: u64,
    old: &AllocV4,
    new: &AllocV4,
    out: &mut Vec<TreeUpdate>,
) {
    match old.state() {
        BucketState::Free if new.state() != BucketState::Free => {
            let pos = Bkey::freespace_pos(dev, old.freespace_genbits(), bucket_nr);
            out.push(TreeUpdate {
                btree: BtreeId::Freespace,
                key: Bkey::new(BtreeId::Freespace, pos, BkeyValue::Deleted),
            });
        }
        BucketState::Cached if new.state() != BucketState::Cached => {
            let pos = Bkey::lru_pos(dev, old.io_time.read, bucket_nr);
            out.push(TreeUpdate {
                btree: BtreeId::Lru,
                key: Bkey::new(BtreeId::Lru, pos, BkeyValue::Deleted),
            });
        }
        _ => {}
    }
    if old.need_discard && !new.need_discard {
        let pos = Bkey::need_discard_pos(dev, bucket_nr);
        out.push(TreeUpdate {
            btree: BtreeId::NeedDiscard,
            key: Bkey::new(BtreeId::NeedDiscard, pos, BkeyValue::Deleted),
        });
    }
}

fn insert_secondary_entries(dev: u8, bucket_nr: u64, new: &AllocV4, out: &mut Vec<TreeUpdate>) {
    match new.state() {
        BucketState::Free => {
            let pos = Bkey::freespace_pos(dev, new.freespace_genbits(), bucket_nr);
            out.push(TreeUpdate {
                btree: BtreeId::Freespace,
                key: Bkey::new(BtreeId::Freespace, pos, BkeyValue::Freespace),
            });
        }
        BucketState::Cached => {
            let pos = Bkey::lru_pos(dev, new.io_time.read, bucket_nr);
            out.push(TreeUpdate {
                btree: BtreeId::Lru,
                key: Bkey::new(BtreeId::Lru, pos, BkeyValue::Lru),
            });
        }
        _ => {}
    }
    if new.need_discard {
        let pos = Bkey::need_discard_pos(dev, bucket_nr);
        out.push(TreeUpdate {
            btree: BtreeId::NeedDiscard,
            key: Bkey::new(BtreeId::NeedDiscard, pos, BkeyValue::NeedDiscard),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_of_a_free_bucket_adds_a_freespace_entry() {
        let new = AllocV4::new_free(0, 5);
        let updates = mark_alloc(0, 5, None, &new);
        assert!(updates.iter().any(|u| u.btree == BtreeId::Freespace));
        assert!(updates.iter().any(|u| u.btree == BtreeId::Alloc));
    }

    #[test]
    fn allocating_a_free_bucket_retires_its_freespace_entry() {
        let old = AllocV4::new_free(0, 5);
        let mut new = old;
        new.dirty_sectors = 4;
        new.data_type = crate::bucket::DataType::User;
        let updates = mark_alloc(0, 5, Some(&old), &new);
        let retire = updates
            .iter()
            .find(|u| u.btree == BtreeId::Freespace)
            .unwrap();
        assert!(retire.key.is_deleted());
    }

    #[test]
    fn freeing_a_dirty_bucket_inserts_a_fresh_freespace_entry() {
        let mut old = AllocV4::new_free(0, 5);
        old.dirty_sectors = 4;
        old.data_type = crate::bucket::DataType::User;
        let mut new = old;
        new.dirty_sectors = 0;
        new.data_type = crate::bucket::DataType::Free;
        let updates = mark_alloc(0, 5, Some(&old), &new);
        let insert = updates
            .iter()
            .find(|u| u.btree == BtreeId::Freespace)
            .unwrap();
        assert!(!insert.key.is_deleted());
    }

    #[test]
    fn need_discard_flag_produces_a_need_discard_entry() {
        let old = AllocV4::new_free(0, 5);
        let mut new = old;
        new.need_discard = true;
        let updates = mark_alloc(0, 5, Some(&old), &new);
        assert!(updates.iter().any(|u| u.btree == BtreeId::NeedDiscard && !u.key.is_deleted()));
    }
}
