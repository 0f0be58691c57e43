//! `BtreeIter`: descent, cursor movement, and snapshot filtering
//! (spec §4.D.3, §4.D.4). Sits on top of `BtreeStore` — it never reads
//! a device directly, only asks the store to resolve child pointers
//! and hands back nodes the store already verified and cached.

use anyhow::{anyhow, Result};

use crate::bkey::{Bkey, BkeyValue};
use crate::bpos::Bpos;
use crate::btree::cache::NodeCacheKey;
use crate::btree::store::BtreeStore;
use crate::btree_id::BtreeId;

/// Bitset of iterator behaviors (spec §4.D.3). Plain `u32` constants
/// rather than a `bitflags`-style derive: the corpus doesn't pull in
/// that crate anywhere, and there are only a handful of bits.
pub mod flags {
    pub const NONE: u32 = 0;
    /// Collapse multiple snapshot versions of the same logical key down
    /// to the one visible at the iterator's snapshot horizon.
    pub const FILTER_SNAPSHOTS: u32 = 1 << 0;
    /// Opposite of `FILTER_SNAPSHOTS`: surface every snapshot version.
    pub const ALL_SNAPSHOTS: u32 = 1 << 1;
    pub const IS_EXTENTS: u32 = 1 << 2;
    pub const WITH_UPDATES: u32 = 1 << 3;
    pub const WITH_JOURNAL: u32 = 1 << 4;
    pub const WITH_KEY_CACHE: u32 = 1 << 5;
    pub const CACHED: u32 = 1 << 6;
}

fn has(f: u32, bit: u32) -> bool {
    f & bit != 0
}

/// Compare by `(inode, offset)` only, ignoring snapshot — the scan
/// order for `peek`/`prev` walks logical keys forward/backward; which
/// *snapshot* of a logical key is visible is `visible`'s job, not the
/// scan's, since a visible version can carry a lower snapshot number
/// than the cursor's own snapshot component.
fn logical_at_or_after(pos: Bpos, cursor: Bpos) -> bool {
    (pos.inode, pos.offset) >= (cursor.inode, cursor.offset)
}

fn logical_before(pos: Bpos, cursor: Bpos) -> bool {
    (pos.inode, pos.offset) < (cursor.inode, cursor.offset)
}

/// `offset + 1`, saturating rather than rolling into the next inode —
/// good enough to step past one key's position without a full 96-bit
/// increment helper.
fn bump_offset(pos: Bpos) -> Bpos {
    Bpos::new(pos.inode, pos.offset.saturating_add(1), 0)
}

pub struct BtreeIter<'s> {
    store: &'s BtreeStore,
    btree: BtreeId,
    pos: Bpos,
    flags: u32,
    /// Snapshot horizon for `FILTER_SNAPSHOTS`: the highest snapshot id
    /// visible to this reader.
    snapshot_visible: u32,
}

impl<'s> BtreeIter<'s> {
    pub fn new(store: &'s BtreeStore, btree: BtreeId, pos: Bpos, flags: u32) -> BtreeIter<'s> {
        BtreeIter {
            store,
            btree,
            pos,
            flags,
            snapshot_visible: pos.snapshot,
        }
    }

    pub fn set_pos(&mut self, pos: Bpos) {
        self.pos = pos;
        self.snapshot_visible = pos.snapshot;
    }

    pub fn rewind(&mut self) {
        self.set_pos(Bpos::POS_MIN);
    }

    /// Descend from the tree's root to the leaf that would contain
    /// `pos` (spec §4.D.4). The actual descent lives on `BtreeStore`
    /// now (`BtreeStore::leaf_for`), since the transaction engine needs
    /// the same walk plus the ancestor chain a split requires.
    fn leaf_for(&self, pos: Bpos) -> Result<NodeCacheKey> {
        self.store.leaf_for(self.btree, pos)
    }

    fn leaf_bounds(&self, key: &NodeCacheKey) -> Option<(Bpos, Bpos)> {
        self.store
            .cache
            .with_node(key, |n| (n.header.min_key, n.header.max_key))
    }

    /// Pick the logical winner among keys sharing `same_logical_key`:
    /// with `FILTER_SNAPSHOTS`, the highest snapshot not exceeding the
    /// iterator's horizon (the closest visible ancestor version).
    /// Never called under `ALL_SNAPSHOTS` — `peek`/`prev` enumerate
    /// every resident version directly in that mode instead of
    /// collapsing to one winner per logical key.
    fn visible<'a>(&self, keys: &'a [Bkey], at: Bpos) -> Option<&'a Bkey> {
        let candidates = keys.iter().filter(|k| k.pos.same_logical_key(&at));
        if has(self.flags, flags::FILTER_SNAPSHOTS) {
            candidates
                .filter(|k| k.pos.snapshot <= self.snapshot_visible)
                .max_by_key(|k| k.pos.snapshot)
        } else {
            candidates.min_by_key(|k| k.pos.snapshot)
        }
    }

    /// Return the next visible key at or after the cursor, crossing
    /// leaf boundaries as needed (spec §4.D.3 `peek`). Deleted entries
    /// are holes and are skipped rather than returned.
    pub fn peek(&mut self) -> Result<Option<Bkey>> {
        let mut cursor = self.pos;
        loop {
            let leaf = self.leaf_for(cursor)?;
            let (min_key, max_key) = self
                .leaf_bounds(&leaf)
                .ok_or_else(|| anyhow!("leaf {leaf:?} not resident"))?;
            let keys = self
                .store
                .cache
                .with_node(&leaf, |n| n.merged_keys())
                .ok_or_else(|| anyhow!("leaf {leaf:?} not resident"))?;

            if has(self.flags, flags::ALL_SNAPSHOTS) {
                let mut scan: Vec<Bpos> = keys.iter().map(|k| k.pos).filter(|p| *p >= cursor).collect();
                scan.sort();
                for candidate_pos in scan {
                    if let Some(found) = keys.iter().find(|k| k.pos == candidate_pos) {
                        if found.is_deleted() {
                            continue;
                        }
                        self.pos = found.pos;
                        return Ok(Some(found.clone()));
                    }
                }
            } else {
                let mut scan: Vec<Bpos> = keys
                    .iter()
                    .map(|k| k.pos)
                    .filter(|p| logical_at_or_after(*p, cursor))
                    .collect();
                scan.sort_by_key(|p| (p.inode, p.offset));
                scan.dedup_by_key(|p| (p.inode, p.offset));

                for candidate_pos in scan {
                    if let Some(found) = self.visible(&keys, candidate_pos) {
                        if found.is_deleted() {
                            continue;
                        }
                        self.pos = found.pos;
                        return Ok(Some(found.clone()));
                    }
                }
            }

            if max_key >= Bpos::spos_max() {
                return Ok(None);
            }
            cursor = bump_offset(max_key);
        }
    }

    /// Like `peek`, but fails closed at `end`: a match past `end`
    /// reports no results instead of the out-of-range key.
    pub fn peek_upto(&mut self, end: Bpos) -> Result<Option<Bkey>> {
        let saved = self.pos;
        match self.peek()? {
            Some(k) if k.pos <= end => Ok(Some(k)),
            Some(_) => {
                self.pos = saved;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Like `peek`, but a position with no real key present is
    /// reported as an explicit deleted hole rather than skipped (spec
    /// §4.D.3: "peek_slot ... synthesising a deleted key").
    pub fn peek_slot(&mut self) -> Result<Bkey> {
        let target = self.pos;
        let leaf = self.leaf_for(target)?;
        let keys = self
            .store
            .cache
            .with_node(&leaf, |n| n.merged_keys())
            .ok_or_else(|| anyhow!("leaf {leaf:?} not resident"))?;
        match self.visible(&keys, target).filter(|k| k.pos == target) {
            Some(k) => Ok(k.clone()),
            None => Ok(Bkey::new(self.btree, target, BkeyValue::Deleted)),
        }
    }

    /// Advance past the current cursor position and return the next
    /// visible key. Under `ALL_SNAPSHOTS` this steps to the very next
    /// `(inode, offset, snapshot)` triple so a second version at the
    /// same logical key is still reachable; otherwise it skips past
    /// the whole logical key the cursor sits on, since only one
    /// version of it can ever be returned.
    pub fn next(&mut self) -> Result<Option<Bkey>> {
        self.pos = if has(self.flags, flags::ALL_SNAPSHOTS) {
            Bpos::new(self.pos.inode, self.pos.offset, self.pos.snapshot.saturating_add(1))
        } else {
            bump_offset(self.pos)
        };
        self.peek()
    }

    pub fn advance(&mut self) -> Result<Option<Bkey>> {
        self.next()
    }

    /// Scan backward for the previous visible key.
    pub fn prev(&mut self) -> Result<Option<Bkey>> {
        let mut cursor = self.pos;
        loop {
            let leaf = self.leaf_for(cursor)?;
            let (min_key, _max_key) = self
                .leaf_bounds(&leaf)
                .ok_or_else(|| anyhow!("leaf {leaf:?} not resident"))?;
            let keys = self
                .store
                .cache
                .with_node(&leaf, |n| n.merged_keys())
                .ok_or_else(|| anyhow!("leaf {leaf:?} not resident"))?;

            if has(self.flags, flags::ALL_SNAPSHOTS) {
                let mut scan: Vec<Bpos> = keys.iter().map(|k| k.pos).filter(|p| *p < cursor).collect();
                scan.sort();
                for candidate_pos in scan.into_iter().rev() {
                    if let Some(found) = keys.iter().find(|k| k.pos == candidate_pos) {
                        if found.is_deleted() {
                            continue;
                        }
                        self.pos = found.pos;
                        return Ok(Some(found.clone()));
                    }
                }
            } else {
                let mut scan: Vec<Bpos> = keys
                    .iter()
                    .map(|k| k.pos)
                    .filter(|p| logical_before(*p, cursor))
                    .collect();
                scan.sort_by_key(|p| (p.inode, p.offset));
                scan.dedup_by_key(|p| (p.inode, p.offset));

                for candidate_pos in scan.into_iter().rev() {
                    if let Some(found) = self.visible(&keys, candidate_pos) {
                        if found.is_deleted() {
                            continue;
                        }
                        self.pos = found.pos;
                        return Ok(Some(found.clone()));
                    }
                }
            }

            if min_key <= Bpos::POS_MIN {
                return Ok(None);
            }
            cursor = min_key;
        }
    }

    /// Jump straight to the first key of the next leaf, skipping
    /// whatever remains unread in the current one (spec §4.D.3
    /// `next_node`, used by whole-tree scans that don't need
    /// per-key granularity).
    pub fn next_node(&mut self) -> Result<Option<NodeCacheKey>> {
        let leaf = self.leaf_for(self.pos)?;
        let (_min_key, max_key) = self
            .leaf_bounds(&leaf)
            .ok_or_else(|| anyhow!("leaf {leaf:?} not resident"))?;
        if max_key >= Bpos::spos_max() {
            return Ok(None);
        }
        self.pos = bump_offset(max_key);
        Some(self.leaf_for(self.pos)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::meta::MetaAllocator;
    use crate::btree::cache::NodeCache;
    use crate::device::{Device, DeviceGeometry};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir, nbuckets: u64) -> BtreeStore {
        let path = dir.path().join("dev0");
        let geometry = DeviceGeometry {
            block_size: 4096,
            bucket_size: 1 << 17,
            nbuckets,
        };
        let dev = Arc::new(Device::create(0, &path, geometry).unwrap());
        let meta = Arc::new(MetaAllocator::new(nbuckets));
        let cache = Arc::new(NodeCache::new(64));
        BtreeStore::new(vec![dev], vec![meta], cache, 1 << 16)
    }

    #[test]
    fn peek_finds_inserted_key_and_skips_deleted() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 64);
        let root = s.bootstrap_root(BtreeId::Extents).unwrap();
        let k = Bkey::new(BtreeId::Extents, Bpos::new(5, 0, 0), BkeyValue::Freespace);
        s.apply_leaf_update(BtreeId::Extents, root, &[], k, 1).unwrap();

        let mut it = BtreeIter::new(&s, BtreeId::Extents, Bpos::POS_MIN, flags::NONE);
        let found = it.peek().unwrap().unwrap();
        assert_eq!(found.pos, Bpos::new(5, 0, 0));
    }

    #[test]
    fn peek_slot_synthesises_a_deleted_key_for_a_hole() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 64);
        s.bootstrap_root(BtreeId::Extents).unwrap();
        let mut it = BtreeIter::new(&s, BtreeId::Extents, Bpos::new(9, 9, 0), flags::NONE);
        let slot = it.peek_slot().unwrap();
        assert!(slot.is_deleted());
        assert_eq!(slot.pos, Bpos::new(9, 9, 0));
    }

    #[test]
    fn filter_snapshots_picks_closest_visible_ancestor() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 64);
        let root = s.bootstrap_root(BtreeId::Extents).unwrap();
        let old = Bkey::new(BtreeId::Extents, Bpos::new(1, 0, 1), BkeyValue::Freespace);
        let new = Bkey::new(BtreeId::Extents, Bpos::new(1, 0, 5), BkeyValue::NeedDiscard);
        s.apply_leaf_update(BtreeId::Extents, root, &[], old, 1).unwrap();
        s.apply_leaf_update(BtreeId::Extents, s.root_key(BtreeId::Extents).unwrap(), &[], new, 2)
            .unwrap();

        let mut it = BtreeIter::new(
            &s,
            BtreeId::Extents,
            Bpos::new(1, 0, 3),
            flags::FILTER_SNAPSHOTS,
        );
        let found = it.peek().unwrap().unwrap();
        assert_eq!(found.pos.snapshot, 1, "snapshot 5 postdates the read horizon of 3");
    }

    #[test]
    fn all_snapshots_enumerates_every_version_in_order() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 64);
        let root = s.bootstrap_root(BtreeId::Extents).unwrap();
        let a = Bkey::new(BtreeId::Extents, Bpos::new(1, 0, 1), BkeyValue::Freespace);
        let b = Bkey::new(BtreeId::Extents, Bpos::new(1, 0, 5), BkeyValue::NeedDiscard);
        s.apply_leaf_update(BtreeId::Extents, root, &[], a, 1).unwrap();
        s.apply_leaf_update(BtreeId::Extents, s.root_key(BtreeId::Extents).unwrap(), &[], b, 2)
            .unwrap();

        let mut it = BtreeIter::new(&s, BtreeId::Extents, Bpos::POS_MIN, flags::ALL_SNAPSHOTS);
        let first = it.peek().unwrap().expect("first snapshot version");
        assert_eq!(first.pos, Bpos::new(1, 0, 1));
        let second = it.next().unwrap().expect("second snapshot version must still be reachable");
        assert_eq!(second.pos, Bpos::new(1, 0, 5));
        assert!(it.next().unwrap().is_none(), "no further keys after both versions");
    }
}
