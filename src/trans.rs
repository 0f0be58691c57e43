//! The transaction engine (spec §4.E): stage bkey updates, then commit
//! them as a single atomic unit against the btree store and journal.
//!
//! The commit protocol follows spec §4.E exactly: sort staged updates
//! by total lock order, acquire locks ascending (restarting rather
//! than blocking on contention), run `trans_mark_alloc`-style triggers
//! to a fixed point, reserve journal space, apply in memory, release
//! the journal reservation, then unlock descending. Locking here is
//! modeled at leaf-node granularity rather than full per-level `Path`
//! locking (`btree::path::Path` exists but isn't threaded through
//! descent yet) — every update in this crate resolves to exactly one
//! leaf, so a leaf-level intent/write pair captures the same ordering
//! and restart behavior the spec describes without needing a second
//! locking discipline layered over `NodeCache`'s.

use std::collections::HashSet;

use crate::alloc::trees::mark_alloc;
use crate::bkey::{Bkey, BkeyValue};
use crate::bpos::Bpos;
use crate::btree::cache::NodeCacheKey;
use crate::btree::path::LockOrderKey;
use crate::btree::store::BtreeStore;
use crate::btree_id::BtreeId;
use crate::error::{FsError, RestartReason};
use crate::journal::reservation::Journal;

/// A staged write, not yet visible to any reader until `commit`
/// succeeds.
#[derive(Debug, Clone)]
struct PendingUpdate {
    btree: BtreeId,
    pos: Bpos,
    key: Bkey,
}

/// One in-flight transaction (spec §4.E). Borrows the store and
/// journal it will commit against; nothing it stages takes effect
/// until `commit` returns `Ok`.
pub struct Transaction<'a> {
    store: &'a BtreeStore,
    journal: &'a Journal,
    updates: Vec<PendingUpdate>,
}

impl<'a> Transaction<'a> {
    pub fn begin(store: &'a BtreeStore, journal: &'a Journal) -> Transaction<'a> {
        Transaction {
            store,
            journal,
            updates: Vec::new(),
        }
    }

    /// Stage a bkey write at `pos` in `btree`, coalescing with any
    /// earlier staged write at the same position (spec §4.E `update`:
    /// a transaction holds at most one pending value per key).
    pub fn update(&mut self, btree: BtreeId, pos: Bpos, key: Bkey) {
        if let Some(existing) = self
            .updates
            .iter_mut()
            .find(|u| u.btree == btree && u.pos == pos)
        {
            existing.key = key;
            return;
        }
        self.updates.push(PendingUpdate { btree, pos, key });
    }

    pub fn pending_len(&self) -> usize {
        self.updates.len()
    }

    fn lock_order(u: &PendingUpdate) -> LockOrderKey {
        LockOrderKey::new(u.btree, u.btree.uses_key_cache(), u.pos, 0)
    }

    fn sort_by_lock_order(&mut self) {
        self.updates.sort_by_key(Self::lock_order);
    }

    /// Run triggers to a fixed point (spec §4.E step 3): an `alloc`
    /// write may imply further writes to its secondary trees
    /// (`freespace`/`need_discard`/`lru`), which are themselves plain
    /// staged updates and never trigger anything further — so one pass
    /// over not-yet-processed `alloc` updates always reaches the fixed
    /// point, but `max_rounds` still bounds it defensively against a
    /// future trigger that feeds back on itself.
    fn run_triggers(&mut self, max_rounds: usize) -> Result<(), FsError> {
        let mut processed: HashSet<(u64, u64, u32)> = HashSet::new();

        for _ in 0..max_rounds {
            let due: Vec<(Bpos, crate::bucket::AllocV4)> = self
                .updates
                .iter()
                .filter(|u| u.btree == BtreeId::Alloc)
                .filter(|u| !processed.contains(&(u.pos.inode, u.pos.offset, u.pos.snapshot)))
                .filter_map(|u| match &u.key.value {
                    BkeyValue::Alloc(a) => Some((u.pos, *a)),
                    _ => None,
                })
                .collect();

            if due.is_empty() {
                return Ok(());
            }

            let mut derived = Vec::new();
            for (pos, new_alloc) in due {
                processed.insert((pos.inode, pos.offset, pos.snapshot));
                let old = self
                    .store
                    .read_cached(BtreeId::Alloc, pos)
                    .and_then(|k| match k.value {
                        BkeyValue::Alloc(a) => Some(a),
                        _ => None,
                    });
                for tu in mark_alloc(new_alloc.dev, new_alloc.bucket_nr, old.as_ref(), &new_alloc) {
                    // the alloc write itself is already staged; only the
                    // secondary-index side effects are new.
                    if tu.btree != BtreeId::Alloc {
                        derived.push((tu.btree, tu.key));
                    }
                }
            }
            for (btree, key) in derived {
                self.update(btree, key.pos, key);
            }
        }

        Err(FsError::Busy(RestartReason::TooManyIters))
    }

    /// Acquire intent, then upgrade to write, on every not-yet-locked
    /// leaf a pending update touches, in ascending lock order. Any
    /// failure means give up everything acquired so far and restart
    /// (spec §4.E step 2) — this crate never blocks waiting for a
    /// node lock mid-commit.
    fn lock_all(&self, locked: &mut Vec<NodeCacheKey>) -> Result<(), FsError> {
        for u in &self.updates {
            let leaf = self
                .store
                .leaf_for(u.btree, u.pos)
                .map_err(|e| FsError::Inconsistent(e.to_string()))?;
            if locked.contains(&leaf) {
                continue;
            }
            if !self.store.cache.try_lock_intent(&leaf) {
                return Err(FsError::Busy(RestartReason::WouldDeadlock));
            }
            if !self.store.cache.try_upgrade_to_write(&leaf) {
                self.store.cache.unlock_intent(&leaf);
                return Err(FsError::Busy(RestartReason::LockUpgradeFail));
            }
            locked.push(leaf);
        }
        Ok(())
    }

    /// Unlock everything acquired by `lock_all`, in reverse (descending
    /// lock order) as spec §4.E step 7 requires.
    fn unlock_all(&self, locked: &[NodeCacheKey]) {
        for key in locked.iter().rev() {
            self.store.cache.unlock_write(key);
        }
    }

    /// Run the full commit protocol. On success, returns the journal
    /// seq the commit landed at. On failure, every lock taken during
    /// this attempt has already been released and the caller should
    /// treat the returned `FsError::Busy` as "build a fresh
    /// transaction and retry" (spec §4.E: restarts never partially
    /// apply).
    pub fn commit(mut self, max_trigger_rounds: usize) -> Result<u64, FsError> {
        // Step 1: sort by total lock order.
        self.sort_by_lock_order();

        let mut locked = Vec::new();
        if let Err(e) = self.lock_all(&mut locked) {
            self.unlock_all(&locked);
            return Err(e);
        }

        // Step 3: triggers, which may stage further updates against
        // leaves not yet locked; re-sort and extend the lock set.
        if let Err(e) = self.run_triggers(max_trigger_rounds) {
            self.unlock_all(&locked);
            return Err(e);
        }
        self.sort_by_lock_order();
        if let Err(e) = self.lock_all(&mut locked) {
            self.unlock_all(&locked);
            return Err(e);
        }

        // Step 4: journal-reserve, sized by the encoded length of
        // every staged key plus a fixed per-entry overhead allowance.
        let size: usize = self
            .updates
            .iter()
            .map(|u| u.key.encode().len() + 16)
            .sum();
        let handle = match self.journal.reserve(size.max(1)) {
            Ok(h) => h,
            Err(e) => {
                self.unlock_all(&locked);
                return Err(e);
            }
        };
        let seq = handle.seq;

        // Step 5: apply in memory.
        for u in &self.updates {
            let (leaf, ancestors) = match self.store.path_to(u.btree, u.pos) {
                Ok(p) => p,
                Err(e) => {
                    self.unlock_all(&locked);
                    return Err(FsError::Inconsistent(e.to_string()));
                }
            };
            if let Err(e) =
                self.store
                    .apply_leaf_update(u.btree, leaf, &ancestors, u.key.clone(), seq)
            {
                self.unlock_all(&locked);
                return Err(FsError::Inconsistent(e.to_string()));
            }
        }

        // Step 6: journal-release.
        let journal_updates: Vec<(BtreeId, Bkey)> = self
            .updates
            .drain(..)
            .map(|u| (u.btree, u.key))
            .collect();
        self.journal.commit(&handle, journal_updates);
        self.journal.release(handle);

        // Step 7: unlock descending.
        self.unlock_all(&locked);
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::meta::MetaAllocator;
    use crate::bkey::BkeyValue;
    use crate::btree::cache::NodeCache;
    use crate::bucket::AllocV4;
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
    fn a_single_key_commit_is_readable_afterwards() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 64);
        s.bootstrap_root(BtreeId::Extents).unwrap();
        let journal = Journal::new(1 << 16);

        let mut tx = Transaction::begin(&s, &journal);
        let pos = Bpos::new(3, 0, 0);
        tx.update(
            BtreeId::Extents,
            pos,
            Bkey::new(BtreeId::Extents, pos, BkeyValue::Freespace),
        );
        let seq = tx.commit(8).unwrap();
        assert_eq!(seq, 1);

        let mut it = crate::btree::iter::BtreeIter::new(
            &s,
            BtreeId::Extents,
            Bpos::POS_MIN,
            crate::btree::iter::flags::NONE,
        );
        let found = it.peek().unwrap().unwrap();
        assert_eq!(found.pos, pos);
    }

    #[test]
    fn an_alloc_write_triggers_a_matching_freespace_entry() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 64);
        s.bootstrap_root(BtreeId::Alloc).unwrap();
        s.bootstrap_root(BtreeId::Freespace).unwrap();
        let journal = Journal::new(1 << 16);

        let mut tx = Transaction::begin(&s, &journal);
        let a = AllocV4::new_free(0, 9);
        let pos = Bpos::new(0, 9, 0);
        tx.update(BtreeId::Alloc, pos, Bkey::new(BtreeId::Alloc, pos, BkeyValue::Alloc(a)));
        tx.commit(8).unwrap();

        let mut it = crate::btree::iter::BtreeIter::new(
            &s,
            BtreeId::Freespace,
            Bpos::POS_MIN,
            crate::btree::iter::flags::NONE,
        );
        let found = it.peek().unwrap();
        assert!(found.is_some(), "alloc trigger should have inserted a freespace key");
    }

    #[test]
    fn a_full_journal_restarts_without_applying_anything() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 64);
        s.bootstrap_root(BtreeId::Extents).unwrap();
        let journal = Journal::new(4);

        let mut tx = Transaction::begin(&s, &journal);
        let pos = Bpos::new(1, 0, 0);
        tx.update(
            BtreeId::Extents,
            pos,
            Bkey::new(BtreeId::Extents, pos, BkeyValue::Freespace),
        );
        let err = tx.commit(8).unwrap_err();
        assert!(matches!(err, FsError::Busy(RestartReason::Memory)));

        let mut it = crate::btree::iter::BtreeIter::new(
            &s,
            BtreeId::Extents,
            Bpos::POS_MIN,
            crate::btree::iter::flags::NONE,
        );
        assert!(it.peek().unwrap().is_none());
    }
}
