//! Ties `Device` I/O, the node cache, and per-tree root pointers
//! together into the thing a `Path`/iterator actually descends. This
//! is where split/merge/rewrite (spec §4.D.6) happen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::alloc::meta::MetaAllocator;
use crate::bkey::{Bkey, BkeyValue, BtreePtrV2};
use crate::bpos::Bpos;
use crate::btree::cache::{NodeCache, NodeCacheKey};
use crate::btree::key_cache::KeyCache;
use crate::btree::node::BtreeNode;
use crate::btree_id::BtreeId;
use crate::device::Device;
use crate::error::FsError;

/// Default target fill factor node splits aim for (spec §4.D.6: "a
/// split key that keeps both sides within a target fill factor").
const SPLIT_FILL_TARGET: f32 = 0.5;

pub struct BtreeStore {
    devices: Vec<Arc<Device>>,
    meta: Vec<Arc<MetaAllocator>>,
    pub cache: Arc<NodeCache>,
    /// Opt-in hot-value cache for `BtreeId::uses_key_cache()` trees
    /// (spec §4.D.5): currently just `alloc`.
    pub key_cache: KeyCache,
    roots: Mutex<HashMap<BtreeId, NodeCacheKey>>,
    locations: Mutex<HashMap<NodeCacheKey, (u8, u64)>>,
    next_seq: Mutex<u64>,
    node_capacity_bytes: usize,
}

impl BtreeStore {
    pub fn new(
        devices: Vec<Arc<Device>>,
        meta: Vec<Arc<MetaAllocator>>,
        cache: Arc<NodeCache>,
        node_capacity_bytes: usize,
    ) -> BtreeStore {
        BtreeStore {
            devices,
            meta,
            cache,
            key_cache: KeyCache::new(),
            roots: Mutex::new(HashMap::new()),
            locations: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(1),
            node_capacity_bytes,
        }
    }

    /// Point lookup preferring the key cache (spec §4.D.5) before
    /// falling back to a full leaf descent via `BtreeIter::peek_slot`.
    pub fn read_cached(&self, btree: BtreeId, pos: Bpos) -> Option<Bkey> {
        if btree.uses_key_cache() {
            if let Some(k) = self.key_cache.get(btree, pos) {
                return Some(k);
            }
        }
        None
    }

    fn next_seq(&self) -> u64 {
        let mut s = self.next_seq.lock().unwrap();
        let v = *s;
        *s += 1;
        v
    }

    fn pick_device(&self) -> u8 {
        0
    }

    pub fn root_key(&self, btree: BtreeId) -> Option<NodeCacheKey> {
        self.roots.lock().unwrap().get(&btree).copied()
    }

    pub fn root_ptr(&self, btree: BtreeId) -> Option<BtreePtrV2> {
        let roots = self.roots.lock().unwrap();
        let key = *roots.get(&btree)?;
        let locations = self.locations.lock().unwrap();
        let (dev, bucket_nr) = *locations.get(&key)?;
        Some(BtreePtrV2 {
            dev,
            bucket_nr,
            gen: 0,
            min_key: key.min_key,
            seq: key.seq,
            mem_ptr: None,
        })
    }

    pub fn bootstrap_root(&self, btree: BtreeId) -> Result<NodeCacheKey> {
        if let Some(k) = self.root_key(btree) {
            return Ok(k);
        }
        let node = BtreeNode::new_leaf(
            btree,
            Bpos::POS_MIN,
            Bpos::spos_max(),
            self.node_capacity_bytes,
        );
        let key = self.place_new_node(node)?;
        self.roots.lock().unwrap().insert(btree, key);
        Ok(key)
    }

    /// Restore a previously-written root pointer on mount (replaces
    /// bootstrap for an already-formatted fs).
    pub fn restore_root(&self, btree: BtreeId, ptr: &BtreePtrV2) -> Result<NodeCacheKey> {
        let key = self.fetch_node(btree, ptr)?;
        self.roots.lock().unwrap().insert(btree, key);
        Ok(key)
    }

    fn place_new_node(&self, mut node: BtreeNode) -> Result<NodeCacheKey> {
        let dev = self.pick_device();
        let meta = self
            .meta
            .get(dev as usize)
            .ok_or_else(|| anyhow!("no meta allocator for device {dev}"))?;
        let bucket_nr = meta.alloc_one()?;
        node.header.seq = self.next_seq();
        let key = NodeCacheKey {
            btree: node.header.btree,
            level: node.header.level,
            min_key: node.header.min_key,
            seq: node.header.seq,
        };
        let bytes = node.encode();
        self.devices[dev as usize].write_at(bucket_nr, 0, &bytes, true)?;
        self.locations.lock().unwrap().insert(key, (dev, bucket_nr));
        self.cache.insert(key, node);
        Ok(key)
    }

    /// Persist the node already in the cache under `key` back to its
    /// bucket. Call after applying updates in memory (spec §4.E step
    /// 5-6) once the journal entry covering them is durable.
    pub fn writeback(&self, key: &NodeCacheKey) -> Result<()> {
        let (dev, bucket_nr) = *self
            .locations
            .lock()
            .unwrap()
            .get(key)
            .ok_or_else(|| anyhow!("no location for node {key:?}"))?;
        let bytes = self
            .cache
            .with_node(key, |n| n.encode())
            .ok_or_else(|| anyhow!("node {key:?} not resident"))?;
        self.devices[dev as usize].write_at(bucket_nr, 0, &bytes, true)?;
        self.cache.clear_pin(key);
        Ok(())
    }

    /// Resolve a child pointer to a cache key, reading the node from
    /// disk on a cache miss (spec §4.D.4).
    pub fn fetch_node(&self, btree: BtreeId, ptr: &BtreePtrV2) -> Result<NodeCacheKey> {
        if let Some(mem) = ptr.mem_ptr {
            if let Some(key) = self.cache.arena_lookup(mem) {
                if self.cache.contains(&key) {
                    return Ok(key);
                }
            }
        }
        let dev = ptr.dev;
        let device = self
            .devices
            .get(dev as usize)
            .ok_or_else(|| anyhow!("no device {dev}"))?;
        let bytes = device.read_at(ptr.bucket_nr, 0, device.bucket_bytes() as usize)?;
        let node = BtreeNode::decode(&bytes, self.node_capacity_bytes).map_err(|e| {
            log::warn!("checksum/decode failure reading node at dev {dev} bucket {}: {e}", ptr.bucket_nr);
            anyhow::Error::new(e)
        })?;
        if node.header.btree != btree {
            return Err(FsError::Inconsistent(format!(
                "expected {btree:?} node, found {:?}",
                node.header.btree
            ))
            .into());
        }
        let key = NodeCacheKey {
            btree: node.header.btree,
            level: node.header.level,
            min_key: node.header.min_key,
            seq: node.header.seq,
        };
        self.locations
            .lock()
            .unwrap()
            .insert(key, (dev, ptr.bucket_nr));
        self.cache.insert(key, node);
        Ok(key)
    }

    pub fn location_of(&self, key: &NodeCacheKey) -> Option<(u8, u64)> {
        self.locations.lock().unwrap().get(key).copied()
    }

    /// Descend from `btree`'s root to the leaf that would contain
    /// `pos` (spec §4.D.4), returning the leaf plus every interior
    /// node visited along the way in root-to-parent order — exactly
    /// what a `Path`'s `levels` holds below the root (spec §4.D.2).
    /// Shared by [`crate::btree::iter::BtreeIter`]'s cursor movement
    /// and by [`crate::trans::Transaction`]'s commit protocol, which
    /// both need the same descent but for different reasons (reading
    /// vs. knowing which ancestors a split must update).
    pub fn path_to(&self, btree: BtreeId, pos: Bpos) -> Result<(NodeCacheKey, Vec<NodeCacheKey>)> {
        let mut key = self
            .root_key(btree)
            .ok_or_else(|| anyhow!("{:?} has no root yet", btree))?;
        let mut ancestors = Vec::new();
        loop {
            let level = self
                .cache
                .with_node(&key, |n| n.header.level)
                .ok_or_else(|| anyhow!("node {key:?} not resident"))?;
            if level == 0 {
                return Ok((key, ancestors));
            }
            let children = self
                .cache
                .with_node(&key, |n| n.merged_keys())
                .ok_or_else(|| anyhow!("node {key:?} not resident"))?;
            let child_ptr = children
                .iter()
                .filter(|k| k.pos <= pos)
                .max_by_key(|k| k.pos)
                .or_else(|| children.first())
                .and_then(|k| match &k.value {
                    BkeyValue::BtreePtrV2(p) => Some(p.clone()),
                    _ => None,
                })
                .ok_or_else(|| anyhow!("interior node {key:?} has no child pointers"))?;
            ancestors.push(key);
            key = self.fetch_node(btree, &child_ptr)?;
        }
    }

    pub fn leaf_for(&self, btree: BtreeId, pos: Bpos) -> Result<NodeCacheKey> {
        Ok(self.path_to(btree, pos)?.0)
    }

    /// Apply one bkey to the leaf identified by `key`, splitting it
    /// (and recursively its ancestors) if the insert would overflow
    /// the node's capacity (spec §4.D.6, §4.E step 5).
    ///
    /// `ancestors` is the chain of interior `NodeCacheKey`s from the
    /// root down to (but excluding) `key`, youngest first — exactly
    /// what a `Path`'s `levels` holds. On a split this updates each
    /// ancestor's child pointer(s) in place (still copy-on-write at
    /// the node level: the ancestor's *bset* gets a new entry, the
    /// node itself is never overwritten in place) and recurses upward
    /// if an ancestor itself overflows.
    pub fn apply_leaf_update(
        &self,
        btree: BtreeId,
        key: NodeCacheKey,
        ancestors: &[NodeCacheKey],
        new_key: Bkey,
        journal_seq: u64,
    ) -> Result<()> {
        let overflow = self
            .cache
            .with_node(&key, |n| n.would_overflow(&new_key))
            .ok_or_else(|| anyhow!("node {key:?} not resident"))?;

        if !overflow {
            self.key_cache.flush(btree, new_key.clone());
            self.cache
                .with_node_mut(&key, |n| n.apply(new_key, journal_seq))
                .ok_or_else(|| anyhow!("node {key:?} not resident"))?;
            self.cache.mark_dirty(&key, journal_seq);
            return Ok(());
        }

        self.key_cache.flush(btree, new_key.clone());
        self.split_and_insert(btree, key, ancestors, new_key, journal_seq)
    }

    fn split_and_insert(
        &self,
        btree: BtreeId,
        key: NodeCacheKey,
        ancestors: &[NodeCacheKey],
        new_key: Bkey,
        journal_seq: u64,
    ) -> Result<()> {
        let (old_min, old_max, level, mut keys) = self
            .cache
            .with_node(&key, |n| {
                (
                    n.header.min_key,
                    n.header.max_key,
                    n.header.level,
                    n.merged_keys(),
                )
            })
            .ok_or_else(|| anyhow!("node {key:?} not resident"))?;

        match keys.binary_search_by(|k| k.pos.cmp(&new_key.pos)) {
            Ok(idx) => keys[idx] = new_key,
            Err(idx) => keys.insert(idx, new_key),
        }

        let split_at = ((keys.len() as f32) * SPLIT_FILL_TARGET) as usize;
        let split_at = split_at.clamp(1, keys.len().saturating_sub(1).max(1));
        let (left_keys, right_keys) = keys.split_at(split_at);
        let split_pos = right_keys
            .first()
            .map(|k| k.pos)
            .unwrap_or(old_max);

        let mut left = BtreeNode::new_interior(btree, level, old_min, split_pos, self.node_capacity_bytes);
        for k in left_keys {
            left.apply(k.clone(), journal_seq);
        }
        let mut right = BtreeNode::new_interior(btree, level, split_pos, old_max, self.node_capacity_bytes);
        for k in right_keys {
            right.apply(k.clone(), journal_seq);
        }

        let left_key = self.place_new_node(left)?;
        let right_key = self.place_new_node(right)?;
        self.retire_node(&key);

        log::debug!(
            "split {btree:?} node at {old_min}..{old_max} into {left_key:?} and {right_key:?}"
        );

        let left_loc = self.location_of(&left_key).unwrap();
        let right_loc = self.location_of(&right_key).unwrap();
        let left_ptr = Bkey::new(
            btree,
            left_key.min_key,
            BkeyValue::BtreePtrV2(BtreePtrV2 {
                dev: left_loc.0,
                bucket_nr: left_loc.1,
                gen: 0,
                min_key: left_key.min_key,
                seq: left_key.seq,
                mem_ptr: Some(self.cache.arena_register(left_key)),
            }),
        );
        let right_ptr = Bkey::new(
            btree,
            right_key.min_key,
            BkeyValue::BtreePtrV2(BtreePtrV2 {
                dev: right_loc.0,
                bucket_nr: right_loc.1,
                gen: 0,
                min_key: right_key.min_key,
                seq: right_key.seq,
                mem_ptr: Some(self.cache.arena_register(right_key)),
            }),
        );

        match ancestors.last() {
            None => {
                // Splitting the root: build a new, taller root whose
                // two children are left/right (spec §4.D.6 step 3).
                let mut new_root = BtreeNode::new_interior(
                    btree,
                    level + 1,
                    old_min,
                    old_max,
                    self.node_capacity_bytes,
                );
                new_root.apply(left_ptr, journal_seq);
                new_root.apply(right_ptr, journal_seq);
                let root_key = self.place_new_node(new_root)?;
                self.roots.lock().unwrap().insert(btree, root_key);
                Ok(())
            }
            Some(parent_key) => {
                let parent_ancestors = &ancestors[..ancestors.len() - 1];
                self.apply_leaf_update(btree, *parent_key, parent_ancestors, left_ptr, journal_seq)?;
                self.apply_leaf_update(btree, *parent_key, parent_ancestors, right_ptr, journal_seq)
            }
        }
    }

    /// Mark a node garbage once its replacement is in place. Real
    /// reclamation waits for the journal sequence covering the commit
    /// to flush and for no in-flight iterator to reference it (spec
    /// §3 "Btree node" lifecycle); here we release its bucket back to
    /// the meta allocator immediately since this crate doesn't model
    /// long-lived background readers racing a retire.
    fn retire_node(&self, key: &NodeCacheKey) {
        if let Some((dev, bucket_nr)) = self.locations.lock().unwrap().remove(key) {
            if let Some(meta) = self.meta.get(dev as usize) {
                meta.free_one(bucket_nr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::BkeyValue;
    use tempfile::tempdir;

    fn store(nbuckets: u64) -> (BtreeStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let geometry = crate::device::DeviceGeometry {
            block_size: 4096,
            bucket_size: 1 << 16,
            nbuckets,
        };
        let dev = Arc::new(Device::create(0, &path, geometry).unwrap());
        let meta = Arc::new(MetaAllocator::new(nbuckets));
        let cache = Arc::new(NodeCache::new(64));
        (BtreeStore::new(vec![dev], vec![meta], cache, 1 << 12), dir)
    }

    #[test]
    fn bootstrap_creates_a_leaf_root() {
        let (s, _d) = store(64);
        let key = s.bootstrap_root(BtreeId::Extents).unwrap();
        assert_eq!(key.level, 0);
    }

    #[test]
    fn insert_without_overflow_stays_single_node() {
        let (s, _d) = store(64);
        let key = s.bootstrap_root(BtreeId::Extents).unwrap();
        let k = Bkey::new(BtreeId::Extents, Bpos::new(1, 0, 0), BkeyValue::Freespace);
        s.apply_leaf_update(BtreeId::Extents, key, &[], k, 1).unwrap();
        let found = s.cache.with_node(&key, |n| n.find(&Bpos::new(1, 0, 0))).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn overflow_triggers_split_and_new_root() {
        let (s, _d) = store(64);
        let key = s.bootstrap_root(BtreeId::Extents).unwrap();
        // tiny capacity node forces an overflow after a couple of inserts
        s.cache.with_node_mut(&key, |n| n.capacity_bytes = 64);
        for i in 0..20u64 {
            let k = Bkey::new(
                BtreeId::Extents,
                Bpos::new(i, 0, 0),
                BkeyValue::Opaque {
                    tag: 1,
                    bytes: vec![0u8; 8],
                },
            );
            s.apply_leaf_update(BtreeId::Extents, s.root_key(BtreeId::Extents).unwrap(), &[], k, i + 1)
                .unwrap();
        }
        let root = s.root_key(BtreeId::Extents).unwrap();
        assert!(root.level >= 1, "root should have grown after repeated splits");
    }
}
