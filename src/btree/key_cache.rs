//! Key cache (spec §4.D.5): a second, hash-indexed structure keyed by
//! `(btree_id, bpos)` holding the single "hot" value for trees that
//! opt in (`BtreeId::uses_key_cache`, currently only `alloc`). Reads
//! against an opted-in tree prefer this over walking the leaf node;
//! writes still go through the ordinary btree path but flush through
//! here afterwards, so the two never disagree about the latest value.
//!
//! This exists because the `alloc` leaf nodes are the hottest thing in
//! the filesystem — every allocation and every LRU/discard pass
//! touches one — and routing every read of a bucket's state through a
//! full node descent would serialize on exactly the contention this
//! cache is meant to relieve (spec §4.D.5).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::bkey::Bkey;
use crate::bpos::Bpos;
use crate::btree_id::BtreeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    btree: BtreeId,
    pos: (u64, u64, u32),
}

impl CacheKey {
    fn new(btree: BtreeId, pos: Bpos) -> CacheKey {
        CacheKey {
            btree,
            pos: (pos.inode, pos.offset, pos.snapshot),
        }
    }
}

/// Holds at most one value per `(btree_id, bpos)`. Only meaningful for
/// btrees where `BtreeId::uses_key_cache()` is true; callers are
/// expected to check that before consulting it, same as the original
/// gates key-cache lookups on the tree's `key_cache_fill` flag.
#[derive(Default)]
pub struct KeyCache {
    hot: Mutex<HashMap<CacheKey, Bkey>>,
}

impl KeyCache {
    pub fn new() -> KeyCache {
        KeyCache::default()
    }

    /// Consult the cache first (spec §4.D.5 "reads prefer the key
    /// cache if present").
    pub fn get(&self, btree: BtreeId, pos: Bpos) -> Option<Bkey> {
        self.hot.lock().unwrap().get(&CacheKey::new(btree, pos)).cloned()
    }

    /// Flush-through after a write lands in the btree proper (spec
    /// §4.D.5 "writes ... flush-through the key cache").
    pub fn flush(&self, btree: BtreeId, key: Bkey) {
        if !btree.uses_key_cache() {
            return;
        }
        self.hot
            .lock()
            .unwrap()
            .insert(CacheKey::new(btree, key.pos), key);
    }

    pub fn invalidate(&self, btree: BtreeId, pos: Bpos) {
        self.hot.lock().unwrap().remove(&CacheKey::new(btree, pos));
    }

    pub fn len(&self) -> usize {
        self.hot.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
