//! Node cache and six-mode lock (spec §4.D.1, §9 design notes).
//!
//! The six-mode lock is specified as "a small state machine over a
//! mutex + condvar" in §9 — implemented here directly that way rather
//! than with a borrowed crate, since nothing in the retrieved corpus
//! supplies one and the upgrade/downgrade rules are exact enough that
//! a generic RwLock wouldn't capture them (intent excludes other
//! intent/write holders but allows any number of readers).

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::bpos::Bpos;
use crate::btree::node::BtreeNode;
use crate::btree_id::BtreeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Read,
    Intent,
    Write,
}

#[derive(Default)]
struct LockState {
    readers: u32,
    intent_held: bool,
    write_held: bool,
}

impl LockState {
    fn can_grant(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.write_held,
            LockMode::Intent => !self.intent_held && !self.write_held,
            LockMode::Write => self.readers == 0 && !self.intent_held && !self.write_held,
        }
    }
}

/// Six modes collapse to three lock kinds crossed with "is this the
/// lock's own identity or an upgrade of a held one" — read < intent <
/// write, many readers OR one intent OR one writer (spec §4.D.1, §9).
pub struct NodeLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Default for NodeLock {
    fn default() -> Self {
        NodeLock {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }
}

impl NodeLock {
    pub fn lock_read(&self) {
        let mut s = self.state.lock().unwrap();
        while !s.can_grant(LockMode::Read) {
            s = self.cond.wait(s).unwrap();
        }
        s.readers += 1;
    }

    pub fn unlock_read(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.readers > 0);
        s.readers -= 1;
        self.cond.notify_all();
    }

    pub fn lock_intent(&self) {
        let mut s = self.state.lock().unwrap();
        while !s.can_grant(LockMode::Intent) {
            s = self.cond.wait(s).unwrap();
        }
        s.intent_held = true;
    }

    pub fn unlock_intent(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.intent_held);
        s.intent_held = false;
        self.cond.notify_all();
    }

    /// Non-blocking `lock_intent`: used by the transaction commit path
    /// (spec §4.E step 2), which restarts rather than waits when a
    /// lock in the sorted order isn't immediately available.
    pub fn try_lock_intent(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.can_grant(LockMode::Intent) {
            s.intent_held = true;
            true
        } else {
            false
        }
    }

    /// Upgrade an already-held intent lock to write. Per §4.D.2/§4.E
    /// step 2: if this would block while the caller holds read locks
    /// on paths later in the ordering, the caller must give up and
    /// restart rather than wait — so this is a non-blocking
    /// try-upgrade, mirroring `six_lock_tryupgrade` in
    /// `btree_iter.c`.
    pub fn try_upgrade_to_write(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.intent_held);
        if s.readers == 0 {
            s.write_held = true;
            true
        } else {
            false
        }
    }

    pub fn downgrade_write_to_intent(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.write_held);
        s.write_held = false;
        s.intent_held = true;
        self.cond.notify_all();
    }

    pub fn unlock_write(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.write_held);
        s.write_held = false;
        self.cond.notify_all();
    }
}

/// Identifies one cached node (spec §4.D.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeCacheKey {
    pub btree: BtreeId,
    pub level: u8,
    pub min_key: Bpos,
    pub seq: u64,
}

pub struct CachedNode {
    pub node: BtreeNode,
    pub lock: NodeLock,
    pub dirty: bool,
    pub accessed: bool,
    pub read_in_flight: bool,
    pub write_in_flight: bool,
    /// Highest journal seq this node has contributed keys from but not
    /// yet been written out for (spec §4.B "Pinning").
    pub journal_pin: u64,
    /// Clock-eviction "last touched" tick.
    pub clock: u64,
}

/// Fixed-capacity cache keyed by `(btree_id, level, min_key, seq)`
/// (spec §4.D.1). Eviction is clock-based and refuses nodes that are
/// dirty, locked, or journal-pinned.
pub struct NodeCache {
    capacity: usize,
    nodes: Mutex<HashMap<NodeCacheKey, CachedNode>>,
    arena: Mutex<HashMap<u64, NodeCacheKey>>,
    next_arena_id: Mutex<u64>,
    clock: Mutex<u64>,
    /// Global mutex serialising cannibalise-under-pressure contention
    /// (spec §4.D.1 "single global mutex").
    cannibalise: Mutex<()>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> NodeCache {
        NodeCache {
            capacity,
            nodes: Mutex::new(HashMap::new()),
            arena: Mutex::new(HashMap::new()),
            next_arena_id: Mutex::new(1),
            clock: Mutex::new(0),
            cannibalise: Mutex::new(()),
        }
    }

    fn tick(&self) -> u64 {
        let mut c = self.clock.lock().unwrap();
        *c += 1;
        *c
    }

    /// Register a resolved node under an arena index, the "arena +
    /// weak index" replacement (§9) for the original's pointer-chased
    /// parent links: callers hold onto the returned `u64` as a cache
    /// hint (`BtreePtrV2::mem_ptr`) instead of a raw node pointer.
    pub fn arena_register(&self, key: NodeCacheKey) -> u64 {
        let mut next = self.next_arena_id.lock().unwrap();
        let id = *next;
        *next += 1;
        self.arena.lock().unwrap().insert(id, key);
        id
    }

    pub fn arena_lookup(&self, id: u64) -> Option<NodeCacheKey> {
        self.arena.lock().unwrap().get(&id).copied()
    }

    pub fn contains(&self, key: &NodeCacheKey) -> bool {
        self.nodes.lock().unwrap().contains_key(key)
    }

    /// Insert a freshly-read-or-built node, evicting if at capacity.
    pub fn insert(&self, key: NodeCacheKey, node: BtreeNode) {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.len() >= self.capacity && !nodes.contains_key(&key) {
            self.evict_one(&mut nodes);
        }
        let tick = self.tick();
        nodes.insert(
            key,
            CachedNode {
                node,
                lock: NodeLock::default(),
                dirty: false,
                accessed: true,
                read_in_flight: false,
                write_in_flight: false,
                journal_pin: 0,
                clock: tick,
            },
        );
    }

    fn evict_one(&self, nodes: &mut HashMap<NodeCacheKey, CachedNode>) {
        let _guard = self.cannibalise.lock().unwrap();
        let victim = nodes
            .iter()
            .filter(|(_, c)| {
                !c.dirty && !c.read_in_flight && !c.write_in_flight && c.journal_pin == 0
            })
            .min_by_key(|(_, c)| c.clock)
            .map(|(k, _)| *k);
        if let Some(k) = victim {
            nodes.remove(&k);
        }
        // If nothing is evictable the cache temporarily exceeds
        // capacity rather than evicting a dirty/locked/pinned node;
        // the next write-back + unpin pass will shrink it back down.
    }

    pub fn mark_dirty(&self, key: &NodeCacheKey, journal_seq: u64) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(c) = nodes.get_mut(key) {
            c.dirty = true;
            c.journal_pin = c.journal_pin.max(journal_seq);
        }
    }

    /// Release the journal pin once the node has been durably written
    /// (spec §4.B "Pinning": "on node write, it releases the pin").
    pub fn clear_pin(&self, key: &NodeCacheKey) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(c) = nodes.get_mut(key) {
            c.journal_pin = 0;
            c.dirty = false;
        }
    }

    pub fn with_node<R>(&self, key: &NodeCacheKey, f: impl FnOnce(&BtreeNode) -> R) -> Option<R> {
        let mut nodes = self.nodes.lock().unwrap();
        let tick = {
            let mut c = self.clock.lock().unwrap();
            *c += 1;
            *c
        };
        nodes.get_mut(key).map(|c| {
            c.clock = tick;
            c.accessed = true;
            f(&c.node)
        })
    }

    pub fn with_node_mut<R>(
        &self,
        key: &NodeCacheKey,
        f: impl FnOnce(&mut BtreeNode) -> R,
    ) -> Option<R> {
        let mut nodes = self.nodes.lock().unwrap();
        let tick = {
            let mut c = self.clock.lock().unwrap();
            *c += 1;
            *c
        };
        nodes.get_mut(key).map(|c| {
            c.clock = tick;
            c.accessed = true;
            f(&mut c.node)
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    /// Non-blocking intent lock on a resident node, by key (spec §4.E
    /// step 2). Returns `false` both when the lock is unavailable and
    /// when the node isn't cache-resident — either way the caller
    /// can't proceed without blocking and should restart.
    pub fn try_lock_intent(&self, key: &NodeCacheKey) -> bool {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(key).map(|c| c.lock.try_lock_intent()).unwrap_or(false)
    }

    pub fn try_upgrade_to_write(&self, key: &NodeCacheKey) -> bool {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(key)
            .map(|c| c.lock.try_upgrade_to_write())
            .unwrap_or(false)
    }

    pub fn unlock_intent(&self, key: &NodeCacheKey) {
        let nodes = self.nodes.lock().unwrap();
        if let Some(c) = nodes.get(key) {
            c.lock.unlock_intent();
        }
    }

    pub fn unlock_write(&self, key: &NodeCacheKey) {
        let nodes = self.nodes.lock().unwrap();
        if let Some(c) = nodes.get(key) {
            c.lock.unlock_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpos::Bpos;

    fn k(seq: u64) -> NodeCacheKey {
        NodeCacheKey {
            btree: BtreeId::Extents,
            level: 0,
            min_key: Bpos::POS_MIN,
            seq,
        }
    }

    #[test]
    fn read_locks_can_stack() {
        let lock = NodeLock::default();
        lock.lock_read();
        lock.lock_read();
        lock.unlock_read();
        lock.unlock_read();
    }

    #[test]
    fn intent_excludes_second_intent() {
        let lock = NodeLock::default();
        lock.lock_intent();
        assert!(!lock.try_lock_intent());
        lock.unlock_intent();
    }

    #[test]
    fn upgrade_succeeds_with_no_readers() {
        let lock = NodeLock::default();
        lock.lock_intent();
        assert!(lock.try_upgrade_to_write());
        lock.unlock_write();
    }

    #[test]
    fn upgrade_fails_with_outstanding_reader() {
        let lock = NodeLock::default();
        lock.lock_read();
        lock.lock_intent();
        assert!(!lock.try_upgrade_to_write());
        lock.unlock_intent();
        lock.unlock_read();
    }

    #[test]
    fn eviction_refuses_dirty_nodes() {
        let cache = NodeCache::new(1);
        let node = BtreeNode::new_leaf(BtreeId::Extents, Bpos::POS_MIN, Bpos::spos_max(), 4096);
        cache.insert(k(1), node.clone());
        cache.mark_dirty(&k(1), 5);
        cache.insert(k(2), node);
        // the dirty node must still be present; nothing was evictable
        assert!(cache.contains(&k(1)));
    }

    #[test]
    fn arena_round_trips_a_cache_key() {
        let cache = NodeCache::new(4);
        let key = k(9);
        let id = cache.arena_register(key);
        assert_eq!(cache.arena_lookup(id), Some(key));
    }
}
