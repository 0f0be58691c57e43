//! Paths (spec §4.D.2): a per-transaction cursor pinning the chain of
//! nodes from root to a target `bpos`, plus the total lock order that
//! makes the transaction engine deadlock-free.

use crate::bpos::Bpos;
use crate::btree::cache::{LockMode, NodeCacheKey};
use crate::btree_id::BtreeId;

/// Total order all paths in a transaction are sorted by:
/// `(btree_id, cached, bpos, -level)` (spec §4.D.2). Any lock acquired
/// out of this order must fail the transaction rather than block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockOrderKey {
    btree: BtreeId,
    cached: bool,
    pos: OrderedBpos,
    neg_level: i16,
}

/// `Bpos` doesn't need `Ord` for anything but this key, but deriving
/// through a tuple keeps `LockOrderKey`'s derive simple without
/// exposing ordering semantics on `Bpos` that callers might
/// accidentally rely on for something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderedBpos(u64, u64, u32);

impl From<Bpos> for OrderedBpos {
    fn from(p: Bpos) -> Self {
        OrderedBpos(p.inode, p.offset, p.snapshot)
    }
}

impl LockOrderKey {
    pub fn new(btree: BtreeId, cached: bool, pos: Bpos, level: u8) -> LockOrderKey {
        LockOrderKey {
            btree,
            cached,
            pos: pos.into(),
            neg_level: -(level as i16),
        }
    }
}

/// One level of a path: the node pinned at that level, where the
/// cursor sits within it, and the mode the path currently holds the
/// node's lock in.
#[derive(Debug, Clone)]
pub struct PathLevel {
    pub node_key: NodeCacheKey,
    pub in_node_index: usize,
    pub lock_mode: LockMode,
}

/// A per-transaction descriptor: `(btree_id, target bpos, cached?,
/// level, locks_want)` plus one `PathLevel` per level from the root
/// down to the target depth (spec §4.D.2).
#[derive(Debug, Clone)]
pub struct Path {
    pub btree: BtreeId,
    pub pos: Bpos,
    pub cached: bool,
    /// Depth the caller ultimately wants locked (0 = leaf only).
    pub locks_want: u8,
    pub levels: Vec<PathLevel>,
    /// Reference count: paths are shared by multiple iterators and
    /// only duplicated (copy-on-clone) the moment one aliasing user
    /// attempts a mutating move (spec §4.D.2).
    refs: usize,
}

impl Path {
    pub fn new(btree: BtreeId, pos: Bpos, cached: bool, locks_want: u8) -> Path {
        Path {
            btree,
            pos,
            cached,
            locks_want,
            levels: Vec::new(),
            refs: 1,
        }
    }

    pub fn lock_order_key_for_level(&self, level: u8) -> LockOrderKey {
        LockOrderKey::new(self.btree, self.cached, self.pos, level)
    }

    pub fn leaf_level(&self) -> Option<&PathLevel> {
        self.levels.last()
    }

    pub fn add_ref(&mut self) {
        self.refs += 1;
    }

    pub fn drop_ref(&mut self) -> usize {
        self.refs = self.refs.saturating_sub(1);
        self.refs
    }

    pub fn ref_count(&self) -> usize {
        self.refs
    }

    /// Copy-on-clone: an aliased path is duplicated the moment a
    /// mutating move is attempted, so the clone always starts with a
    /// fresh reference count of one and no shared state with the
    /// original beyond its position.
    pub fn fork(&self) -> Path {
        Path {
            btree: self.btree,
            pos: self.pos,
            cached: self.cached,
            locks_want: self.locks_want,
            levels: self.levels.clone(),
            refs: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_order_sorts_by_btree_then_pos_then_level_descending() {
        let a = LockOrderKey::new(BtreeId::Alloc, false, Bpos::new(0, 0, 0), 2);
        let b = LockOrderKey::new(BtreeId::Alloc, false, Bpos::new(0, 0, 0), 0);
        let c = LockOrderKey::new(BtreeId::Extents, false, Bpos::new(0, 0, 0), 0);
        assert!(a < b); // higher level sorts first (neg_level more negative)
        assert!(b < c);
    }

    #[test]
    fn fork_resets_ref_count() {
        let mut p = Path::new(BtreeId::Extents, Bpos::POS_MIN, false, 0);
        p.add_ref();
        assert_eq!(p.ref_count(), 2);
        let forked = p.fork();
        assert_eq!(forked.ref_count(), 1);
    }
}
