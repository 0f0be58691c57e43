//! On-disk/in-memory btree node (spec §3 "Btree node", §6 "On-disk
//! btree node"). Grounded on the teacher's `btrfs_header`/leaf-node
//! layout (`structures.rs`, `btrfs_node.rs`) — a fixed header followed
//! by a sequence of records — generalized to bcachefs's "node is the
//! logical merge of its bsets" model.

use crate::bkey::Bkey;
use crate::bpos::Bpos;
use crate::btree_id::BtreeId;
use crate::error::FsError;
use crate::codec::{put_bytes, put_u32, put_u64, put_u8, Reader};
use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn csum(bytes: &[u8]) -> u32 {
    CASTAGNOLI.checksum(bytes)
}

/// An independently-checksummed, independently-encrypted, sorted batch
/// of bkeys appended to a node at one point in time (spec §3 "Btree
/// node"). A node's logical contents is the sorted merge of its bsets.
#[derive(Debug, Clone)]
pub struct Bset {
    pub seq: u64,
    pub journal_seq: u64,
    /// Sorted by `Bkey::pos`. Kept sorted at construction time by
    /// `Bset::new`/`push_sorted`, the way the teacher's leaf-node
    /// iterator assumes on-disk items are already ordered.
    keys: Vec<Bkey>,
}

impl Bset {
    pub fn empty(seq: u64, journal_seq: u64) -> Bset {
        Bset {
            seq,
            journal_seq,
            keys: Vec::new(),
        }
    }

    pub fn keys(&self) -> &[Bkey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Insert or replace a key, keeping `keys` sorted by position. This
    /// is the in-memory "append to the active bset" step of the
    /// commit protocol (spec §4.E step 5) — logically an append, but
    /// keeping the vector sorted makes every other operation (merge,
    /// split, lookup) a straightforward scan/binary-search instead of
    /// a separate sort pass per read.
    pub fn upsert(&mut self, key: Bkey) {
        match self.keys.binary_search_by(|k| k.pos.cmp(&key.pos)) {
            Ok(idx) => self.keys[idx] = key,
            Err(idx) => self.keys.insert(idx, key),
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.keys.iter().map(|k| k.encode().len() + 4).sum::<usize>() + 24
    }

    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_u64(&mut body, self.seq);
        put_u64(&mut body, self.journal_seq);
        put_u32(&mut body, self.keys.len() as u32);
        for k in &self.keys {
            let enc = k.encode();
            put_u32(&mut body, enc.len() as u32);
            put_bytes(&mut body, &enc);
        }
        let mut out = Vec::with_capacity(body.len() + 4);
        put_u32(&mut out, csum(&body));
        put_bytes(&mut out, &body);
        out
    }

    fn decode(btree: BtreeId, bytes: &[u8]) -> Result<(Bset, usize), FsError> {
        let mut outer = Reader::new(bytes);
        let stored_csum = outer.get_u32()?;
        // We don't know the body length up front; re-derive it below
        // after parsing so we can verify the checksum over exactly the
        // bytes the writer checksummed.
        let body_start = outer.position();
        let mut r = Reader::new(&bytes[body_start..]);
        let seq = r.get_u64()?;
        let journal_seq = r.get_u64()?;
        let nkeys = r.get_u32()?;
        let mut keys = Vec::with_capacity(nkeys as usize);
        for _ in 0..nkeys {
            let len = r.get_u32()? as usize;
            let kbytes = r.get_bytes(len)?;
            keys.push(Bkey::decode(btree, kbytes)?);
        }
        let body_len = r.position();
        let body = &bytes[body_start..body_start + body_len];
        if csum(body) != stored_csum {
            return Err(FsError::Checksum {
                what: "bset",
                at: seq,
            });
        }
        Ok((
            Bset {
                seq,
                journal_seq,
                keys,
            },
            4 + body_len,
        ))
    }
}

/// Header common to every node (spec §6 "On-disk btree node").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHeader {
    pub btree: BtreeId,
    pub level: u8,
    pub min_key: Bpos,
    pub max_key: Bpos,
    /// Sequence number of the node itself (bumped on every rewrite);
    /// bsets whose own `seq` differs delimit a trailing, not-yet-
    /// flushed region on read (spec §6).
    pub seq: u64,
}

/// A cached, decoded btree node: header plus the (possibly several)
/// bsets appended to it over time. Splits/merges/rewrites always
/// produce a brand new node (copy-on-write, spec §4.D.6) — nothing
/// here is ever overwritten in place except by appending a new bset.
#[derive(Debug, Clone)]
pub struct BtreeNode {
    pub header: NodeHeader,
    bsets: Vec<Bset>,
    /// Budget in bytes; a pending insert that would overflow this
    /// triggers a split (spec §4.D.6).
    pub capacity_bytes: usize,
}

impl BtreeNode {
    pub fn new_leaf(btree: BtreeId, min_key: Bpos, max_key: Bpos, capacity_bytes: usize) -> BtreeNode {
        BtreeNode {
            header: NodeHeader {
                btree,
                level: 0,
                min_key,
                max_key,
                seq: 0,
            },
            bsets: vec![Bset::empty(0, 0)],
            capacity_bytes,
        }
    }

    pub fn new_interior(
        btree: BtreeId,
        level: u8,
        min_key: Bpos,
        max_key: Bpos,
        capacity_bytes: usize,
    ) -> BtreeNode {
        let mut n = BtreeNode::new_leaf(btree, min_key, max_key, capacity_bytes);
        n.header.level = level;
        n
    }

    pub fn is_leaf(&self) -> bool {
        self.header.level == 0
    }

    /// Logical merge of all bsets: the most recently appended value
    /// for a given position wins (spec §3: "node is the logical merge
    /// of its bsets").
    pub fn merged_keys(&self) -> Vec<Bkey> {
        use std::collections::BTreeMap;
        let mut merged: BTreeMap<Bpos, (u64, Bkey)> = BTreeMap::new();
        for bset in &self.bsets {
            for k in bset.keys() {
                let entry = merged.entry(k.pos).or_insert((0, k.clone()));
                if bset.seq >= entry.0 {
                    *entry = (bset.seq, k.clone());
                }
            }
        }
        merged.into_values().map(|(_, k)| k).collect()
    }

    pub fn find(&self, pos: &Bpos) -> Option<Bkey> {
        self.merged_keys().into_iter().find(|k| &k.pos == pos)
    }

    /// Append a key to the active (last) bset, matching spec §4.E step
    /// 5: "append each bkey to the target node's active bset".
    pub fn apply(&mut self, key: Bkey, journal_seq: u64) {
        let active = self.bsets.last_mut().expect("node always has >=1 bset");
        if active.journal_seq == 0 && active.is_empty() {
            active.journal_seq = journal_seq;
        }
        active.upsert(key);
    }

    /// Start a fresh bset on top of the existing ones (a later write
    /// batch layered on an earlier one, spec §3 "Btree node").
    pub fn seal_and_start_new_bset(&mut self, next_seq: u64) {
        self.bsets.push(Bset::empty(next_seq, 0));
    }

    pub fn total_encoded_len(&self) -> usize {
        self.bsets.iter().map(|b| b.encoded_len()).sum()
    }

    pub fn would_overflow(&self, extra: &Bkey) -> bool {
        self.total_encoded_len() + extra.encode().len() + 4 > self.capacity_bytes
    }

    pub fn bump_seq(&mut self) {
        self.header.seq += 1;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u8(&mut buf, self.header.btree as u8);
        put_u8(&mut buf, self.header.level);
        put_u64(&mut buf, self.header.min_key.inode);
        put_u64(&mut buf, self.header.min_key.offset);
        put_u32(&mut buf, self.header.min_key.snapshot);
        put_u64(&mut buf, self.header.max_key.inode);
        put_u64(&mut buf, self.header.max_key.offset);
        put_u32(&mut buf, self.header.max_key.snapshot);
        put_u64(&mut buf, self.header.seq);
        put_u32(&mut buf, self.bsets.len() as u32);
        for bset in &self.bsets {
            put_bytes(&mut buf, &bset.encode());
        }
        buf
    }

    pub fn decode(bytes: &[u8], capacity_bytes: usize) -> Result<BtreeNode, FsError> {
        let mut r = Reader::new(bytes);
        let btree_raw = r.get_u8()?;
        let btree = *BtreeId::ALL
            .iter()
            .find(|b| **b as u8 == btree_raw)
            .ok_or_else(|| FsError::Invalid(format!("unknown btree id {btree_raw}")))?;
        let level = r.get_u8()?;
        let min_key = Bpos::new(r.get_u64()?, r.get_u64()?, r.get_u32()?);
        let max_key = Bpos::new(r.get_u64()?, r.get_u64()?, r.get_u32()?);
        let seq = r.get_u64()?;
        let nbsets = r.get_u32()?;

        let mut rest_start = r.position();
        let mut bsets = Vec::with_capacity(nbsets as usize);
        for _ in 0..nbsets {
            let (bset, consumed) = Bset::decode(btree, &bytes[rest_start..])?;
            bsets.push(bset);
            rest_start += consumed;
        }

        Ok(BtreeNode {
            header: NodeHeader {
                btree,
                level,
                min_key,
                max_key,
                seq,
            },
            bsets,
            capacity_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::BkeyValue;

    fn key(inode: u64, off: u64) -> Bkey {
        Bkey::new(BtreeId::Extents, Bpos::new(inode, off, 0), BkeyValue::Freespace)
    }

    #[test]
    fn apply_then_encode_decode_round_trips() {
        let mut node = BtreeNode::new_leaf(
            BtreeId::Extents,
            Bpos::POS_MIN,
            Bpos::spos_max(),
            1 << 16,
        );
        node.apply(key(1, 0), 5);
        node.apply(key(1, 10), 5);
        let bytes = node.encode();
        let decoded = BtreeNode::decode(&bytes, 1 << 16).unwrap();
        assert_eq!(decoded.merged_keys().len(), 2);
        assert_eq!(decoded.header.seq, 0);
    }

    #[test]
    fn later_bset_wins_on_merge() {
        let mut node = BtreeNode::new_leaf(
            BtreeId::Extents,
            Bpos::POS_MIN,
            Bpos::spos_max(),
            1 << 16,
        );
        node.apply(key(1, 0), 1);
        node.seal_and_start_new_bset(1);
        node.apply(
            Bkey::new(BtreeId::Extents, Bpos::new(1, 0, 0), BkeyValue::NeedDiscard),
            2,
        );
        let merged = node.merged_keys();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value, BkeyValue::NeedDiscard);
    }

    #[test]
    fn corrupted_bset_fails_checksum() {
        let mut node = BtreeNode::new_leaf(
            BtreeId::Extents,
            Bpos::POS_MIN,
            Bpos::spos_max(),
            1 << 16,
        );
        node.apply(key(1, 0), 1);
        let mut bytes = node.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(BtreeNode::decode(&bytes, 1 << 16).is_err());
    }

    #[test]
    fn would_overflow_respects_capacity() {
        let node = BtreeNode::new_leaf(BtreeId::Extents, Bpos::POS_MIN, Bpos::spos_max(), 16);
        assert!(node.would_overflow(&key(1, 0)));
    }
}
