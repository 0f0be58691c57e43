//! `bkey`: the variable-sized typed key/value record carried in every
//! bset (spec §3 "Bkey"). Value payloads for the trees the core
//! itself owns (`alloc`, `freespace`, `need_discard`, `lru`,
//! interior `btree_ptr_v2`) are modeled explicitly; everything else
//! (`extent`, `reflink`, `subvolume`, ...) is carried as an opaque
//! tagged blob, exactly as spec §3 describes: "plus opaque extent,
//! reflink, subvolume, etc., carried transparently."

use crate::bpos::Bpos;
use crate::btree_id::BtreeId;
use crate::bucket::{AllocV4, DataType, IoTime};
use crate::codec::{put_bytes, put_u32, put_u64, put_u8, Reader};
use crate::error::FsError;

/// Wire tag for the value payload. Replaces the original's X-macro
/// bkey-type enumeration (§9 design notes) with a closed sum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BkeyType {
    Deleted = 0,
    AllocV4 = 1,
    Freespace = 2,
    NeedDiscard = 3,
    Lru = 4,
    BtreePtrV2 = 5,
    Opaque = 6,
}

impl BkeyType {
    fn from_u8(v: u8) -> Result<BkeyType, FsError> {
        Ok(match v {
            0 => BkeyType::Deleted,
            1 => BkeyType::AllocV4,
            2 => BkeyType::Freespace,
            3 => BkeyType::NeedDiscard,
            4 => BkeyType::Lru,
            5 => BkeyType::BtreePtrV2,
            6 => BkeyType::Opaque,
            other => return Err(FsError::Invalid(format!("unknown bkey type {other}"))),
        })
    }
}

/// Child pointer used by interior nodes (spec §3 "Bkey",
/// `btree_ptr_v2`). `mem_ptr` is an in-memory-only cache hint (an
/// index into the node cache's arena, spec §9's "arena + weak index"
/// replacement for pointer-chased parent links); it is never encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreePtrV2 {
    pub dev: u8,
    pub bucket_nr: u64,
    pub gen: u8,
    pub min_key: Bpos,
    pub seq: u64,
    pub mem_ptr: Option<u64>,
}

/// The value half of a bkey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BkeyValue {
    /// A hole: no value at this position (iterator semantics, §4.D.3
    /// `peek_slot` "synthesising a deleted key").
    Deleted,
    Alloc(AllocV4),
    /// Presence alone is the payload: bucket is free (§4.C).
    Freespace,
    /// Presence alone is the payload: bucket needs discard (§4.C).
    NeedDiscard,
    /// Presence alone is the payload: bucket holds cached-only data
    /// (§4.C); the key's own position already encodes io_time.
    Lru,
    BtreePtrV2(BtreePtrV2),
    /// Extent / reflink / subvolume / etc: opaque to the core, carried
    /// byte-for-byte.
    Opaque { tag: u8, bytes: Vec<u8> },
}

/// A full key/value record as stored in a bset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bkey {
    pub btree: BtreeId,
    pub pos: Bpos,
    /// Range size; meaningful only when `btree.is_extents()`.
    pub size: u32,
    pub value: BkeyValue,
}

impl Bkey {
    pub fn new(btree: BtreeId, pos: Bpos, value: BkeyValue) -> Bkey {
        Bkey {
            btree,
            pos,
            size: 0,
            value,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.value, BkeyValue::Deleted)
    }

    /// Build the `freespace` secondary-index key for a bucket (§4.C):
    /// `(dev, genbits<<56 | bucket_nr)`.
    pub fn freespace_pos(dev: u8, genbits: u8, bucket_nr: u64) -> Bpos {
        Bpos::new(dev as u64, ((genbits as u64) << 56) | bucket_nr, 0)
    }

    /// Build the `need_discard` secondary-index key: `(dev, bucket_nr)`.
    pub fn need_discard_pos(dev: u8, bucket_nr: u64) -> Bpos {
        Bpos::new(dev as u64, bucket_nr, 0)
    }

    /// Build the `lru` secondary-index key: `(dev, io_time<<X | bucket_nr)`.
    /// `X` is chosen as 40 bits of bucket_nr room, matching the
    /// original's packing of a clock tick ahead of the bucket number.
    pub const LRU_BUCKET_BITS: u32 = 40;

    pub fn lru_pos(dev: u8, io_time_read: u64, bucket_nr: u64) -> Bpos {
        debug_assert!(bucket_nr < (1 << Self::LRU_BUCKET_BITS));
        Bpos::new(
            dev as u64,
            (io_time_read << Self::LRU_BUCKET_BITS) | bucket_nr,
            0,
        )
    }

    pub fn lru_bucket_nr(offset: u64) -> u64 {
        offset & ((1u64 << Self::LRU_BUCKET_BITS) - 1)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u8(&mut buf, self.btree as u8);
        put_u64(&mut buf, self.pos.inode);
        put_u64(&mut buf, self.pos.offset);
        put_u32(&mut buf, self.pos.snapshot);
        put_u32(&mut buf, self.size);
        match &self.value {
            BkeyValue::Deleted => put_u8(&mut buf, BkeyType::Deleted as u8),
            BkeyValue::Alloc(a) => {
                put_u8(&mut buf, BkeyType::AllocV4 as u8);
                encode_alloc(&mut buf, a);
            }
            BkeyValue::Freespace => put_u8(&mut buf, BkeyType::Freespace as u8),
            BkeyValue::NeedDiscard => put_u8(&mut buf, BkeyType::NeedDiscard as u8),
            BkeyValue::Lru => put_u8(&mut buf, BkeyType::Lru as u8),
            BkeyValue::BtreePtrV2(p) => {
                put_u8(&mut buf, BkeyType::BtreePtrV2 as u8);
                put_u8(&mut buf, p.dev);
                put_u64(&mut buf, p.bucket_nr);
                put_u8(&mut buf, p.gen);
                put_u64(&mut buf, p.min_key.inode);
                put_u64(&mut buf, p.min_key.offset);
                put_u32(&mut buf, p.min_key.snapshot);
                put_u64(&mut buf, p.seq);
            }
            BkeyValue::Opaque { tag, bytes } => {
                put_u8(&mut buf, BkeyType::Opaque as u8);
                put_u8(&mut buf, *tag);
                put_u32(&mut buf, bytes.len() as u32);
                put_bytes(&mut buf, bytes);
            }
        }
        buf
    }

    pub fn decode(btree: BtreeId, bytes: &[u8]) -> Result<Bkey, FsError> {
        let mut r = Reader::new(bytes);
        let wire_btree = r.get_u8()?;
        if wire_btree != btree as u8 {
            return Err(FsError::Invalid(format!(
                "bkey btree id mismatch: node says {btree:?}, key says {wire_btree}"
            )));
        }
        let inode = r.get_u64()?;
        let offset = r.get_u64()?;
        let snapshot = r.get_u32()?;
        let size = r.get_u32()?;
        let tag = BkeyType::from_u8(r.get_u8()?)?;
        let value = match tag {
            BkeyType::Deleted => BkeyValue::Deleted,
            BkeyType::AllocV4 => BkeyValue::Alloc(decode_alloc(&mut r)?),
            BkeyType::Freespace => BkeyValue::Freespace,
            BkeyType::NeedDiscard => BkeyValue::NeedDiscard,
            BkeyType::Lru => BkeyValue::Lru,
            BkeyType::BtreePtrV2 => {
                let dev = r.get_u8()?;
                let bucket_nr = r.get_u64()?;
                let gen = r.get_u8()?;
                let min_inode = r.get_u64()?;
                let min_offset = r.get_u64()?;
                let min_snapshot = r.get_u32()?;
                let seq = r.get_u64()?;
                BkeyValue::BtreePtrV2(BtreePtrV2 {
                    dev,
                    bucket_nr,
                    gen,
                    min_key: Bpos::new(min_inode, min_offset, min_snapshot),
                    seq,
                    mem_ptr: None,
                })
            }
            BkeyType::Opaque => {
                let t = r.get_u8()?;
                let len = r.get_u32()? as usize;
                let bytes = r.get_bytes(len)?.to_vec();
                BkeyValue::Opaque { tag: t, bytes }
            }
        };
        Ok(Bkey {
            btree,
            pos: Bpos::new(inode, offset, snapshot),
            size,
            value,
        })
    }
}

fn encode_alloc(buf: &mut Vec<u8>, a: &AllocV4) {
    put_u8(buf, a.dev);
    put_u64(buf, a.bucket_nr);
    put_u8(buf, a.gen);
    put_u8(buf, a.oldest_gen);
    put_u8(buf, a.data_type as u8);
    put_u32(buf, a.dirty_sectors);
    put_u32(buf, a.cached_sectors);
    put_u64(buf, a.io_time.read);
    put_u64(buf, a.io_time.write);
    put_u8(buf, a.need_discard as u8);
    put_u8(buf, a.need_inc_gen as u8);
    match a.stripe {
        Some((id, redundancy)) => {
            put_u8(buf, 1);
            put_u64(buf, id);
            put_u8(buf, redundancy);
        }
        None => put_u8(buf, 0),
    }
}

fn decode_alloc(r: &mut Reader) -> Result<AllocV4, FsError> {
    let dev = r.get_u8()?;
    let bucket_nr = r.get_u64()?;
    let gen = r.get_u8()?;
    let oldest_gen = r.get_u8()?;
    let data_type = DataType::from_u8(r.get_u8()?)
        .ok_or_else(|| FsError::Invalid("unknown data_type".into()))?;
    let dirty_sectors = r.get_u32()?;
    let cached_sectors = r.get_u32()?;
    let io_read = r.get_u64()?;
    let io_write = r.get_u64()?;
    let need_discard = r.get_u8()? != 0;
    let need_inc_gen = r.get_u8()? != 0;
    let has_stripe = r.get_u8()? != 0;
    let stripe = if has_stripe {
        let id = r.get_u64()?;
        let redundancy = r.get_u8()?;
        Some((id, redundancy))
    } else {
        None
    };
    Ok(AllocV4 {
        dev,
        bucket_nr,
        gen,
        oldest_gen,
        data_type,
        dirty_sectors,
        cached_sectors,
        io_time: IoTime {
            read: io_read,
            write: io_write,
        },
        need_discard,
        need_inc_gen,
        stripe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_key_round_trips() {
        let mut a = AllocV4::new_free(2, 55);
        a.dirty_sectors = 12;
        a.data_type = DataType::User;
        a.stripe = Some((9, 2));
        let k = Bkey::new(BtreeId::Alloc, Bpos::new(2, 55, 0), BkeyValue::Alloc(a));
        let bytes = k.encode();
        let decoded = Bkey::decode(BtreeId::Alloc, &bytes).unwrap();
        assert_eq!(k, decoded);
    }

    #[test]
    fn btree_ptr_round_trips_without_mem_ptr() {
        let ptr = BtreePtrV2 {
            dev: 1,
            bucket_nr: 42,
            gen: 3,
            min_key: Bpos::new(0, 0, 0),
            seq: 7,
            mem_ptr: Some(99), // must not survive encode/decode
        };
        let k = Bkey::new(
            BtreeId::Extents,
            Bpos::new(10, 20, 0),
            BkeyValue::BtreePtrV2(ptr),
        );
        let bytes = k.encode();
        let decoded = Bkey::decode(BtreeId::Extents, &bytes).unwrap();
        match decoded.value {
            BkeyValue::BtreePtrV2(p) => assert_eq!(p.mem_ptr, None),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn opaque_payload_round_trips_transparently() {
        let k = Bkey::new(
            BtreeId::Extents,
            Bpos::new(42, 0, 0),
            BkeyValue::Opaque {
                tag: 0xAB,
                bytes: b"hello".to_vec(),
            },
        );
        let bytes = k.encode();
        let decoded = Bkey::decode(BtreeId::Extents, &bytes).unwrap();
        assert_eq!(decoded, k);
    }

    #[test]
    fn freespace_pos_orders_by_genbits_first() {
        let free = Bkey::freespace_pos(0, 0, 5);
        let needs_gen = Bkey::freespace_pos(0, 1, 0);
        assert!(free < needs_gen);
    }

    #[test]
    fn mismatched_btree_id_is_rejected() {
        let k = Bkey::new(BtreeId::Alloc, Bpos::new(0, 0, 0), BkeyValue::Freespace);
        let bytes = k.encode();
        assert!(Bkey::decode(BtreeId::Extents, &bytes).is_err());
    }

    #[test]
    fn truncated_bytes_are_an_error() {
        let k = Bkey::new(BtreeId::Alloc, Bpos::new(1, 1, 0), BkeyValue::Freespace);
        let mut bytes = k.encode();
        bytes.truncate(bytes.len() - 1);
        assert!(Bkey::decode(BtreeId::Alloc, &bytes).is_err());
    }
}
