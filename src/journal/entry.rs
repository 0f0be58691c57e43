//! One journal entry: a checksummed batch of bkey updates landing at a
//! monotonic sequence number (spec §4.B).

use crc::{Crc, CRC_32_ISCSI};

use crate::bkey::Bkey;
use crate::btree_id::BtreeId;
use crate::codec::{put_bytes, put_u32, put_u64, put_u8, Reader};
use crate::error::FsError;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn csum(bytes: &[u8]) -> u32 {
    CASTAGNOLI.checksum(bytes)
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub seq: u64,
    /// Oldest seq whose keys have not yet been written to the btree —
    /// the reclamation floor (spec §4.B).
    pub last_seq: u64,
    /// FUA may be skipped when another imminent entry will force it.
    pub no_flush: bool,
    pub updates: Vec<(BtreeId, Bkey)>,
}

impl JournalEntry {
    pub fn new(seq: u64, last_seq: u64) -> JournalEntry {
        JournalEntry {
            seq,
            last_seq,
            no_flush: false,
            updates: Vec::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_u64(&mut body, self.seq);
        put_u64(&mut body, self.last_seq);
        put_u8(&mut body, self.no_flush as u8);
        put_u32(&mut body, self.updates.len() as u32);
        for (btree, key) in &self.updates {
            put_u8(&mut body, *btree as u8);
            let enc = key.encode();
            put_u32(&mut body, enc.len() as u32);
            put_bytes(&mut body, &enc);
        }
        let mut out = Vec::with_capacity(body.len() + 4);
        put_u32(&mut out, csum(&body));
        put_bytes(&mut out, &body);
        out
    }

    /// Decode one entry from the front of `bytes`. Unlike a bare
    /// length-prefixed frame, the caller may hand in more than one
    /// entry's worth of bytes (the production read path reads a whole
    /// bucket, zero-padded tail included) — so the real body length is
    /// re-derived by parsing the fields first, exactly as
    /// `Bset::decode` does, and only the bytes actually consumed are
    /// checksummed. Checksumming the slice tail too would fold in
    /// trailing zero padding the writer never saw and the checksum
    /// would never match.
    pub fn decode(bytes: &[u8]) -> Result<JournalEntry, FsError> {
        let mut outer = Reader::new(bytes);
        let stored_csum = outer.get_u32()?;
        let body_start = outer.position();

        let mut r = Reader::new(&bytes[body_start..]);
        let seq = r.get_u64()?;
        let last_seq = r.get_u64()?;
        let no_flush = r.get_u8()? != 0;
        let n = r.get_u32()?;
        let mut updates = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let btree_raw = r.get_u8()?;
            let btree = *BtreeId::ALL
                .iter()
                .find(|b| **b as u8 == btree_raw)
                .ok_or_else(|| FsError::Invalid(format!("unknown btree id {btree_raw}")))?;
            let len = r.get_u32()? as usize;
            let kbytes = r.get_bytes(len)?;
            updates.push((btree, Bkey::decode(btree, kbytes)?));
        }
        let body_len = r.position();
        let body = &bytes[body_start..body_start + body_len];
        if csum(body) != stored_csum {
            return Err(FsError::Checksum {
                what: "journal_entry",
                at: seq,
            });
        }

        Ok(JournalEntry {
            seq,
            last_seq,
            no_flush,
            updates,
        })
    }
}
