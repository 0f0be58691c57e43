//! The on-device half of the journal (spec §4.B): a contiguous set of
//! journal buckets on one device, written sequentially, wrapping back
//! to the start once the tail has advanced past the head. Sits below
//! [`crate::journal::reservation::Journal`], which owns the in-memory
//! reservation/sealing protocol; this module is what actually gets a
//! sealed [`JournalEntry`] onto a device and back off it on replay.

use anyhow::{anyhow, Result};

use crate::device::Device;
use crate::journal::entry::JournalEntry;

/// A fixed span of buckets on one device reserved for the journal,
/// written round-robin. Mirrors the teacher's treatment of a device as
/// a flat sequence of addressable regions (`mapped_file.rs`); the ring
/// discipline itself is spec §4.B's "tail advances by discarding
/// oldest-acknowledged entries" in miniature — this crate doesn't
/// model a separate discard-of-reclaimed-journal-space pass, since
/// unlike user/btree buckets a journal bucket is always safe to
/// overwrite once wrapped back onto (its old entry either replayed
/// already or is about to be overwritten by a newer one, which is
/// exactly what "oldest-acknowledged" entries are for).
pub struct JournalRing {
    /// Bucket numbers reserved for the journal, in write order.
    buckets: Vec<u64>,
    /// Index into `buckets` the next entry will land on.
    next_slot: usize,
}

impl JournalRing {
    pub fn new(buckets: Vec<u64>) -> JournalRing {
        JournalRing {
            buckets,
            next_slot: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Write one sealed entry to the next bucket in ring order,
    /// advancing the write cursor (spec §4.B "write-io pipeline
    /// submits entries in seq order with FUA on the boundary of a
    /// user-visible fsync or when NO_FLUSH cannot be set"). Per the
    /// open question in spec §9, this crate never sets `NO_FLUSH`:
    /// every write goes down with `fua = true` until a design note
    /// clarifies the exact rule.
    pub fn write_next(&mut self, device: &Device, entry: &JournalEntry) -> Result<u64> {
        if self.buckets.is_empty() {
            return Err(anyhow!("journal ring has no buckets reserved"));
        }
        let bucket_nr = self.buckets[self.next_slot];
        let bytes = entry.encode();
        if bytes.len() as u64 > device.bucket_bytes() {
            return Err(anyhow!(
                "journal entry of {} bytes does not fit in a {}-byte bucket",
                bytes.len(),
                device.bucket_bytes()
            ));
        }
        device.write_at(bucket_nr, 0, &bytes, true)?;
        self.next_slot = (self.next_slot + 1) % self.buckets.len();
        Ok(bucket_nr)
    }

    /// Read every journal bucket in ring order and decode whatever
    /// checksums cleanly (spec §4.B "Replay": "scan all journal
    /// buckets"). Entries that fail to decode (never written, or
    /// torn/corrupted by a crash mid-write) are silently skipped here
    /// — [`crate::journal::replay::plan_replay`] is what turns "some
    /// entries missing" into a blacklist decision.
    pub fn read_all(&self, device: &Device) -> Vec<JournalEntry> {
        let mut out = Vec::new();
        for &bucket_nr in &self.buckets {
            let bytes = match device.read_at(bucket_nr, 0, device.bucket_bytes() as usize) {
                Ok(b) => b,
                Err(_) => continue,
            };
            if let Ok(entry) = JournalEntry::decode(&bytes) {
                out.push(entry);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceGeometry;
    use tempfile::tempdir;

    fn device() -> (Device, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let geometry = DeviceGeometry {
            block_size: 4096,
            bucket_size: 1 << 16,
            nbuckets: 64,
        };
        (Device::create(0, &path, geometry).unwrap(), dir)
    }

    #[test]
    fn writes_wrap_around_the_reserved_span() {
        let (dev, _dir) = device();
        let mut ring = JournalRing::new(vec![10, 11, 12]);
        let mut written = Vec::new();
        for seq in 1..=4u64 {
            let e = JournalEntry::new(seq, 1);
            written.push(ring.write_next(&dev, &e).unwrap());
        }
        assert_eq!(written, vec![10, 11, 12, 10]);
    }

    #[test]
    fn read_all_recovers_written_entries() {
        let (dev, _dir) = device();
        let mut ring = JournalRing::new(vec![5, 6, 7]);
        for seq in 1..=3u64 {
            ring.write_next(&dev, &JournalEntry::new(seq, 1)).unwrap();
        }
        let mut entries = ring.read_all(&dev);
        entries.sort_by_key(|e| e.seq);
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn unwritten_buckets_are_skipped_not_errors() {
        let (dev, _dir) = device();
        let ring = JournalRing::new(vec![20, 21]);
        assert!(ring.read_all(&dev).is_empty());
    }
}
