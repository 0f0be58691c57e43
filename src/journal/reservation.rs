//! Journal reservations (spec §4.B "Reservation"/"Commit"): the
//! ordering primitive transactions use to obtain a commit seq. A
//! writer reserves bytes in the current in-memory entry; the seq it
//! lands at is its commit order. When the last holder of an entry
//! releases it, the entry seals and becomes eligible to write.

use std::sync::Mutex;

use crate::bkey::Bkey;
use crate::btree_id::BtreeId;
use crate::error::{FsError, RestartReason};
use crate::journal::entry::JournalEntry;

struct Inner {
    active: JournalEntry,
    open_holders: u32,
    capacity_bytes: usize,
    used_bytes: usize,
    /// Entries that have sealed but not yet been written to the
    /// on-device ring (spec §4.B: "write-io pipeline submits entries in
    /// seq order"). This crate has no background writer thread, so
    /// whatever calls `commit` drains this queue itself once it has a
    /// device to write to.
    sealed: Vec<JournalEntry>,
}

/// Proof of a live reservation against a specific seq. Must be
/// consumed by `commit`/`release` before the journal will seal that
/// entry.
pub struct ReservationHandle {
    pub seq: u64,
}

pub struct Journal {
    inner: Mutex<Inner>,
}

impl Journal {
    pub fn new(capacity_bytes: usize) -> Journal {
        Journal {
            inner: Mutex::new(Inner {
                active: JournalEntry::new(1, 1),
                open_holders: 0,
                capacity_bytes,
                used_bytes: 0,
                sealed: Vec::new(),
            }),
        }
    }

    pub fn current_seq(&self) -> u64 {
        self.inner.lock().unwrap().active.seq
    }

    /// Reserve `bytes` in the active entry. A full journal reports
    /// `Busy` rather than blocking — this crate models no background
    /// sealing thread to wait on, so the caller's retry loop (spec §5:
    /// "journal reservation may block when the journal is full") is
    /// the transaction engine's ordinary restart path instead.
    pub fn reserve(&self, bytes: usize) -> Result<ReservationHandle, FsError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.used_bytes + bytes > inner.capacity_bytes {
            return Err(FsError::Busy(RestartReason::Memory));
        }
        inner.used_bytes += bytes;
        inner.open_holders += 1;
        Ok(ReservationHandle {
            seq: inner.active.seq,
        })
    }

    /// Copy prepared updates into the reservation's entry (spec §4.E
    /// commit step 4-5 "apply in memory" companion on the journal
    /// side).
    pub fn commit(&self, handle: &ReservationHandle, updates: Vec<(BtreeId, Bkey)>) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(handle.seq, inner.active.seq);
        inner.active.updates.extend(updates);
    }

    /// Release the reservation. Once every holder of the active entry
    /// has released, the entry seals and a fresh one opens at the next
    /// seq (spec §4.B: "when the last holder of an entry releases it,
    /// the entry becomes eligible for write").
    pub fn release(&self, handle: ReservationHandle) -> Option<JournalEntry> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(handle.seq, inner.active.seq);
        inner.open_holders = inner.open_holders.saturating_sub(1);
        if inner.open_holders == 0 {
            let next_seq = inner.active.seq + 1;
            let last_seq = inner.active.last_seq;
            inner.used_bytes = 0;
            let sealed = std::mem::replace(&mut inner.active, JournalEntry::new(next_seq, last_seq));
            inner.sealed.push(sealed.clone());
            Some(sealed)
        } else {
            None
        }
    }

    /// Take every entry that has sealed since the last drain, in seq
    /// order, for the caller to write to the on-device ring.
    pub fn drain_sealed(&self) -> Vec<JournalEntry> {
        std::mem::take(&mut self.inner.lock().unwrap().sealed)
    }

    /// Advance the reclamation floor once the oldest dirty node's pin
    /// has been released (spec §4.B "Pinning").
    pub fn advance_last_seq(&self, new_last_seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.last_seq = inner.active.last_seq.max(new_last_seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::BkeyValue;
    use crate::bpos::Bpos;

    #[test]
    fn single_holder_seals_immediately_on_release() {
        let j = Journal::new(4096);
        let h = j.reserve(64).unwrap();
        let seq = h.seq;
        j.commit(
            &h,
            vec![(
                BtreeId::Extents,
                Bkey::new(BtreeId::Extents, Bpos::new(1, 0, 0), BkeyValue::Freespace),
            )],
        );
        let sealed = j.release(h).expect("last holder seals the entry");
        assert_eq!(sealed.seq, seq);
        assert_eq!(sealed.updates.len(), 1);
        assert_eq!(j.current_seq(), seq + 1);
    }

    #[test]
    fn second_holder_defers_sealing() {
        let j = Journal::new(4096);
        let a = j.reserve(16).unwrap();
        let b = j.reserve(16).unwrap();
        assert!(j.release(a).is_none());
        let sealed = j.release(b).expect("last holder seals");
        assert_eq!(sealed.seq, 1);
    }

    #[test]
    fn full_journal_reports_busy() {
        let j = Journal::new(8);
        assert!(j.reserve(4).is_ok());
        assert!(matches!(j.reserve(5), Err(FsError::Busy(_))));
    }

    #[test]
    fn sealed_entries_are_queued_for_the_caller_to_drain() {
        let j = Journal::new(4096);
        let h = j.reserve(16).unwrap();
        j.commit(&h, vec![]);
        j.release(h);
        let drained = j.drain_sealed();
        assert_eq!(drained.len(), 1);
        assert!(j.drain_sealed().is_empty(), "a second drain finds nothing new");
    }
}
