//! Journal replay (spec §4.B "Replay"): turn whatever entries survived
//! on disk into (a) the longest contiguous well-checksummed prefix to
//! apply, in seq order, and (b) a blacklist of the seq range that
//! can't be trusted once a gap appears, since btree-key updates can
//! depend on ones that came before them in commit order.

use crate::btree::store::BtreeStore;
use crate::error::FsError;
use crate::journal::entry::JournalEntry;
use crate::superblock::BlacklistRange;

/// What a scan of the journal buckets resolved to.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    /// Entries to apply, already sorted by seq.
    pub apply: Vec<JournalEntry>,
    /// New blacklist range(s) to merge into the superblock, if any.
    pub blacklist: Vec<BlacklistRange>,
}

/// Decide what to replay from a set of decoded (already
/// checksum-verified — [`crate::journal::ring::JournalRing::read_all`]
/// drops anything that doesn't verify) entries, given the
/// blacklist ranges already recorded in the superblock from a prior
/// mount.
///
/// Per spec §4.B: keep the longest contiguous sequence of entries
/// ending at the newest seq actually found on disk; the first missing
/// seq in that run, if any, starts a blacklist range that covers
/// everything from there up to the newest seq seen, since a journal
/// is a single sequential writer stream and nothing after a hole can
/// be trusted to have landed in the intended order either.
pub fn plan_replay(mut entries: Vec<JournalEntry>, existing_blacklist: &[BlacklistRange]) -> ReplayPlan {
    entries.retain(|e| !existing_blacklist.iter().any(|r| r.contains(e.seq)));
    entries.sort_by_key(|e| e.seq);
    entries.dedup_by_key(|e| e.seq);

    if entries.is_empty() {
        return ReplayPlan {
            apply: Vec::new(),
            blacklist: Vec::new(),
        };
    }

    let max_seq = entries.last().unwrap().seq;
    let mut expected = entries[0].seq;
    let mut apply = Vec::new();
    let mut gap_start = None;

    for e in entries {
        if e.seq == expected {
            apply.push(e);
            expected += 1;
        } else {
            gap_start = Some(expected);
            break;
        }
    }

    let blacklist = match gap_start {
        Some(start) if start <= max_seq => vec![BlacklistRange {
            start,
            end_inclusive: max_seq,
        }],
        _ => Vec::new(),
    };

    ReplayPlan { apply, blacklist }
}

/// Apply one entry's bkey updates to the in-memory btrees (spec §4.B
/// "For each non-blacklisted entry in seq order, apply its bkey
/// updates to the in-memory B-trees; root updates take effect
/// immediately"). Root updates are implicit here: applying a
/// `btree_ptr_v2` insert into an interior node, or growing a new root
/// via a split, already mutates `BtreeStore`'s root table as a side
/// effect of `apply_leaf_update`.
pub fn apply_entry(store: &BtreeStore, entry: &JournalEntry) -> Result<(), FsError> {
    for (btree, key) in &entry.updates {
        let root = match store.root_key(*btree) {
            Some(r) => r,
            None => store
                .bootstrap_root(*btree)
                .map_err(|e| FsError::Inconsistent(e.to_string()))?,
        };
        store
            .apply_leaf_update(*btree, root, &[], key.clone(), entry.seq)
            .map_err(|e| FsError::Inconsistent(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{Bkey, BkeyValue};
    use crate::bpos::Bpos;
    use crate::btree_id::BtreeId;

    fn entry(seq: u64) -> JournalEntry {
        let mut e = JournalEntry::new(seq, 1);
        e.updates.push((
            BtreeId::Extents,
            Bkey::new(BtreeId::Extents, Bpos::new(seq, 0, 0), BkeyValue::Freespace),
        ));
        e
    }

    #[test]
    fn contiguous_run_applies_in_full_with_no_blacklist() {
        let entries = vec![entry(1), entry(2), entry(3)];
        let plan = plan_replay(entries, &[]);
        assert_eq!(plan.apply.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(plan.blacklist.is_empty());
    }

    #[test]
    fn a_gap_blacklists_everything_from_the_gap_to_the_newest_seq() {
        // seq 7 never made it durably to disk; 8..10 were never even
        // submitted since the journal is a single sequential writer.
        let entries = vec![entry(1), entry(2), entry(3), entry(4), entry(5), entry(6)];
        // Simulate "newest known seq was 10" by injecting a later entry
        // with a hole in between.
        let mut entries = entries;
        entries.push(entry(10));
        let plan = plan_replay(entries, &[]);
        assert_eq!(plan.apply.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(plan.blacklist, vec![BlacklistRange { start: 7, end_inclusive: 10 }]);
    }

    #[test]
    fn previously_blacklisted_seqs_are_dropped_before_planning() {
        let entries = vec![entry(1), entry(2), entry(3)];
        let existing = vec![BlacklistRange { start: 2, end_inclusive: 2 }];
        let plan = plan_replay(entries, &existing);
        assert_eq!(plan.apply.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn empty_input_replays_nothing() {
        let plan = plan_replay(vec![], &[]);
        assert!(plan.apply.is_empty());
        assert!(plan.blacklist.is_empty());
    }
}
