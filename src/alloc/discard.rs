//! Background discard worker (spec §4.C "Discard"): walk `need_discard`
//! candidates, confirm each still needs discarding against `alloc` (a
//! stale candidate left behind by a dropped transaction must not be
//! double-discarded), issue the device discard outside any
//! transaction, then clear the flag. Interruptible: callers share an
//! `AtomicBool` they can flip from another thread between passes.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::alloc::allocator::AllocTable;
use crate::error::FsError;

pub struct DiscardWorker<'a> {
    device: &'a crate::device::Device,
}

impl<'a> DiscardWorker<'a> {
    pub fn new(device: &'a crate::device::Device) -> DiscardWorker<'a> {
        DiscardWorker { device }
    }

    /// Run one pass over `candidates` (bucket numbers as read from the
    /// `need_discard` tree), discarding and clearing each that `table`
    /// still has flagged. Returns the buckets actually discarded.
    pub fn run_pass(
        &self,
        table: &mut AllocTable,
        candidates: &[u64],
        should_stop: &AtomicBool,
    ) -> Result<Vec<u64>, FsError> {
        let mut discarded = Vec::new();
        for &bucket_nr in candidates {
            if should_stop.load(Ordering::Relaxed) {
                break;
            }
            let current = match table.get(bucket_nr) {
                Some(a) if a.need_discard => *a,
                _ => continue,
            };
            self.device
                .discard(bucket_nr)
                .map_err(|e| FsError::Io(e.to_string()))?;
            let mut cleared = current;
            cleared.need_discard = false;
            table.set(bucket_nr, cleared);
            discarded.push(bucket_nr);
        }
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::DataType;
    use crate::device::{Device, DeviceGeometry};
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn dev() -> (Device, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let geometry = DeviceGeometry {
            block_size: 4096,
            bucket_size: 1 << 17,
            nbuckets: 64,
        };
        (Device::create(0, &path, geometry).unwrap(), dir)
    }

    #[test]
    fn discard_pass_clears_flagged_buckets() {
        let (d, _dir) = dev();
        let mut table = AllocTable::new_all_free(0, 64);
        let (_, mut new) = table.allocate(DataType::User).unwrap();
        new.need_discard = true;
        table.set(new.bucket_nr, new);

        let worker = DiscardWorker::new(&d);
        let stop = AtomicBool::new(false);
        let done = worker.run_pass(&mut table, &[new.bucket_nr], &stop).unwrap();
        assert_eq!(done, vec![new.bucket_nr]);
        assert!(!table.get(new.bucket_nr).unwrap().need_discard);
    }

    #[test]
    fn stale_candidate_without_the_flag_is_skipped() {
        let (d, _dir) = dev();
        let mut table = AllocTable::new_all_free(0, 64);
        let worker = DiscardWorker::new(&d);
        let stop = AtomicBool::new(false);
        let done = worker.run_pass(&mut table, &[3], &stop).unwrap();
        assert!(done.is_empty());
    }

    #[test]
    fn stop_flag_halts_before_later_candidates() {
        let (d, _dir) = dev();
        let mut table = AllocTable::new_all_free(0, 64);
        for n in [1u64, 2] {
            let mut a = *table.get(n).unwrap();
            a.need_discard = true;
            table.set(n, a);
        }
        let worker = DiscardWorker::new(&d);
        let stop = AtomicBool::new(true);
        let done = worker.run_pass(&mut table, &[1, 2], &stop).unwrap();
        assert!(done.is_empty());
    }
}
