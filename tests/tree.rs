//! Black-box end-to-end scenarios exercised through the public API,
//! complementing the `#[cfg(test)]` units inside `fs`/`trans`/
//! `journal::replay`.

use bfoxide::bkey::{Bkey, BkeyValue};
use bfoxide::bpos::Bpos;
use bfoxide::btree::iter::{flags, BtreeIter};
use bfoxide::btree_id::BtreeId;
use bfoxide::bucket::DataType;
use bfoxide::device::DeviceGeometry;
use bfoxide::fs::Fs;
use bfoxide::options::Options;

fn geometry() -> DeviceGeometry {
    DeviceGeometry {
        block_size: 4096,
        bucket_size: 1 << 17,
        nbuckets: 256,
    }
}

#[test]
fn format_across_two_devices_splits_usage_per_device() {
    let dir = tempfile::tempdir().unwrap();
    let specs = vec![
        (dir.path().join("dev0"), geometry()),
        (dir.path().join("dev1"), geometry()),
    ];
    let fs = Fs::format(&specs, Options::default()).unwrap();

    let claimed = fs.allocate_bucket(1, DataType::User).unwrap();
    let usage = fs.fs_usage();
    assert_eq!(usage.per_device.len(), 2);
    assert_eq!(usage.per_device[1].dirty_buckets, 1);
    assert_eq!(usage.per_device[0].dirty_buckets, 0);

    fs.free_bucket(1, claimed.bucket_nr).unwrap();
    fs.stop().unwrap();
}

#[test]
fn a_committed_key_is_visible_through_a_fresh_iterator() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev0");
    let fs = Fs::format(&[(path, geometry())], Options::default()).unwrap();

    let pos = Bpos::new(42, 0, 0);
    fs.trans_commit(|tx| {
        tx.update(
            BtreeId::Inodes,
            pos,
            Bkey::new(
                BtreeId::Inodes,
                pos,
                BkeyValue::Opaque {
                    tag: 1,
                    bytes: vec![1, 2, 3, 4],
                },
            ),
        );
    })
    .unwrap();

    let mut iter = BtreeIter::new(&fs.store, BtreeId::Inodes, Bpos::POS_MIN, flags::FILTER_SNAPSHOTS);
    let found = iter.peek().unwrap().expect("key committed above must be visible");
    assert_eq!(found.pos, pos);
    assert_eq!(
        found.value,
        BkeyValue::Opaque {
            tag: 1,
            bytes: vec![1, 2, 3, 4]
        }
    );
}

#[test]
fn committed_keys_survive_stop_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev0");
    let fs = Fs::format(&[(path.clone(), geometry())], Options::default()).unwrap();

    let pos = Bpos::new(7, 0, 0);
    fs.trans_commit(|tx| {
        tx.update(
            BtreeId::Dirents,
            pos,
            Bkey::new(BtreeId::Dirents, pos, BkeyValue::Opaque { tag: 2, bytes: vec![9] }),
        );
    })
    .unwrap();
    fs.stop().unwrap();

    let reopened = Fs::open(&[path], Options::default()).unwrap();
    let mut iter = BtreeIter::new(&reopened.store, BtreeId::Dirents, Bpos::POS_MIN, flags::FILTER_SNAPSHOTS);
    let found = iter.peek().unwrap().expect("key must survive a stop/reopen cycle");
    assert_eq!(found.pos, pos);
}

#[test]
fn allocator_exhaustion_surfaces_no_space() {
    let dir = tempfile::tempdir().unwrap();
    let small = DeviceGeometry {
        block_size: 4096,
        bucket_size: 1 << 17,
        nbuckets: 64,
    };
    let path = dir.path().join("dev0");
    let fs = Fs::format(&[(path, small)], Options::default()).unwrap();

    let mut claimed = Vec::new();
    loop {
        match fs.allocate_bucket(0, DataType::User) {
            Ok(a) => claimed.push(a.bucket_nr),
            Err(_) => break,
        }
        if claimed.len() > small.nbuckets as usize {
            panic!("allocator never reported exhaustion");
        }
    }
    assert!(!claimed.is_empty());
    let usage = fs.fs_usage();
    assert_eq!(usage.free_buckets, 0);
}

#[test]
fn fsck_is_clean_after_a_mix_of_allocate_and_free() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev0");
    let fs = Fs::format(&[(path, geometry())], Options::default()).unwrap();

    let a = fs.allocate_bucket(0, DataType::User).unwrap();
    let b = fs.allocate_bucket(0, DataType::User).unwrap();
    fs.free_bucket(0, a.bucket_nr).unwrap();
    let _ = b;

    let report = fs.fsck(false).unwrap();
    assert!(report.findings.is_empty(), "unexpected fsck findings: {:?}", report.findings);
}
