//! Human-readable summaries of filesystem state, used by the demo binary.

use crate::fs::{DeviceUsage, Fs, FsUsage, FsckReport};
use crate::superblock::Superblock;

fn uuid_str(uuid: &[u8; 16]) -> String {
    std::format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&uuid[0..4]),
        hex::encode(&uuid[4..6]),
        hex::encode(&uuid[6..8]),
        hex::encode(&uuid[8..10]),
        hex::encode(&uuid[10..])
    )
}

pub fn dump_superblock(sb: &Superblock) {
    println!("fs uuid: {}", uuid_str(&sb.fs_uuid_external));
    println!("devices: {}", sb.nr_devices);
    for member in &sb.members {
        println!(
            "  dev uuid {} buckets {} bucket_size {} state {:?}",
            uuid_str(&member.uuid),
            member.nbuckets,
            member.bucket_size,
            member.state
        );
    }
}

fn dump_device_usage(usage: &DeviceUsage) {
    println!(
        "dev {}: {}/{} buckets free, {} dirty, {} cached, {} need_discard",
        usage.dev_idx,
        usage.free_buckets,
        usage.nbuckets,
        usage.dirty_buckets,
        usage.cached_buckets,
        usage.need_discard_buckets
    );
}

pub fn dump_usage(usage: &FsUsage) {
    for dev in &usage.per_device {
        dump_device_usage(dev);
    }
    println!("total: {}/{} buckets free", usage.free_buckets, usage.total_buckets);
}

pub fn dump_fsck_report(report: &FsckReport) {
    if report.findings.is_empty() {
        println!("fsck: clean");
    }
    for finding in &report.findings {
        println!("dev {} bucket {}: {}", finding.dev, finding.bucket_nr, finding.detail);
    }
    println!("fsck: {} finding(s), {} repaired", report.findings.len(), report.repaired);
}

pub fn dump_fs(fs: &Fs) {
    dump_superblock(&fs.superblock.lock().unwrap());
    dump_usage(&fs.fs_usage());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_str_groups_like_dashes() {
        let uuid: [u8; 16] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
        ];
        assert_eq!(uuid_str(&uuid), "01020304-0506-0708-090a-0b0c0d0e0f10");
    }
}
