//! Component A: device / bucket layer. Synchronous, unbuffered
//! scatter-gather block I/O on one device (spec §4.A). Grounded on the
//! teacher's `mapped_file.rs` (device-size detection via
//! `ioctls::blkgetsize64`, `libc` for raw syscalls) but reworked from
//! a read-only mmap into read/write `pread`/`pwrite` since the core
//! needs to durably persist btree nodes and journal entries, not just
//! inspect them.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use more_asserts::assert_le;

use crate::bucket::MAX_DEVICES;
use crate::error::FsError;

pub const SECTOR_SIZE: u64 = 512;

/// Size of the storage backing `file`: for a regular file this is
/// just its length; for a raw block device (no fixed length in the
/// inode) it is obtained via `BLKGETSIZE64`, the same ioctl the
/// teacher's `mapped_file.rs` uses to size a device before mmap'ing it.
fn device_byte_size(file: &File) -> Result<u64> {
    let md = file.metadata()?;
    if md.is_file() {
        return Ok(md.len());
    }
    #[cfg(target_os = "linux")]
    {
        let mut len: u64 = 0;
        let ret = unsafe { ioctls::blkgetsize64(file.as_raw_fd(), &mut len as *mut u64) };
        if ret != 0 {
            return Err(anyhow!("BLKGETSIZE64 failed: {}", std::io::Error::last_os_error()));
        }
        Ok(len)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(md.len())
    }
}

/// Fixed, power-of-two geometry for one device (spec §3 "Device").
#[derive(Debug, Clone, Copy)]
pub struct DeviceGeometry {
    pub block_size: u32,
    pub bucket_size: u32,
    pub nbuckets: u64,
}

impl DeviceGeometry {
    pub fn validate(&self) -> Result<(), FsError> {
        if !self.block_size.is_power_of_two() || (self.block_size as u64) < SECTOR_SIZE {
            return Err(FsError::Invalid(format!(
                "block_size {} must be a power of two >= {SECTOR_SIZE}",
                self.block_size
            )));
        }
        if !self.bucket_size.is_power_of_two() || self.bucket_size % self.block_size != 0 {
            return Err(FsError::Invalid(format!(
                "bucket_size {} must be a power-of-two multiple of block_size {}",
                self.bucket_size, self.block_size
            )));
        }
        const MAX_BUCKET_SIZE: u32 = 1 << 20;
        if self.bucket_size > MAX_BUCKET_SIZE {
            return Err(FsError::Invalid(format!(
                "bucket_size {} exceeds the 1 MiB maximum",
                self.bucket_size
            )));
        }
        const MIN_BUCKETS: u64 = 64;
        if self.nbuckets < MIN_BUCKETS {
            return Err(FsError::Invalid(format!(
                "nbuckets {} below MIN_BUCKETS {MIN_BUCKETS}",
                self.nbuckets
            )));
        }
        Ok(())
    }

    pub fn bucket_bytes(&self) -> u64 {
        self.bucket_size as u64
    }
}

/// One block storage target (spec §4.A). No caching here: it is the
/// unbuffered primitive that the journal and btree-node I/O sit on.
pub struct Device {
    pub dev_idx: u8,
    pub path: PathBuf,
    pub geometry: DeviceGeometry,
    file: File,
}

impl Device {
    /// Open an existing device/file whose size already matches
    /// `geometry`. Used on mount.
    pub fn open(dev_idx: u8, path: &Path, geometry: DeviceGeometry) -> Result<Device> {
        if dev_idx as usize >= MAX_DEVICES {
            return Err(anyhow!("dev_idx {dev_idx} exceeds MAX_DEVICES"));
        }
        geometry.validate()?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = device_byte_size(&file)?;
        let needed = geometry.nbuckets * geometry.bucket_bytes();
        if size < needed {
            return Err(anyhow!(
                "device {} is {size} bytes, needs at least {needed}",
                path.display()
            ));
        }
        Ok(Device {
            dev_idx,
            path: path.to_path_buf(),
            geometry,
            file,
        })
    }

    /// Create (or truncate) a backing file of the right size and open
    /// it as a device. Used by `format` (an external collaborator per
    /// spec §1) and by tests that stand up a filesystem from scratch.
    pub fn create(dev_idx: u8, path: &Path, geometry: DeviceGeometry) -> Result<Device> {
        geometry.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let needed = geometry.nbuckets * geometry.bucket_bytes();
        file.set_len(needed)?;
        Ok(Device {
            dev_idx,
            path: path.to_path_buf(),
            geometry,
            file,
        })
    }

    pub fn nr_buckets(&self) -> u64 {
        self.geometry.nbuckets
    }

    pub fn bucket_bytes(&self) -> u64 {
        self.geometry.bucket_bytes()
    }

    fn bucket_offset(&self, bucket_nr: u64) -> Result<u64, FsError> {
        if bucket_nr >= self.geometry.nbuckets {
            return Err(FsError::Invalid(format!(
                "bucket_nr {bucket_nr} out of range (nbuckets={})",
                self.geometry.nbuckets
            )));
        }
        Ok(bucket_nr * self.bucket_bytes())
    }

    /// Read `len` bytes starting at a byte offset within bucket
    /// `bucket_nr`. `REQ_SYNC`: this blocks the caller until the I/O
    /// completes, as spec §5 requires.
    pub fn read_at(&self, bucket_nr: u64, offset_in_bucket: u64, len: usize) -> Result<Vec<u8>> {
        let base = self.bucket_offset(bucket_nr)?;
        assert_le!(offset_in_bucket + len as u64, self.bucket_bytes());
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, base + offset_in_bucket)
            .map_err(FsError::from)?;
        Ok(buf)
    }

    /// Write bytes at a byte offset within bucket `bucket_nr`, with
    /// `REQ_FUA` semantics: `sync_data` forces the write durable
    /// before returning, matching the journal commit-boundary
    /// requirement in spec §4.B.
    pub fn write_at(&self, bucket_nr: u64, offset_in_bucket: u64, data: &[u8], fua: bool) -> Result<()> {
        let base = self.bucket_offset(bucket_nr)?;
        assert_le!(offset_in_bucket + data.len() as u64, self.bucket_bytes());
        self.file
            .write_all_at(data, base + offset_in_bucket)
            .map_err(FsError::from)?;
        if fua {
            self.file.sync_data().map_err(FsError::from)?;
        }
        Ok(())
    }

    /// Best-effort discard of a whole bucket. Returns an I/O error kind
    /// on failure; the caller decides whether to retry against a
    /// replica or downgrade the fs (spec §4.A).
    pub fn discard(&self, bucket_nr: u64) -> Result<()> {
        let base = self.bucket_offset(bucket_nr)?;
        let len = self.bucket_bytes();
        #[cfg(target_os = "linux")]
        {
            let range: [u64; 2] = [base, len];
            let ret = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    blkdiscard_request_code(),
                    range.as_ptr(),
                )
            };
            if ret != 0 {
                log::debug!(
                    "BLKDISCARD not supported on {}, treating as no-op",
                    self.path.display()
                );
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn blkdiscard_request_code() -> libc::c_ulong {
    // BLKDISCARD = _IO(0x12, 119)
    const IOC_NONE: libc::c_ulong = 0;
    ioctl_code(IOC_NONE, 0x12, 119, 0)
}

#[cfg(target_os = "linux")]
fn ioctl_code(dir: libc::c_ulong, ty: libc::c_ulong, nr: libc::c_ulong, size: libc::c_ulong) -> libc::c_ulong {
    (dir << 30) | (ty << 8) | nr | (size << 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_geometry() -> DeviceGeometry {
        DeviceGeometry {
            block_size: 4096,
            bucket_size: 1 << 17,
            nbuckets: 64,
        }
    }

    #[test]
    fn rejects_bucket_size_not_multiple_of_block_size() {
        let g = DeviceGeometry {
            block_size: 4096,
            bucket_size: 4097,
            nbuckets: 64,
        };
        assert!(g.validate().is_err());
    }

    #[test]
    fn rejects_too_few_buckets() {
        let g = DeviceGeometry {
            block_size: 4096,
            bucket_size: 1 << 17,
            nbuckets: 4,
        };
        assert!(g.validate().is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let dev = Device::create(0, &path, small_geometry()).unwrap();
        dev.write_at(3, 0, b"hello world", true).unwrap();
        let back = dev.read_at(3, 0, 11).unwrap();
        assert_eq!(&back, b"hello world");
    }

    #[test]
    fn out_of_range_bucket_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let dev = Device::create(0, &path, small_geometry()).unwrap();
        assert!(dev.read_at(1000, 0, 1).is_err());
    }
}
