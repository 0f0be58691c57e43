//! Explicit little-endian encode/decode helpers.
//!
//! Per spec §9's design note on "bitfield-packed on-disk structures":
//! every on-disk structure in this crate goes through these functions
//! rather than through `#[repr(C, packed)]` field aliasing — unlike
//! the teacher, which reads `btrfs_super_block` straight out of a
//! `union` with `unsafe { transmute }`. That shortcut is exactly the
//! "reliance on compiler layout" the spec flags for re-architecture.

use crate::error::FsError;

pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    buf.extend_from_slice(v);
}

/// Cursor over an encoded byte slice with bounds-checked little-endian
/// reads. Returns `FsError::Invalid` on truncation rather than
/// panicking, since this is the boundary where on-disk corruption
/// first becomes visible to safe code.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FsError> {
        if self.remaining() < n {
            return Err(FsError::Invalid(format!(
                "truncated encoding: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8, FsError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, FsError> {
        let s = self.take(2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, FsError> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, FsError> {
        let s = self.take(8)?;
        Ok(u64::from_le_bytes([
            s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
        ]))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], FsError> {
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_fields() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 7);
        put_u16(&mut buf, 0x1234);
        put_u32(&mut buf, 0xdead_beef);
        put_u64(&mut buf, 0x0102_0304_0506_0708);
        put_bytes(&mut buf, b"tail");

        let mut r = Reader::new(&buf);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.get_bytes(4).unwrap(), b"tail");
    }

    #[test]
    fn truncation_is_an_error_not_a_panic() {
        let buf = vec![1, 2];
        let mut r = Reader::new(&buf);
        assert!(r.get_u32().is_err());
    }
}
