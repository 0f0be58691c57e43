//! On-disk superblock (spec §3 "Superblock", §6 "On-disk superblock").
//!
//! Grounded on the teacher's `btrfs_super_block`/`btrfs_dev_item`
//! (`structures.rs`) for the overall shape — magic, checksum, per-device
//! records, generation — but re-encoded through `crate::codec` instead
//! of `#[repr(C, packed)]` + `transmute`, per the §9 redesign note.

use crate::codec::{put_bytes, put_u16, put_u32, put_u64, put_u8, Reader};
use crate::error::FsError;
use crc::{Crc, CRC_32_ISCSI};

pub const MAGIC: u64 = 0xB1_CAC4_EF5B_0055;
pub const CURRENT_VERSION: u16 = 1;
pub const MAX_SB_OFFSETS: usize = 8;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn csum(bytes: &[u8]) -> u32 {
    CASTAGNOLI.checksum(bytes)
}

/// Per-device member record embedded in the superblock (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub uuid: [u8; 16],
    pub nbuckets: u64,
    pub bucket_size: u32,
    pub state: MemberState,
    pub group: u8,
    pub durability: u8,
    pub data_allowed: DataAllowed,
    /// Set once the one-shot freespace-initialisation pass (§4.C) has
    /// emitted secondary index keys for every alloc key on this device.
    pub freespace_initialized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemberState {
    Rw = 0,
    Ro = 1,
    Failed = 2,
    Spare = 3,
}

impl MemberState {
    fn from_u8(v: u8) -> Result<MemberState, FsError> {
        Ok(match v {
            0 => MemberState::Rw,
            1 => MemberState::Ro,
            2 => MemberState::Failed,
            3 => MemberState::Spare,
            other => return Err(FsError::Invalid(format!("bad member state {other}"))),
        })
    }
}

/// Which data types may be placed on this device (bitset, foreground/
/// background/promote/metadata targets per spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAllowed(pub u8);

impl DataAllowed {
    pub const JOURNAL: u8 = 1 << 0;
    pub const BTREE: u8 = 1 << 1;
    pub const USER: u8 = 1 << 2;

    pub const ALL: DataAllowed = DataAllowed(Self::JOURNAL | Self::BTREE | Self::USER);

    pub fn allows(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

/// Foreground/background/promote/metadata device-selection targets
/// (spec §6). Each is a device index, or `None` for "no preference".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Targets {
    pub foreground: Option<u8>,
    pub background: Option<u8>,
    pub promote: Option<u8>,
    pub metadata: Option<u8>,
}

/// A typed, length-prefixed payload field (spec §6: "members, crypt,
/// replicas, disk_groups, quota, journal, clean,
/// journal_seq_blacklist"). Fields the core doesn't itself interpret
/// are kept as opaque bytes, same spirit as `BkeyValue::Opaque`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperblockField {
    pub tag: u8,
    pub bytes: Vec<u8>,
}

pub mod field_tag {
    pub const CRYPT: u8 = 1;
    pub const REPLICAS: u8 = 2;
    pub const DISK_GROUPS: u8 = 3;
    pub const QUOTA: u8 = 4;
    pub const JOURNAL: u8 = 5;
    pub const CLEAN: u8 = 6;
    pub const JOURNAL_SEQ_BLACKLIST: u8 = 7;
    /// One field per device: `[dev_idx][one byte per bucket, 1 = free]`.
    /// Persists `alloc::meta::MetaAllocator`'s bitmap (see its module
    /// doc comment) across a mount so a bucket already handed out to a
    /// btree node, the superblock, or the journal isn't handed out
    /// again on reopen.
    pub const META_BITMAP: u8 = 8;
}

/// A range of journal sequence numbers that must be treated as never
/// having happened (spec §4.B "Replay"). Superblock field
/// `journal_seq_blacklist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistRange {
    pub start: u64,
    pub end_inclusive: u64,
}

impl BlacklistRange {
    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.start && seq <= self.end_inclusive
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags(pub u64);

impl FeatureFlags {
    pub const KEY_CACHE: u64 = 1 << 0;
    pub const LRU_BTREE: u64 = 1 << 1;

    pub fn has(&self, bit: u64) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    pub fs_uuid_internal: [u8; 16],
    pub fs_uuid_external: [u8; 16],
    pub version: u16,
    pub block_size_sectors: u16,
    pub nr_devices: u8,
    pub sb_offsets: Vec<u64>,
    pub members: Vec<MemberRecord>,
    pub features: FeatureFlags,
    pub targets: Targets,
    pub blacklist: Vec<BlacklistRange>,
    pub fields: Vec<SuperblockField>,
    /// Root pointer (as `(bucket_nr, gen, seq)` of the on-disk node) for
    /// every btree, indexed by `BtreeId as usize`.
    pub btree_roots: Vec<Option<(u8, u64, u8, u64)>>,
}

impl Superblock {
    pub fn new(fs_uuid_external: [u8; 16]) -> Superblock {
        Superblock {
            magic: MAGIC,
            fs_uuid_internal: fs_uuid_external,
            fs_uuid_external,
            version: CURRENT_VERSION,
            block_size_sectors: 8,
            nr_devices: 0,
            sb_offsets: vec![16, 32],
            members: Vec::new(),
            features: FeatureFlags::default(),
            targets: Targets::default(),
            blacklist: Vec::new(),
            fields: Vec::new(),
            btree_roots: vec![None; crate::btree_id::BtreeId::ALL.len()],
        }
    }

    pub fn is_blacklisted(&self, seq: u64) -> bool {
        self.blacklist.iter().any(|r| r.contains(seq))
    }

    /// Encode without checksum prefix; `encode` wraps this with the
    /// CSUM described in spec §6 ("all carry a CSUM").
    fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.magic);
        put_bytes(&mut buf, &self.fs_uuid_internal);
        put_bytes(&mut buf, &self.fs_uuid_external);
        put_u16(&mut buf, self.version);
        put_u16(&mut buf, self.block_size_sectors);
        put_u8(&mut buf, self.nr_devices);

        put_u8(&mut buf, self.sb_offsets.len() as u8);
        for off in &self.sb_offsets {
            put_u64(&mut buf, *off);
        }

        put_u32(&mut buf, self.members.len() as u32);
        for m in &self.members {
            put_bytes(&mut buf, &m.uuid);
            put_u64(&mut buf, m.nbuckets);
            put_u32(&mut buf, m.bucket_size);
            put_u8(&mut buf, m.state as u8);
            put_u8(&mut buf, m.group);
            put_u8(&mut buf, m.durability);
            put_u8(&mut buf, m.data_allowed.0);
            put_u8(&mut buf, m.freespace_initialized as u8);
        }

        put_u64(&mut buf, self.features.0);

        for t in [
            self.targets.foreground,
            self.targets.background,
            self.targets.promote,
            self.targets.metadata,
        ] {
            match t {
                Some(d) => {
                    put_u8(&mut buf, 1);
                    put_u8(&mut buf, d);
                }
                None => put_u8(&mut buf, 0),
            }
        }

        put_u32(&mut buf, self.blacklist.len() as u32);
        for r in &self.blacklist {
            put_u64(&mut buf, r.start);
            put_u64(&mut buf, r.end_inclusive);
        }

        put_u32(&mut buf, self.fields.len() as u32);
        for f in &self.fields {
            put_u8(&mut buf, f.tag);
            put_u32(&mut buf, f.bytes.len() as u32);
            put_bytes(&mut buf, &f.bytes);
        }

        put_u32(&mut buf, self.btree_roots.len() as u32);
        for r in &self.btree_roots {
            match r {
                Some((dev, bucket_nr, gen, seq)) => {
                    put_u8(&mut buf, 1);
                    put_u8(&mut buf, *dev);
                    put_u64(&mut buf, *bucket_nr);
                    put_u8(&mut buf, *gen);
                    put_u64(&mut buf, *seq);
                }
                None => put_u8(&mut buf, 0),
            }
        }

        buf
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut out = Vec::with_capacity(body.len() + 4);
        put_u32(&mut out, csum(&body));
        put_bytes(&mut out, &body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Superblock, FsError> {
        let mut r = Reader::new(bytes);
        let stored_csum = r.get_u32()?;
        let body = r.get_bytes(r.remaining())?;
        if csum(body) != stored_csum {
            return Err(FsError::Checksum {
                what: "superblock",
                at: 0,
            });
        }

        let mut r = Reader::new(body);
        let magic = r.get_u64()?;
        if magic != MAGIC {
            return Err(FsError::Invalid("bad superblock magic".into()));
        }
        let mut fs_uuid_internal = [0u8; 16];
        fs_uuid_internal.copy_from_slice(r.get_bytes(16)?);
        let mut fs_uuid_external = [0u8; 16];
        fs_uuid_external.copy_from_slice(r.get_bytes(16)?);
        let version = r.get_u16()?;
        let block_size_sectors = r.get_u16()?;
        let nr_devices = r.get_u8()?;

        let n_off = r.get_u8()? as usize;
        let mut sb_offsets = Vec::with_capacity(n_off);
        for _ in 0..n_off {
            sb_offsets.push(r.get_u64()?);
        }
        if sb_offsets.len() > MAX_SB_OFFSETS {
            return Err(FsError::Invalid("too many sb_offsets".into()));
        }

        let n_members = r.get_u32()? as usize;
        let mut members = Vec::with_capacity(n_members);
        for _ in 0..n_members {
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(r.get_bytes(16)?);
            let nbuckets = r.get_u64()?;
            let bucket_size = r.get_u32()?;
            let state = MemberState::from_u8(r.get_u8()?)?;
            let group = r.get_u8()?;
            let durability = r.get_u8()?;
            let data_allowed = DataAllowed(r.get_u8()?);
            let freespace_initialized = r.get_u8()? != 0;
            members.push(MemberRecord {
                uuid,
                nbuckets,
                bucket_size,
                state,
                group,
                durability,
                data_allowed,
                freespace_initialized,
            });
        }

        let features = FeatureFlags(r.get_u64()?);

        let mut targets = Targets::default();
        let mut read_target = |r: &mut Reader| -> Result<Option<u8>, FsError> {
            Ok(if r.get_u8()? != 0 {
                Some(r.get_u8()?)
            } else {
                None
            })
        };
        targets.foreground = read_target(&mut r)?;
        targets.background = read_target(&mut r)?;
        targets.promote = read_target(&mut r)?;
        targets.metadata = read_target(&mut r)?;

        let n_blacklist = r.get_u32()? as usize;
        let mut blacklist = Vec::with_capacity(n_blacklist);
        for _ in 0..n_blacklist {
            let start = r.get_u64()?;
            let end_inclusive = r.get_u64()?;
            blacklist.push(BlacklistRange { start, end_inclusive });
        }

        let n_fields = r.get_u32()? as usize;
        let mut fields = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            let tag = r.get_u8()?;
            let len = r.get_u32()? as usize;
            let bytes = r.get_bytes(len)?.to_vec();
            fields.push(SuperblockField { tag, bytes });
        }

        let n_roots = r.get_u32()? as usize;
        let mut btree_roots = Vec::with_capacity(n_roots);
        for _ in 0..n_roots {
            if r.get_u8()? != 0 {
                let dev = r.get_u8()?;
                let bucket_nr = r.get_u64()?;
                let gen = r.get_u8()?;
                let seq = r.get_u64()?;
                btree_roots.push(Some((dev, bucket_nr, gen, seq)));
            } else {
                btree_roots.push(None);
            }
        }

        Ok(Superblock {
            magic,
            fs_uuid_internal,
            fs_uuid_external,
            version,
            block_size_sectors,
            nr_devices,
            sb_offsets,
            members,
            features,
            targets,
            blacklist,
            fields,
            btree_roots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree_id::BtreeId;

    fn sample() -> Superblock {
        let mut sb = Superblock::new([7u8; 16]);
        sb.nr_devices = 2;
        sb.members.push(MemberRecord {
            uuid: [1u8; 16],
            nbuckets: 1024,
            bucket_size: 1 << 17,
            state: MemberState::Rw,
            group: 0,
            durability: 1,
            data_allowed: DataAllowed::ALL,
            freespace_initialized: true,
        });
        sb.blacklist.push(BlacklistRange {
            start: 7,
            end_inclusive: 10,
        });
        sb.fields.push(SuperblockField {
            tag: field_tag::CLEAN,
            bytes: vec![1],
        });
        sb.btree_roots[BtreeId::Alloc as usize] = Some((0, 3, 1, 42));
        sb
    }

    #[test]
    fn round_trips() {
        let sb = sample();
        let bytes = sb.encode();
        let decoded = Superblock::decode(&bytes).unwrap();
        assert_eq!(sb, decoded);
    }

    #[test]
    fn corrupted_bytes_fail_checksum() {
        let sb = sample();
        let mut bytes = sb.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            Superblock::decode(&bytes),
            Err(FsError::Checksum { .. })
        ));
    }

    #[test]
    fn blacklist_membership() {
        let sb = sample();
        assert!(sb.is_blacklisted(8));
        assert!(!sb.is_blacklisted(11));
    }
}
