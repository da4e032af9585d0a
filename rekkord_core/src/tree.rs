//! Encoding and decoding of Directory, File, Snapshot and Link blobs,
//! including the read-only legacy migration chain that rewrites historical
//! type codes to the modern layout before any decoder sees them.
//!
//! All layouts are little-endian, hand-rolled fixed-offset binary records
//! (never CBOR) — the legacy byte shuffles below exist so that snapshots
//! written by long-retired encoder versions still decode today without
//! ever being re-hashed under their old type code.

use crate::error::{RekkordError, RekkordResult};
use crate::oid::{Catalog, Hash, Oid, HASH_LEN};
use crate::wire::BlobType;

pub const DIRECTORY_HEADER_LEN: usize = 16;
pub const RAW_ENTRY_PREFIX_LEN: usize = 90;
pub const RAW_CHUNK_LEN: usize = 44;
pub const SNAPSHOT_HEADER2_LEN: usize = 536;
pub const SNAPSHOT_HEADER3_LEN: usize = 544;
pub const CHANNEL_LEN: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum EntryKind {
    Directory = 0,
    File = 1,
    Link = 2,
    Unknown = -1,
}

impl EntryKind {
    fn from_i8(v: i8) -> RekkordResult<Self> {
        Ok(match v {
            0 => EntryKind::Directory,
            1 => EntryKind::File,
            2 => EntryKind::Link,
            _ => {
                return Err(RekkordError::MalformedBlob {
                    oid: Oid::new(Catalog::Meta, Hash::from_bytes([0; HASH_LEN])),
                    reason: format!("unknown entry kind {v}"),
                });
            }
        })
    }

    /// The catalog a blob referenced by an entry of this kind lives in.
    pub fn catalog(self) -> Catalog {
        match self {
            EntryKind::Directory => Catalog::Meta,
            EntryKind::File | EntryKind::Link | EntryKind::Unknown => Catalog::Raw,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryFlags(pub u8);

impl EntryFlags {
    pub const STATED: u8 = 1 << 0;
    pub const READABLE: u8 = 1 << 1;
    pub const ACCESS_TIME: u8 = 1 << 2;

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u8, set: bool) -> Self {
        if set {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self
    }
}

/// One child of a Directory (or top-level entry of a Snapshot).
#[derive(Clone, Debug)]
pub struct Entry {
    pub hash: Hash,
    pub flags: EntryFlags,
    pub kind: EntryKind,
    pub name: String,
    pub mtime: i64,
    pub ctime: i64,
    pub atime: i64,
    pub btime: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: i64,
    pub extended: Vec<(String, Vec<u8>)>,
}

impl Entry {
    pub fn oid(&self) -> Oid {
        Oid::new(self.kind.catalog(), self.hash)
    }

    fn encode(&self, buf: &mut Vec<u8>) -> RekkordResult<()> {
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() > u16::MAX as usize {
            return Err(RekkordError::MalformedBlob {
                oid: self.oid(),
                reason: "entry name too long".into(),
            });
        }
        let extended_bytes = encode_extended(&self.extended);
        if extended_bytes.len() > u16::MAX as usize {
            return Err(RekkordError::MalformedBlob {
                oid: self.oid(),
                reason: "extended attribute payload too long".into(),
            });
        }

        buf.extend_from_slice(self.hash.as_bytes());
        buf.push(self.flags.0);
        buf.push(self.kind as i8 as u8);
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(extended_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.extend_from_slice(&self.ctime.to_le_bytes());
        buf.extend_from_slice(&self.atime.to_le_bytes());
        buf.extend_from_slice(&self.btime.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(name_bytes);
        buf.extend_from_slice(&extended_bytes);
        Ok(())
    }

    /// Decodes one entry starting at `buf[offset..]`, returning it plus the
    /// offset just past it. `allow_separators` permits `/` in `name` —
    /// only true for a snapshot's own top-level entries.
    fn decode(buf: &[u8], offset: usize, allow_separators: bool) -> RekkordResult<(Entry, usize)> {
        let bad = |reason: &str| RekkordError::MalformedBlob {
            oid: Oid::new(Catalog::Meta, Hash::from_bytes([0; HASH_LEN])),
            reason: reason.to_string(),
        };

        if buf.len() - offset < RAW_ENTRY_PREFIX_LEN {
            return Err(bad("truncated entry prefix"));
        }

        let mut hash_bytes = [0u8; HASH_LEN];
        hash_bytes.copy_from_slice(&buf[offset..offset + HASH_LEN]);
        let hash = Hash::from_bytes(hash_bytes);

        let flags = EntryFlags(buf[offset + 32]);
        let kind = EntryKind::from_i8(buf[offset + 33] as i8)?;
        let name_len = u16::from_le_bytes([buf[offset + 34], buf[offset + 35]]) as usize;
        let extended_len = u16::from_le_bytes([buf[offset + 36], buf[offset + 37]]) as usize;

        let i64_at = |o: usize| i64::from_le_bytes(buf[offset + o..offset + o + 8].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(buf[offset + o..offset + o + 4].try_into().unwrap());

        let mtime = i64_at(38);
        let ctime = i64_at(46);
        let atime = i64_at(54);
        let btime = i64_at(62);
        let uid = u32_at(70);
        let gid = u32_at(74);
        let mode = u32_at(78);
        let size = i64_at(82);

        let total = RAW_ENTRY_PREFIX_LEN + name_len + extended_len;
        if buf.len() - offset < total {
            return Err(bad("truncated entry name/extended payload"));
        }

        let name_start = offset + RAW_ENTRY_PREFIX_LEN;
        let name = std::str::from_utf8(&buf[name_start..name_start + name_len])
            .map_err(|_| bad("entry name is not valid UTF-8"))?
            .to_string();
        validate_name(&name, allow_separators)?;

        let extended_start = name_start + name_len;
        let extended = decode_extended(&buf[extended_start..extended_start + extended_len])?;

        let entry = Entry {
            hash,
            flags,
            kind,
            name,
            mtime,
            ctime,
            atime,
            btime,
            uid,
            gid,
            mode,
            size,
            extended,
        };

        Ok((entry, offset + total))
    }
}

fn validate_name(name: &str, allow_separators: bool) -> RekkordResult<()> {
    let unsafe_name = || RekkordError::UnsafeName { name: name.to_string() };

    if name.is_empty() {
        return Err(unsafe_name());
    }
    if name.split(['/', '\\']).any(|part| part == "..") {
        return Err(unsafe_name());
    }
    if !allow_separators && (name.contains('/') || name.contains('\\')) {
        return Err(unsafe_name());
    }
    if allow_separators && (name.starts_with('/') || name.starts_with('\\')) {
        // Top-level snapshot entries store an already-normalized relative
        // path (a leading `/` or drive letter becomes a single component).
        return Err(unsafe_name());
    }
    Ok(())
}

fn encode_extended(extended: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (key, value) in extended {
        let mut record = Vec::with_capacity(key.len() + 1 + value.len());
        record.extend_from_slice(key.as_bytes());
        record.push(0);
        record.extend_from_slice(value);
        buf.extend_from_slice(&(record.len() as u16).to_le_bytes());
        buf.extend_from_slice(&record);
    }
    buf
}

fn decode_extended(buf: &[u8]) -> RekkordResult<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        if buf.len() - offset < 2 {
            return Err(RekkordError::MalformedBlob {
                oid: Oid::new(Catalog::Raw, Hash::from_bytes([0; HASH_LEN])),
                reason: "truncated extended attribute length prefix".into(),
            });
        }
        let len = u16::from_le_bytes([buf[offset], buf[offset + 1]]) as usize;
        offset += 2;
        if buf.len() - offset < len {
            return Err(RekkordError::MalformedBlob {
                oid: Oid::new(Catalog::Raw, Hash::from_bytes([0; HASH_LEN])),
                reason: "overlong extended attribute record".into(),
            });
        }
        let record = &buf[offset..offset + len];
        let nul = record
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RekkordError::MalformedBlob {
                oid: Oid::new(Catalog::Raw, Hash::from_bytes([0; HASH_LEN])),
                reason: "extended attribute record missing key terminator".into(),
            })?;
        let key = std::str::from_utf8(&record[..nul])
            .map_err(|_| RekkordError::MalformedBlob {
                oid: Oid::new(Catalog::Raw, Hash::from_bytes([0; HASH_LEN])),
                reason: "extended attribute key is not valid UTF-8".into(),
            })?
            .to_string();
        let value = record[nul + 1..].to_vec();
        out.push((key, value));
        offset += len;
    }
    Ok(out)
}

/// A decoded Directory blob: recursive byte size / entry count plus its
/// immediate children.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    pub size: i64,
    pub entries: i64,
    pub children: Vec<Entry>,
}

impl Directory {
    pub fn encode(&self) -> RekkordResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(DIRECTORY_HEADER_LEN + self.children.len() * 128);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.entries.to_le_bytes());
        for child in &self.children {
            child.encode(&mut buf)?;
        }
        Ok(buf)
    }

    /// `allow_separators` is true only when decoding a snapshot's root
    /// directory, whose immediate children are the top-level save paths.
    pub fn decode(buf: &[u8], allow_separators: bool) -> RekkordResult<Self> {
        if buf.len() < DIRECTORY_HEADER_LEN {
            return Err(RekkordError::MalformedBlob {
                oid: Oid::new(Catalog::Meta, Hash::from_bytes([0; HASH_LEN])),
                reason: "directory blob shorter than its header".into(),
            });
        }
        let size = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let entries = i64::from_le_bytes(buf[8..16].try_into().unwrap());

        let mut children = Vec::new();
        let mut offset = DIRECTORY_HEADER_LEN;
        while offset < buf.len() {
            let (entry, next) = Entry::decode(buf, offset, allow_separators)?;
            children.push(entry);
            offset = next;
        }

        Ok(Directory { size, entries, children })
    }
}

/// One chunk reference inside a File blob.
#[derive(Clone, Copy, Debug)]
pub struct RawChunk {
    pub offset: i64,
    pub len: i32,
    pub hash: Hash,
}

#[derive(Clone, Debug, Default)]
pub struct FileBlob {
    pub chunks: Vec<RawChunk>,
    pub total_size: i64,
}

impl FileBlob {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.chunks.len() * RAW_CHUNK_LEN + 8);
        for chunk in &self.chunks {
            buf.extend_from_slice(&chunk.offset.to_le_bytes());
            buf.extend_from_slice(&chunk.len.to_le_bytes());
            buf.extend_from_slice(chunk.hash.as_bytes());
        }
        buf.extend_from_slice(&self.total_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> RekkordResult<Self> {
        let bad = |reason: &str| RekkordError::MalformedBlob {
            oid: Oid::new(Catalog::Raw, Hash::from_bytes([0; HASH_LEN])),
            reason: reason.to_string(),
        };

        if buf.len() < 8 {
            return Err(bad("file blob shorter than its trailing size"));
        }
        let chunk_region = &buf[..buf.len() - 8];
        if chunk_region.len() % RAW_CHUNK_LEN != 0 {
            return Err(bad("file blob chunk region is not a multiple of the chunk record size"));
        }

        let mut chunks = Vec::with_capacity(chunk_region.len() / RAW_CHUNK_LEN);
        let mut last_end: Option<i64> = None;
        for raw in chunk_region.chunks_exact(RAW_CHUNK_LEN) {
            let offset = i64::from_le_bytes(raw[0..8].try_into().unwrap());
            let len = i32::from_le_bytes(raw[8..12].try_into().unwrap());
            let mut hash_bytes = [0u8; HASH_LEN];
            hash_bytes.copy_from_slice(&raw[12..12 + HASH_LEN]);
            let hash = Hash::from_bytes(hash_bytes);

            if let Some(prev_end) = last_end {
                if offset < prev_end {
                    return Err(bad("file blob chunk ranges are out of order or overlapping"));
                }
            }
            last_end = Some(offset + len as i64);

            chunks.push(RawChunk { offset, len, hash });
        }

        let total_size = i64::from_le_bytes(buf[buf.len() - 8..].try_into().unwrap());
        if let Some(last) = chunks.last() {
            if total_size != last.offset + last.len as i64 {
                return Err(bad("file blob total_size does not match last chunk's end"));
            }
        } else if total_size != 0 {
            return Err(bad("empty file blob must have total_size 0"));
        }

        Ok(FileBlob { chunks, total_size })
    }
}

/// The fixed 544-byte Snapshot header (modern `SnapshotHeader3` layout).
#[derive(Clone, Debug)]
pub struct SnapshotHeader {
    pub time: i64,
    pub size: i64,
    pub stored: i64,
    /// Bytes newly written by this save (not already present). Zero means
    /// "unknown" for snapshots written before this field existed, not
    /// "nothing new was added" — treat it as not-yet-tracked, not zero.
    pub added: i64,
    pub channel: String,
}

impl SnapshotHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SNAPSHOT_HEADER3_LEN);
        buf.extend_from_slice(&self.time.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.stored.to_le_bytes());
        buf.extend_from_slice(&self.added.to_le_bytes());
        let mut channel_field = [0u8; CHANNEL_LEN];
        let channel_bytes = self.channel.as_bytes();
        let n = channel_bytes.len().min(CHANNEL_LEN - 1);
        channel_field[..n].copy_from_slice(&channel_bytes[..n]);
        buf.extend_from_slice(&channel_field);
        buf
    }

    pub fn decode(buf: &[u8]) -> RekkordResult<Self> {
        if buf.len() < SNAPSHOT_HEADER3_LEN {
            return Err(RekkordError::MalformedBlob {
                oid: Oid::new(Catalog::Meta, Hash::from_bytes([0; HASH_LEN])),
                reason: "snapshot blob shorter than its header".into(),
            });
        }
        let time = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let size = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let stored = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        let added = i64::from_le_bytes(buf[24..32].try_into().unwrap());
        let channel_field = &buf[32..32 + CHANNEL_LEN];
        let nul = channel_field.iter().position(|&b| b == 0).unwrap_or(CHANNEL_LEN);
        let channel = std::str::from_utf8(&channel_field[..nul])
            .map_err(|_| RekkordError::MalformedBlob {
                oid: Oid::new(Catalog::Meta, Hash::from_bytes([0; HASH_LEN])),
                reason: "snapshot channel is not valid UTF-8".into(),
            })?
            .to_string();

        Ok(SnapshotHeader { time, size, stored, added, channel })
    }
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub root: Directory,
}

impl Snapshot {
    pub fn encode(&self) -> RekkordResult<Vec<u8>> {
        let mut buf = self.header.encode();
        buf.extend_from_slice(&self.root.encode()?);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> RekkordResult<Self> {
        let header = SnapshotHeader::decode(buf)?;
        let root = Directory::decode(&buf[SNAPSHOT_HEADER3_LEN..], true)?;
        Ok(Snapshot { header, root })
    }
}

/// Encodes the payload a tag carries alongside a snapshot's OID: the
/// header fields plus `channel`, but — unlike the on-disk `SnapshotHeader`
/// — with `channel` written at its actual length rather than padded to 512
/// bytes, so the tag never carries trailing NUL padding.
pub fn encode_snapshot_tag_payload(header: &SnapshotHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + 2 + header.channel.len());
    buf.extend_from_slice(&header.time.to_le_bytes());
    buf.extend_from_slice(&header.size.to_le_bytes());
    buf.extend_from_slice(&header.stored.to_le_bytes());
    buf.extend_from_slice(&header.added.to_le_bytes());
    let channel_bytes = header.channel.as_bytes();
    buf.extend_from_slice(&(channel_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(channel_bytes);
    buf
}

pub fn decode_snapshot_tag_payload(buf: &[u8]) -> RekkordResult<SnapshotHeader> {
    let bad = || RekkordError::Other(anyhow::anyhow!("malformed tag payload"));
    if buf.len() < 34 {
        return Err(bad());
    }
    let time = i64::from_le_bytes(buf[0..8].try_into().unwrap());
    let size = i64::from_le_bytes(buf[8..16].try_into().unwrap());
    let stored = i64::from_le_bytes(buf[16..24].try_into().unwrap());
    let added = i64::from_le_bytes(buf[24..32].try_into().unwrap());
    let channel_len = u16::from_le_bytes([buf[32], buf[33]]) as usize;
    if buf.len() < 34 + channel_len {
        return Err(bad());
    }
    let channel = std::str::from_utf8(&buf[34..34 + channel_len]).map_err(|_| bad())?.to_string();
    Ok(SnapshotHeader { time, size, stored, added, channel })
}

/// Migrates a raw blob buffer of historical `blob_type` to the modern
/// layout implied by its kind, returning the modern type code that the
/// rest of the core should treat it as. A no-op for already-modern types.
/// Never re-hashes: the blob's OID is stable across this rewrite.
pub fn migrate_legacy(blob_type: BlobType, mut buf: Vec<u8>) -> (BlobType, Vec<u8>) {
    use BlobType::*;

    if blob_type.is_directory_like() {
        match blob_type {
            Directory1 => {
                migrate_legacy_entries_1(&mut buf, 0);
                migrate_legacy_entries_2(&mut buf, 0);
                migrate_legacy_entries_3(&mut buf, 0);
            }
            Directory2 => {
                migrate_legacy_entries_2(&mut buf, 0);
                migrate_legacy_entries_3(&mut buf, 0);
            }
            Directory3 => {
                migrate_legacy_entries_3(&mut buf, 0);
            }
            _ => {}
        }
        return (Directory, buf);
    }

    if blob_type.is_snapshot_like() {
        match blob_type {
            Snapshot1 => {
                migrate_legacy_snapshot_1(&mut buf);
                migrate_legacy_entries_1(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_entries_2(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_entries_3(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_snapshot_2(&mut buf);
            }
            Snapshot2 => {
                migrate_legacy_entries_1(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_entries_2(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_entries_3(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_snapshot_2(&mut buf);
            }
            Snapshot3 => {
                migrate_legacy_entries_2(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_entries_3(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_snapshot_2(&mut buf);
            }
            Snapshot4 => {
                migrate_legacy_entries_3(&mut buf, SNAPSHOT_HEADER2_LEN);
                migrate_legacy_snapshot_2(&mut buf);
            }
            Snapshot5 => {
                migrate_legacy_snapshot_2(&mut buf);
            }
            _ => {}
        }
        return (Snapshot, buf);
    }

    (blob_type, buf)
}

/// `Directory1 -> Directory2`: inserts the 16-byte `DirectoryHeader` in
/// front of what used to be a bare leading `size: i64`, zeroing the new
/// `entries` count (entries were never counted in this format).
fn migrate_legacy_entries_1(blob: &mut Vec<u8>, start: usize) {
    if blob.len() < start + 8 {
        return;
    }
    blob.splice(start + 8..start + 8, [0u8; 8]);
}

/// Entry common prefix (hash/flags/kind/name_len/extended_len) while `kind`
/// is still the legacy 2-byte field, i.e. the shape entries have from
/// `Directory1` through `Directory3` (narrowing to 1 byte is the last step,
/// performed by [`migrate_legacy_entries_3`]).
const ENTRY_COMMON_LEN_WIDE_KIND: usize = 39;

/// `Directory2 -> Directory3`: widens every entry by inserting a zeroed
/// 8-byte `atime` field between `ctime` and `btime`. `kind` is still 2 bytes
/// wide at this point (see [`migrate_legacy_entries_3`]).
fn migrate_legacy_entries_2(blob: &mut Vec<u8>, start: usize) {
    // hash+flags+kind(2)+name_len+extended_len (39) + mtime+ctime+btime (24)
    // + uid+gid+mode+size (20), no atime yet.
    const OLD_PREFIX_LEN: usize = ENTRY_COMMON_LEN_WIDE_KIND + 24 + 20;
    const CTIME_END: usize = ENTRY_COMMON_LEN_WIDE_KIND + 16; // through mtime+ctime

    let mut offset = start + DIRECTORY_HEADER_LEN;
    let mut rebuilt = Vec::new();

    while offset < blob.len() {
        if blob.len() - offset < OLD_PREFIX_LEN {
            break;
        }
        let name_len =
            u16::from_le_bytes([blob[offset + ENTRY_COMMON_LEN_WIDE_KIND - 4], blob[offset + ENTRY_COMMON_LEN_WIDE_KIND - 3]])
                as usize;
        let extended_len =
            u16::from_le_bytes([blob[offset + ENTRY_COMMON_LEN_WIDE_KIND - 2], blob[offset + ENTRY_COMMON_LEN_WIDE_KIND - 1]])
                as usize;
        let old_total = OLD_PREFIX_LEN + name_len + extended_len;
        if blob.len() - offset < old_total {
            break;
        }

        let entry = &blob[offset..offset + old_total];
        rebuilt.extend_from_slice(&entry[0..CTIME_END]); // hash..ctime
        rebuilt.extend_from_slice(&[0u8; 8]); // atime, previously absent
        rebuilt.extend_from_slice(&entry[CTIME_END..OLD_PREFIX_LEN]); // btime,uid,gid,mode,size
        rebuilt.extend_from_slice(&entry[OLD_PREFIX_LEN..old_total]); // name + extended

        offset += old_total;
    }

    blob.truncate(start + DIRECTORY_HEADER_LEN);
    blob.extend_from_slice(&rebuilt);
}

/// `Directory3 -> Directory`: narrows the legacy 2-byte `kind` field to the
/// modern 1 byte (dropping its always-zero high byte), shifting every later
/// field back by 1. Entries reaching this step already carry `atime` (see
/// [`migrate_legacy_entries_2`]).
fn migrate_legacy_entries_3(blob: &mut Vec<u8>, start: usize) {
    // hash+flags+kind(2)+name_len+extended_len (39) + mtime+ctime+atime+btime
    // (32) + uid+gid+mode (12) + size (8) = 91.
    const OLD_PREFIX_LEN: usize = ENTRY_COMMON_LEN_WIDE_KIND + 32 + 12 + 8;

    let mut offset = start + DIRECTORY_HEADER_LEN;
    let mut rebuilt = Vec::new();

    while offset < blob.len() {
        if blob.len() - offset < OLD_PREFIX_LEN {
            break;
        }
        let name_len =
            u16::from_le_bytes([blob[offset + ENTRY_COMMON_LEN_WIDE_KIND - 4], blob[offset + ENTRY_COMMON_LEN_WIDE_KIND - 3]])
                as usize;
        let extended_len =
            u16::from_le_bytes([blob[offset + ENTRY_COMMON_LEN_WIDE_KIND - 2], blob[offset + ENTRY_COMMON_LEN_WIDE_KIND - 1]])
                as usize;
        let old_total = OLD_PREFIX_LEN + name_len + extended_len;
        if blob.len() - offset < old_total {
            break;
        }

        let entry = &blob[offset..offset + old_total];
        rebuilt.extend_from_slice(&entry[0..33]); // hash + flags
        rebuilt.push(entry[33]); // kind's low byte; the high byte (34) is always zero
        rebuilt.extend_from_slice(&entry[35..old_total]); // name_len onward

        offset += old_total;
    }

    blob.truncate(start + DIRECTORY_HEADER_LEN);
    blob.extend_from_slice(&rebuilt);
}

/// `Snapshot1 -> Snapshot2`: reorders the fixed header fields in place
/// (`channel` moves from first to last); total length (536 bytes) is
/// unchanged.
fn migrate_legacy_snapshot_1(blob: &mut [u8]) {
    if blob.len() < SNAPSHOT_HEADER2_LEN {
        return;
    }
    let channel: Vec<u8> = blob[0..CHANNEL_LEN].to_vec();
    let time: [u8; 8] = blob[CHANNEL_LEN..CHANNEL_LEN + 8].try_into().unwrap();
    let size: [u8; 8] = blob[CHANNEL_LEN + 8..CHANNEL_LEN + 16].try_into().unwrap();
    let stored: [u8; 8] = blob[CHANNEL_LEN + 16..CHANNEL_LEN + 24].try_into().unwrap();

    blob[0..8].copy_from_slice(&time);
    blob[8..16].copy_from_slice(&size);
    blob[16..24].copy_from_slice(&stored);
    blob[24..24 + CHANNEL_LEN].copy_from_slice(&channel);
}

/// `Snapshot2/3/4/5 -> Snapshot`: widens the header from 536 to 544 bytes
/// by inserting the zero-filled `added: i64` field right before `channel`.
/// This shifts the trailing directory bytes too, which is fine — it runs
/// only after the directory embedded at the old 536-byte offset has
/// already been migrated to its modern entry layout.
fn migrate_legacy_snapshot_2(blob: &mut Vec<u8>) {
    if blob.len() < 24 {
        return;
    }
    blob.splice(24..24, [0u8; 8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(name: &str) -> Entry {
        Entry {
            hash: Hash::from_bytes([7; HASH_LEN]),
            flags: EntryFlags(EntryFlags::STATED | EntryFlags::READABLE),
            kind: EntryKind::File,
            name: name.to_string(),
            mtime: 1,
            ctime: 2,
            atime: 3,
            btime: 4,
            uid: 1000,
            gid: 1000,
            mode: 0o644,
            size: 123,
            extended: vec![("user.test".to_string(), vec![1, 2, 3])],
        }
    }

    #[test]
    fn directory_round_trips() {
        let dir = Directory {
            size: 999,
            entries: 3,
            children: vec![sample_entry("a.txt"), sample_entry("b.txt")],
        };
        let encoded = dir.encode().unwrap();
        let decoded = Directory::decode(&encoded, false).unwrap();
        assert_eq!(decoded.size, 999);
        assert_eq!(decoded.entries, 3);
        assert_eq!(decoded.children.len(), 2);
        assert_eq!(decoded.children[0].name, "a.txt");
        assert_eq!(decoded.children[1].extended[0].1, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_unsafe_names() {
        let mut dir = Directory::default();
        dir.children.push(sample_entry("../evil"));
        let encoded = dir.encode().unwrap();
        assert!(Directory::decode(&encoded, false).is_err());

        let mut dir2 = Directory::default();
        dir2.children.push(sample_entry("a/b"));
        let encoded2 = dir2.encode().unwrap();
        assert!(Directory::decode(&encoded2, false).is_err());
    }

    #[test]
    fn snapshot_top_level_allows_separators() {
        let mut dir = Directory::default();
        dir.children.push(sample_entry("home/alice"));
        let encoded = dir.encode().unwrap();
        assert!(Directory::decode(&encoded, true).is_ok());
    }

    #[test]
    fn file_blob_round_trips() {
        let file = FileBlob {
            chunks: vec![
                RawChunk { offset: 0, len: 100, hash: Hash::from_bytes([1; HASH_LEN]) },
                RawChunk { offset: 100, len: 50, hash: Hash::from_bytes([2; HASH_LEN]) },
            ],
            total_size: 150,
        };
        let encoded = file.encode();
        let decoded = FileBlob::decode(&encoded).unwrap();
        assert_eq!(decoded.total_size, 150);
        assert_eq!(decoded.chunks.len(), 2);
    }

    #[test]
    fn file_blob_rejects_overlap() {
        let file = FileBlob {
            chunks: vec![
                RawChunk { offset: 0, len: 100, hash: Hash::from_bytes([1; HASH_LEN]) },
                RawChunk { offset: 50, len: 50, hash: Hash::from_bytes([2; HASH_LEN]) },
            ],
            total_size: 100,
        };
        let encoded = file.encode();
        assert!(FileBlob::decode(&encoded).is_err());
    }

    #[test]
    fn snapshot_round_trips() {
        let snap = Snapshot {
            header: SnapshotHeader {
                time: 1_700_000_000,
                size: 1000,
                stored: 900,
                added: 0,
                channel: "daily".to_string(),
            },
            root: Directory {
                size: 1000,
                entries: 1,
                children: vec![sample_entry("home/alice/file.txt")],
            },
        };
        let encoded = snap.encode().unwrap();
        let decoded = Snapshot::decode(&encoded).unwrap();
        assert_eq!(decoded.header.channel, "daily");
        assert_eq!(decoded.root.children.len(), 1);
    }

    #[test]
    fn legacy_directory1_migrates_to_modern() {
        // Build a Directory1 buffer: bare `size: i64` then one old-style
        // (pre-atime, 2-byte kind) entry.
        let mut buf = Vec::new();
        buf.extend_from_slice(&42i64.to_le_bytes()); // size

        let name = b"old.txt";
        buf.extend_from_slice(&[9u8; HASH_LEN]); // hash
        buf.push(EntryFlags::STATED | EntryFlags::READABLE); // flags
        buf.extend_from_slice(&1i16.to_le_bytes()); // kind (File), legacy 2 bytes
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes()); // name_len
        buf.extend_from_slice(&0u16.to_le_bytes()); // extended_len
        buf.extend_from_slice(&10i64.to_le_bytes()); // mtime
        buf.extend_from_slice(&20i64.to_le_bytes()); // ctime
        buf.extend_from_slice(&30i64.to_le_bytes()); // btime (no atime yet)
        buf.extend_from_slice(&1000u32.to_le_bytes()); // uid
        buf.extend_from_slice(&1000u32.to_le_bytes()); // gid
        buf.extend_from_slice(&0o644u32.to_le_bytes()); // mode
        buf.extend_from_slice(&7i64.to_le_bytes()); // size
        buf.extend_from_slice(name);

        let (modern_type, migrated) = migrate_legacy(BlobType::Directory1, buf);
        assert_eq!(modern_type, BlobType::Directory);

        let dir = Directory::decode(&migrated, false).unwrap();
        assert_eq!(dir.size, 42);
        assert_eq!(dir.entries, 0); // Directory1 never counted entries
        assert_eq!(dir.children.len(), 1);
        assert_eq!(dir.children[0].name, "old.txt");
        assert_eq!(dir.children[0].mtime, 10);
        assert_eq!(dir.children[0].ctime, 20);
        assert_eq!(dir.children[0].atime, 0); // inserted, zeroed
        assert_eq!(dir.children[0].btime, 30);
        assert_eq!(dir.children[0].kind, EntryKind::File);
        assert_eq!(dir.children[0].size, 7);
    }

    #[test]
    fn legacy_snapshot1_migrates_header_and_directory() {
        let mut buf = Vec::new();
        let mut channel_field = [0u8; CHANNEL_LEN];
        channel_field[..5].copy_from_slice(b"daily");
        buf.extend_from_slice(&channel_field);
        buf.extend_from_slice(&123i64.to_le_bytes()); // time
        buf.extend_from_slice(&456i64.to_le_bytes()); // size
        buf.extend_from_slice(&789i64.to_le_bytes()); // stored
        buf.extend_from_slice(&0i64.to_le_bytes()); // Directory1's bare size field

        let (modern_type, migrated) = migrate_legacy(BlobType::Snapshot1, buf);
        assert_eq!(modern_type, BlobType::Snapshot);

        let snap = Snapshot::decode(&migrated).unwrap();
        assert_eq!(snap.header.channel, "daily");
        assert_eq!(snap.header.time, 123);
        assert_eq!(snap.header.size, 456);
        assert_eq!(snap.header.stored, 789);
        assert_eq!(snap.header.added, 0);
        assert_eq!(snap.root.children.len(), 0);
    }
}
