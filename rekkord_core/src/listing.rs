//! Read-only reporting and navigation over a repository's blob graph:
//! listing a directory's children, resolving a human-readable
//! `channel[:path]` identifier to an OID, reading a symlink target, and
//! opening a file for random-access chunk reads. None of this is
//! content-addressed storage itself — it's the small amount of navigation
//! machinery `locate` and the restore pipeline both need to mean anything.

use std::sync::Arc;

use crate::error::{RekkordError, RekkordResult};
use crate::oid::{Catalog, Oid};
use crate::repository::Repository;
use crate::store::ObjectStore;
use crate::tree::{decode_snapshot_tag_payload, Directory, EntryKind, FileBlob, SnapshotHeader};
use crate::wire::BlobType;

/// One child of a directory or snapshot root, as seen by a listing caller.
#[derive(Clone, Debug)]
pub struct ObjectInfo {
    pub oid: Oid,
    pub name: String,
    pub kind: EntryKind,
    pub size: i64,
    pub mtime: i64,
    pub readable: bool,
}

/// A snapshot known to the repository via one of its tags.
#[derive(Clone, Debug)]
pub struct SnapshotInfo {
    pub tag_name: String,
    pub oid: Oid,
    pub header: SnapshotHeader,
}

/// Lists the immediate children of a Directory or Snapshot blob.
pub async fn list_children<S: ObjectStore>(repo: &Repository<S>, oid: Oid) -> RekkordResult<Vec<ObjectInfo>> {
    let read = repo.read_blob(oid).await?;
    if !(read.blob_type.is_directory_like() || read.blob_type.is_snapshot_like()) {
        return Err(RekkordError::MalformedBlob { oid, reason: "not a directory or snapshot blob".into() });
    }

    let allow_separators = read.blob_type.is_snapshot_like();
    let (directory_bytes, top_level) = if read.blob_type.is_snapshot_like() {
        (&read.plaintext[crate::tree::SNAPSHOT_HEADER3_LEN..], true)
    } else {
        (&read.plaintext[..], false)
    };
    let _ = top_level;

    let dir = Directory::decode(directory_bytes, allow_separators)?;
    Ok(dir
        .children
        .into_iter()
        .map(|entry| ObjectInfo {
            oid: entry.oid(),
            name: entry.name,
            kind: entry.kind,
            size: entry.size,
            mtime: entry.mtime,
            readable: entry.flags.has(crate::tree::EntryFlags::READABLE),
        })
        .collect())
}

/// Returns every snapshot advertised by a tag, newest first. Tags that
/// fail to decode are skipped (already logged by [`Repository::list_tags`]).
pub async fn list_snapshots<S: ObjectStore>(repo: &Repository<S>) -> RekkordResult<Vec<SnapshotInfo>> {
    let tags = repo.list_tags().await?;
    let mut out = Vec::new();
    for tag in tags {
        match decode_snapshot_tag_payload(&tag.payload) {
            Ok(header) => out.push(SnapshotInfo { tag_name: tag.name, oid: tag.oid, header }),
            Err(_) => tracing::warn!(tag = %tag.name, "skipping tag with an undecodable snapshot payload"),
        }
    }
    out.sort_by(|a, b| b.header.time.cmp(&a.header.time));
    Ok(out)
}

/// Every distinct channel name currently advertised by a tag.
pub async fn list_channels<S: ObjectStore>(repo: &Repository<S>) -> RekkordResult<Vec<String>> {
    let snapshots = list_snapshots(repo).await?;
    let mut channels: Vec<String> = snapshots.into_iter().map(|s| s.header.channel).collect();
    channels.sort();
    channels.dedup();
    Ok(channels)
}

/// Resolves a human-readable identifier to an [`Oid`]: either a literal
/// `<catalog><hex>` OID, or `channel[:path]` (the most recent snapshot on
/// that channel, optionally walked down to a nested entry).
pub async fn locate<S: ObjectStore>(repo: &Repository<S>, identifier: &str) -> RekkordResult<Oid> {
    if let Some(oid) = Oid::parse(identifier) {
        return Ok(oid);
    }

    let (channel, path) = match identifier.split_once(':') {
        Some((c, p)) => (c, Some(p)),
        None => (identifier, None),
    };

    let snapshots = list_snapshots(repo).await?;
    let snapshot = snapshots
        .into_iter()
        .find(|s| s.header.channel == channel)
        .ok_or_else(|| RekkordError::Other(anyhow::anyhow!("no snapshot found for channel '{channel}'")))?;

    let Some(path) = path else {
        return Ok(snapshot.oid);
    };

    let mut current = snapshot.oid;
    for (i, segment) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
        let children = list_children(repo, current).await?;
        let child = children
            .into_iter()
            .find(|c| c.name == segment || (i == 0 && c.name.ends_with(segment)))
            .ok_or_else(|| RekkordError::Other(anyhow::anyhow!("no entry named '{segment}' under this snapshot")))?;
        current = child.oid;
    }
    Ok(current)
}

/// Reads a Link blob's raw target bytes as a string.
pub async fn read_link<S: ObjectStore>(repo: &Repository<S>, oid: Oid) -> RekkordResult<String> {
    let read = repo.read_blob(oid).await?;
    if read.blob_type != BlobType::Link {
        return Err(RekkordError::MalformedBlob { oid, reason: "not a link blob".into() });
    }
    String::from_utf8(read.plaintext).map_err(|_| RekkordError::MalformedBlob { oid, reason: "link target is not valid UTF-8".into() })
}

/// A random-access reader over a file's chunk list, used by the restore
/// pipeline's per-chunk writer and available to any future interactive
/// consumer (e.g. a FUSE mount).
pub struct FileHandle<S: ObjectStore> {
    repo: Arc<Repository<S>>,
    chunks: Vec<crate::tree::RawChunk>,
    total_size: i64,
}

impl<S: ObjectStore> FileHandle<S> {
    pub fn total_size(&self) -> i64 {
        self.total_size
    }

    /// The chunk list backing this file, in non-decreasing offset order.
    pub fn chunks(&self) -> &[crate::tree::RawChunk] {
        &self.chunks
    }

    /// Fetches every chunk covering `[offset, offset+len)` and returns the
    /// concatenated bytes. Chunk boundaries need not align with the
    /// requested range.
    pub async fn read_at(&self, offset: i64, len: i64) -> RekkordResult<Vec<u8>> {
        let end = offset + len;
        let mut out = Vec::with_capacity(len.max(0) as usize);
        for chunk in &self.chunks {
            let chunk_end = chunk.offset + chunk.len as i64;
            if chunk_end <= offset || chunk.offset >= end {
                continue;
            }
            let read = self.repo.read_blob(Oid::new(Catalog::Raw, chunk.hash)).await?;
            let lo = (offset - chunk.offset).max(0) as usize;
            let hi = (end - chunk.offset).min(chunk.len as i64) as usize;
            out.extend_from_slice(&read.plaintext[lo..hi]);
        }
        Ok(out)
    }
}

/// Opens `oid` for random-access reads. `oid` may be a `File` blob (an
/// explicit chunk list) or a bare `Chunk` blob (a file that fit in exactly
/// one chunk — no wrapping File blob is written in that case).
pub async fn open_file<S: ObjectStore>(repo: Arc<Repository<S>>, oid: Oid) -> RekkordResult<FileHandle<S>> {
    let read = repo.read_blob(oid).await?;
    let (chunks, total_size) = match read.blob_type {
        BlobType::File => {
            let file = FileBlob::decode(&read.plaintext)?;
            (file.chunks, file.total_size)
        }
        BlobType::Chunk => {
            let len = read.plaintext.len() as i64;
            (vec![crate::tree::RawChunk { offset: 0, len: len as i32, hash: oid.hash }], len)
        }
        _ => return Err(RekkordError::MalformedBlob { oid, reason: "not a file or chunk blob".into() }),
    };
    Ok(FileHandle { repo, chunks, total_size })
}
