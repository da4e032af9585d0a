//! The save pipeline: walks one or more filesystem paths, chunks and
//! deduplicates their content against the repository, and publishes the
//! result as a new Snapshot blob plus a channel tag.
//!
//! Per-directory enumeration dispatches file/link uploads early and
//! finalizes directories bottom-up (a directory is only hashed once every
//! child's hash is known). A stat-cache short-circuit skips re-chunking a
//! file whose `(mtime, ctime, mode, size)` haven't moved. A bounded "big
//! buffer" allowance keeps only a handful of large files reading with an
//! oversized buffer at once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::StatRow;
use crate::chunker::Chunker;
use crate::config::SaveSettings;
use crate::error::{RekkordError, RekkordResult};
use crate::oid::{Hash, Oid};
use crate::repository::Repository;
use crate::store::ObjectStore;
use crate::tree::{Directory, Entry, EntryFlags, EntryKind, FileBlob, RawChunk, SnapshotHeader};
use crate::wire::BlobType;

const CHUNK_MIN: usize = 1024 * 1024;
const CHUNK_AVERAGE: usize = 2048 * 1024;
const CHUNK_MAX: usize = 8192 * 1024;

/// Read-buffer size for an ordinary file.
const FILE_DEFAULT_SIZE: usize = 2 * CHUNK_MAX;
/// Read-buffer size granted to a file holding a "big buffer" permit.
const FILE_BIG_SIZE: usize = 64 * 1024 * 1024;
/// How many files may hold a big buffer concurrently.
const FILE_BIG_LIMIT: usize = 4;

const MAX_CHANNEL_LEN: usize = crate::tree::CHANNEL_LEN - 1;

/// Everything produced by a completed save.
#[derive(Clone, Debug)]
pub struct SaveOutcome {
    pub oid: Oid,
    pub tag_name: String,
    pub header: SnapshotHeader,
}

struct SaveContext<S: ObjectStore> {
    repo: Arc<Repository<S>>,
    settings: SaveSettings,
    big_semaphore: Arc<Semaphore>,
    /// Sum of encoded byte sizes of blobs this save actually wrote (i.e.
    /// every `write_blob` call that did *not* short-circuit on a cache or
    /// store hit). Becomes the snapshot header's `added` field.
    added: AtomicI64,
}

impl<S: ObjectStore> SaveContext<S> {
    fn record_added(&self, size: usize) {
        if size > 0 {
            self.added.fetch_add(size as i64, Ordering::Relaxed);
        }
    }
}

/// Saves `paths` under `channel`, returning the new snapshot's OID and tag.
///
/// Each top-level path becomes one root-level [`Entry`] whose `name` is the
/// path normalized to a separator-bearing, non-absolute form (leading `/`
/// stripped; on Windows a `C:` drive prefix becomes a single `C` component).
pub async fn save<S: ObjectStore>(
    repo: Arc<Repository<S>>,
    channel: &str,
    paths: &[PathBuf],
    settings: SaveSettings,
) -> RekkordResult<SaveOutcome> {
    if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN {
        return Err(RekkordError::Other(anyhow::anyhow!(
            "channel name must be 1..={} bytes, got {}",
            MAX_CHANNEL_LEN,
            channel.len()
        )));
    }

    let ctx = Arc::new(SaveContext {
        repo: repo.clone(),
        settings,
        big_semaphore: Arc::new(Semaphore::new(FILE_BIG_LIMIT)),
        added: AtomicI64::new(0),
    });

    let mut join_set = JoinSet::new();
    for path in paths {
        let ctx = ctx.clone();
        let path = path.clone();
        join_set.spawn(async move {
            let name = normalize_top_level_name(&path)?;
            save_path_entry(&ctx, path, name, true).await
        });
    }

    let mut children = Vec::with_capacity(paths.len());
    let mut total_bytes: i64 = 0;
    while let Some(joined) = join_set.join_next().await {
        let (entry, bytes) = joined.map_err(join_panic)??;
        total_bytes += bytes;
        children.push(entry);
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));

    let entries_count = children.len() as i64;
    let root = Directory { size: total_bytes, entries: entries_count, children };

    let header = SnapshotHeader {
        time: unix_time_ms(),
        size: total_bytes,
        stored: total_bytes,
        added: ctx.added.load(Ordering::Relaxed),
        channel: channel.to_string(),
    };

    let mut plaintext = header.encode();
    plaintext.extend_from_slice(&root.encode()?);

    let (oid, size) = repo.write_blob(BlobType::Snapshot, &plaintext).await?;
    ctx.record_added(size);

    let payload = crate::tree::encode_snapshot_tag_payload(&header);
    let tag_name = repo.write_tag(oid, &payload).await?;

    Ok(SaveOutcome { oid, tag_name, header })
}

/// Dispatches a single filesystem path to the directory/file/link handler
/// appropriate to its type, or produces an `Unknown` entry for anything
/// else. Boxed because directory recursion makes this function call itself.
fn save_path_entry<S: ObjectStore>(
    ctx: &Arc<SaveContext<S>>,
    path: PathBuf,
    name: String,
    top_level: bool,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = RekkordResult<(Entry, i64)>> + Send + '_>> {
    Box::pin(async move {
        let meta = if ctx.settings.follow_symlinks {
            tokio::fs::metadata(&path).await
        } else {
            tokio::fs::symlink_metadata(&path).await
        };
        let meta = match meta {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable path");
                return Ok((unknown_entry(name), 0));
            }
        };

        if meta.is_dir() {
            save_directory(ctx, &path, name).await
        } else if meta.file_type().is_symlink() {
            save_link_entry(ctx, &path, name, &meta).await
        } else if meta.is_file() {
            save_file_entry(ctx, &path, name, &meta).await
        } else if top_level {
            // Devices, pipes and sockets are rejected as save roots; only
            // nested occurrences are tolerated (skipped with a warning).
            Err(RekkordError::Other(anyhow::anyhow!(
                "'{}' is not a regular file, directory, or symlink",
                path.display()
            )))
        } else {
            tracing::warn!(path = %path.display(), "skipping non-regular file");
            Ok((unknown_entry(name), 0))
        }
    })
}

fn unknown_entry(name: String) -> Entry {
    Entry {
        hash: Hash::from_bytes([0; 32]),
        flags: EntryFlags(EntryFlags::STATED),
        kind: EntryKind::Unknown,
        name,
        mtime: 0,
        ctime: 0,
        atime: 0,
        btime: 0,
        uid: 0,
        gid: 0,
        mode: 0,
        size: 0,
        extended: Vec::new(),
    }
}

async fn save_directory<S: ObjectStore>(
    ctx: &Arc<SaveContext<S>>,
    path: &Path,
    name: String,
) -> RekkordResult<(Entry, i64)> {
    let meta = tokio::fs::metadata(path).await?;
    let mut read_dir = tokio::fs::read_dir(path).await?;

    let mut join_set = JoinSet::new();
    while let Some(dir_entry) = read_dir.next_entry().await? {
        let child_path = dir_entry.path();
        let child_name = dir_entry.file_name().to_string_lossy().into_owned();
        let ctx = ctx.clone();
        join_set.spawn(async move { save_path_entry(&ctx, child_path, child_name, false).await });
    }

    let mut children = Vec::new();
    let mut total_bytes: i64 = 0;
    while let Some(joined) = join_set.join_next().await {
        let (entry, bytes) = joined.map_err(join_panic)??;
        total_bytes += bytes;
        children.push(entry);
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));

    // A Directory-kind Entry's `size` is repurposed as its immediate
    // subdirectory count (matching `PutDirectory`'s `entry->size =
    // pending->subdirs`); the recursive byte total lives in the Directory
    // blob's own header and is what we hand back to our own parent.
    let subdirs = children.iter().filter(|c| c.kind == EntryKind::Directory).count() as i64;
    let entries_count = children.len() as i64;

    let directory = Directory { size: total_bytes, entries: entries_count, children };
    let encoded = directory.encode()?;
    let (oid, size) = ctx.repo.write_blob(BlobType::Directory, &encoded).await?;
    ctx.record_added(size);

    let (mtime, ctime, atime, btime, uid, gid, mode) = stat_fields(&meta);
    let entry = Entry {
        hash: oid.hash,
        flags: EntryFlags(EntryFlags::STATED | EntryFlags::READABLE),
        kind: EntryKind::Directory,
        name,
        mtime,
        ctime,
        atime,
        btime,
        uid,
        gid,
        mode,
        size: subdirs,
        extended: Vec::new(),
    };
    Ok((entry, total_bytes))
}

async fn save_file_entry<S: ObjectStore>(
    ctx: &Arc<SaveContext<S>>,
    path: &Path,
    name: String,
    meta: &std::fs::Metadata,
) -> RekkordResult<(Entry, i64)> {
    let (mtime, ctime, atime, btime, uid, gid, mode) = stat_fields(meta);
    let size = meta.len() as i64;
    let path_key = path.to_string_lossy().into_owned();

    if let Some(cache) = &ctx.repo.cache {
        if let Some(row) = cache.get_stat(&path_key).await? {
            if row.matches(mtime, ctime, mode, size) {
                let entry = Entry {
                    hash: row.hash,
                    flags: EntryFlags(EntryFlags::STATED | EntryFlags::READABLE),
                    kind: EntryKind::File,
                    name,
                    mtime,
                    ctime,
                    atime,
                    btime,
                    uid,
                    gid,
                    mode,
                    size,
                    extended: read_extended(path, ctx.settings.xattrs).await,
                };
                return Ok((entry, size));
            }
        }
    }

    let hash = save_file_content(ctx, path, size).await?;

    if let Some(cache) = &ctx.repo.cache {
        cache.put_stat(&path_key, StatRow { mtime, ctime, mode, size, hash, stored: size }).await?;
    }

    let entry = Entry {
        hash,
        flags: EntryFlags(EntryFlags::STATED | EntryFlags::READABLE),
        kind: EntryKind::File,
        name,
        mtime,
        ctime,
        atime,
        btime,
        uid,
        gid,
        mode,
        size,
        extended: read_extended(path, ctx.settings.xattrs).await,
    };
    Ok((entry, size))
}

/// Reads, chunks and uploads one file's content, returning the hash a
/// directory entry should reference: either a lone `Chunk` blob's hash (the
/// file fit in one chunk — no `File` blob is written at all) or a `File`
/// blob's hash wrapping the full chunk list.
async fn save_file_content<S: ObjectStore>(ctx: &Arc<SaveContext<S>>, path: &Path, size_hint: i64) -> RekkordResult<Hash> {
    let mut file = tokio::fs::File::open(path).await?;

    let mut permit_holder = None;
    let buffer_size = if size_hint as usize > FILE_DEFAULT_SIZE {
        match ctx.big_semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                permit_holder = Some(permit);
                (size_hint as usize).clamp(CHUNK_MAX, FILE_BIG_SIZE)
            }
            Err(_) => FILE_DEFAULT_SIZE,
        }
    } else {
        FILE_DEFAULT_SIZE
    };
    let _permit_holder = permit_holder;

    let mut chunker = Chunker::new(ctx.repo.splitter_seed(), CHUNK_MIN, CHUNK_AVERAGE, CHUNK_MAX);
    let mut buf = vec![0u8; buffer_size];
    let mut raw_chunks: Vec<RawChunk> = Vec::new();
    let mut total_read: i64 = 0;

    loop {
        let n = read_fill(&mut file, &mut buf).await?;
        let eof = n < buf.len();
        total_read += n as i64;

        let mut emitted: Vec<(u64, u64, Vec<u8>)> = Vec::new();
        chunker.process(&buf[..n], eof, |index, offset, data| {
            emitted.push((index, offset, data.to_vec()));
        });

        let mut join_set: JoinSet<RekkordResult<(u64, RawChunk)>> = JoinSet::new();
        for (index, offset, data) in emitted {
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let len = data.len() as i32;
                let (oid, size) = ctx.repo.write_blob(BlobType::Chunk, &data).await?;
                ctx.record_added(size);
                Ok((index, RawChunk { offset: offset as i64, len, hash: oid.hash }))
            });
        }

        // Mirrors `PutFile`'s `async.SyncSoon()`: drain this buffer's chunk
        // uploads before reading the next window, bounding how many open
        // chunk writes (and buffers) accumulate at once.
        let mut round = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            round.push(joined.map_err(join_panic)??);
        }
        round.sort_by_key(|(index, _)| *index);
        raw_chunks.extend(round.into_iter().map(|(_, chunk)| chunk));

        if eof {
            break;
        }
    }

    let hash = if raw_chunks.is_empty() {
        let (oid, size) = ctx.repo.write_blob(BlobType::Chunk, &[]).await?;
        ctx.record_added(size);
        oid.hash
    } else if raw_chunks.len() == 1 {
        raw_chunks[0].hash
    } else {
        let file_blob = FileBlob { chunks: raw_chunks, total_size: total_read };
        let encoded = file_blob.encode();
        let (oid, size) = ctx.repo.write_blob(BlobType::File, &encoded).await?;
        ctx.record_added(size);
        oid.hash
    };

    Ok(hash)
}

async fn read_fill(file: &mut tokio::fs::File, buf: &mut [u8]) -> RekkordResult<usize> {
    use tokio::io::AsyncReadExt;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn save_link_entry<S: ObjectStore>(
    ctx: &Arc<SaveContext<S>>,
    path: &Path,
    name: String,
    meta: &std::fs::Metadata,
) -> RekkordResult<(Entry, i64)> {
    let target = tokio::fs::read_link(path).await?;
    let target_bytes = target.to_string_lossy().into_owned().into_bytes();
    let size = target_bytes.len() as i64;

    let (oid, written) = ctx.repo.write_blob(BlobType::Link, &target_bytes).await?;
    ctx.record_added(written);

    let (mtime, ctime, atime, btime, uid, gid, mode) = stat_fields(meta);
    let entry = Entry {
        hash: oid.hash,
        flags: EntryFlags(EntryFlags::STATED | EntryFlags::READABLE),
        kind: EntryKind::Link,
        name,
        mtime,
        ctime,
        atime,
        btime,
        uid,
        gid,
        mode,
        size,
        extended: Vec::new(),
    };
    Ok((entry, size))
}

/// Reads every extended attribute on `path`, dropping (with a warning) any
/// single attribute too large for its 16-bit length prefix, and dropping the
/// *entire* set if their combined size would not fit `encode_extended`'s
/// 16-bit total (mirrors `PackExtended`'s two size guards).
async fn read_extended(path: &Path, enabled: bool) -> Vec<(String, Vec<u8>)> {
    if !enabled {
        return Vec::new();
    }
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || collect_xattrs(&path)).await.unwrap_or_default()
}

fn collect_xattrs(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut extended_total: usize = 0;

    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(_) => return out,
    };
    for name in names {
        let Some(value) = xattr::get(path, &name).ok().flatten() else { continue };
        let key = name.to_string_lossy().into_owned();

        if key.len() + 1 + value.len() > u16::MAX as usize {
            tracing::warn!(path = %path.display(), attr = %key, "skipping oversized extended attribute");
            continue;
        }
        extended_total += key.len() + 1 + value.len();
        out.push((key, value));
    }

    if extended_total > i16::MAX as usize {
        tracing::warn!(path = %path.display(), "discarding all extended attributes: payload too large");
        return Vec::new();
    }
    out
}

#[cfg(unix)]
fn stat_fields(meta: &std::fs::Metadata) -> (i64, i64, i64, i64, u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    let mtime = meta.mtime() * 1_000_000_000 + meta.mtime_nsec();
    let ctime = meta.ctime() * 1_000_000_000 + meta.ctime_nsec();
    let atime = meta.atime() * 1_000_000_000 + meta.atime_nsec();
    let btime = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    (mtime, ctime, atime, btime, meta.uid(), meta.gid(), meta.mode())
}

#[cfg(not(unix))]
fn stat_fields(meta: &std::fs::Metadata) -> (i64, i64, i64, i64, u32, u32, u32) {
    let to_ns = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    };
    let mtime = to_ns(meta.modified());
    let btime = to_ns(meta.created());
    (mtime, mtime, mtime, btime, 0, 0, 0)
}

/// Normalizes a top-level save path into the separator-bearing, non-
/// absolute form `Entry::name` requires (`validate_name` rejects a leading
/// `/` even where separators are otherwise allowed). On Windows, a `C:\`
/// drive prefix becomes a single `C` path component; this branch only runs
/// on Windows and is untested on this Unix-only CI.
fn normalize_top_level_name(path: &Path) -> RekkordResult<String> {
    let s = path.to_string_lossy();

    #[cfg(windows)]
    {
        let bytes = s.as_bytes();
        if bytes.len() >= 2 && bytes[1] == b':' {
            let drive = (bytes[0] as char).to_ascii_uppercase();
            let rest = s[2..].replace('\\', "/");
            let rest = rest.trim_start_matches('/');
            return Ok(if rest.is_empty() { drive.to_string() } else { format!("{drive}/{rest}") });
        }
        return Ok(s.replace('\\', "/").trim_start_matches('/').to_string());
    }

    #[cfg(not(windows))]
    {
        let name = s.trim_start_matches('/').to_string();
        if name.is_empty() {
            return Err(RekkordError::Other(anyhow::anyhow!("cannot save the root path '/' directly")));
        }
        Ok(name)
    }
}

fn unix_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn join_panic(e: tokio::task::JoinError) -> RekkordError {
    RekkordError::Other(anyhow::anyhow!("save task panicked: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStatCache;
    use crate::config::RepositoryConfig;
    use crate::keyset::Keyset;
    use rand::RngCore;
    use std::io::Write;

    async fn init_memory_repo() -> Arc<Repository<rekkord_store_memory::MemoryStore>> {
        let store = Arc::new(rekkord_store_memory::MemoryStore::default());
        let mut mkey = [0u8; 32];
        rand::rng().fill_bytes(&mut mkey);
        let master = Keyset::from_master_key(&mkey);
        let repo = Repository::init(store, &master, &[], RepositoryConfig::default()).await.unwrap();
        Arc::new(repo.with_cache(Arc::new(MemoryStatCache::new())))
    }

    #[tokio::test]
    async fn saves_a_small_tree_and_produces_a_readable_snapshot() {
        let repo = init_memory_repo().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"nested file").unwrap();

        let outcome = save(repo.clone(), "daily", &[dir.path().to_path_buf()], SaveSettings::default()).await.unwrap();
        assert_eq!(outcome.header.channel, "daily");
        assert!(outcome.header.size > 0);
        assert!(outcome.header.added > 0);

        let read = repo.read_blob(outcome.oid).await.unwrap();
        assert_eq!(read.blob_type, BlobType::Snapshot);
    }

    #[tokio::test]
    async fn unchanged_file_short_circuits_on_second_save() {
        let repo = init_memory_repo().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"stable content").unwrap();

        let first = save(repo.clone(), "daily", &[dir.path().to_path_buf()], SaveSettings::default()).await.unwrap();
        assert!(first.header.added > 0);

        let second = save(repo.clone(), "daily", &[dir.path().to_path_buf()], SaveSettings::default()).await.unwrap();
        // The file's stat row is unchanged, so no new chunk/file blob should
        // have been written for it; only the (always-fresh) directory and
        // snapshot blobs contribute to `added`.
        assert!(second.header.added < first.header.added);
    }

    #[tokio::test]
    async fn large_file_chunks_into_multiple_blobs() {
        let repo = init_memory_repo().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        let mut state = 42u64;
        let mut buf = vec![0u8; 10 * 1024 * 1024];
        for b in buf.iter_mut() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *b = (state >> 56) as u8;
        }
        f.write_all(&buf).unwrap();
        drop(f);

        let outcome = save(repo.clone(), "daily", &[dir.path().to_path_buf()], SaveSettings::default()).await.unwrap();
        assert_eq!(outcome.header.size, buf.len() as i64);
    }

    #[tokio::test]
    async fn rejects_empty_channel_name() {
        let repo = init_memory_repo().await;
        let dir = tempfile::tempdir().unwrap();
        let err = save(repo, "", &[dir.path().to_path_buf()], SaveSettings::default()).await.unwrap_err();
        assert!(matches!(err, RekkordError::Other(_)));
    }
}
