//! Extracts a Chunk/File/Directory/Snapshot/Link blob onto the local
//! filesystem.
//!
//! Files are replaced atomically (write to a sibling temp path, then
//! rename); chunk writes are scoped per-file so file descriptors don't
//! pile up across many files in flight at once; a directory's own
//! metadata is applied only after every one of its children has finished
//! extracting; `unlink` pruning walks live directory contents rather than
//! trusting a precomputed path set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;
use tokio::task::JoinSet;

use crate::config::RestoreSettings;
use crate::error::{RekkordError, RekkordResult};
use crate::oid::{Catalog, Oid};
use crate::repository::{BlobRead, Repository};
use crate::store::ObjectStore;
use crate::tree::{Directory, Entry, EntryFlags, EntryKind, FileBlob};
use crate::wire::BlobType;

/// Totals accumulated over one `restore` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreOutcome {
    pub entries: u64,
    pub bytes: u64,
}

struct RestoreContext<S: ObjectStore> {
    repo: Arc<Repository<S>>,
    settings: RestoreSettings,
    entries: AtomicU64,
    bytes: AtomicU64,
}

/// Restores `oid` onto `dest`. `oid` may name any blob type; a Chunk or
/// File blob restores to `dest` as a single file, a Directory or Snapshot
/// blob restores its tree under `dest`, and a Link blob restores as a
/// symlink at `dest`.
pub async fn restore<S: ObjectStore>(
    repo: Arc<Repository<S>>,
    oid: Oid,
    dest: &Path,
    settings: RestoreSettings,
) -> RekkordResult<RestoreOutcome> {
    let read = repo.read_blob(oid).await?;
    let ctx = Arc::new(RestoreContext { repo: repo.clone(), settings, entries: AtomicU64::new(0), bytes: AtomicU64::new(0) });

    match read.blob_type {
        BlobType::Chunk | BlobType::File => {
            if !ctx.settings.force && tokio::fs::metadata(dest).await.is_ok() {
                return Err(RekkordError::AlreadyExists { path: dest.display().to_string() });
            }
            restore_file_content(&ctx, read, dest).await?;
            ctx.entries.fetch_add(1, Ordering::Relaxed);
        }
        BlobType::Directory => {
            check_directory_destination(&ctx, dest).await?;
            if !ctx.settings.fake {
                tokio::fs::create_dir_all(dest).await?;
            }
            extract_entries(&ctx, &read.plaintext, false, dest).await?;
        }
        BlobType::Snapshot => {
            check_directory_destination(&ctx, dest).await?;
            if read.plaintext.len() <= crate::tree::SNAPSHOT_HEADER3_LEN {
                return Err(RekkordError::MalformedBlob { oid, reason: "snapshot has no root directory".into() });
            }
            if !ctx.settings.fake {
                tokio::fs::create_dir_all(dest).await?;
            }
            let dir_bytes = &read.plaintext[crate::tree::SNAPSHOT_HEADER3_LEN..];
            extract_entries(&ctx, dir_bytes, true, dest).await?;
        }
        BlobType::Link => {
            let target = String::from_utf8(read.plaintext)
                .map_err(|_| RekkordError::MalformedBlob { oid, reason: "link target is not valid UTF-8".into() })?;
            if !ctx.settings.fake {
                create_symlink_forced(&target, dest, ctx.settings.force).await?;
            }
            ctx.entries.fetch_add(1, Ordering::Relaxed);
        }
        _ => return Err(RekkordError::MalformedBlob { oid, reason: "invalid blob type for restore".into() }),
    }

    Ok(RestoreOutcome { entries: ctx.entries.load(Ordering::Relaxed), bytes: ctx.bytes.load(Ordering::Relaxed) })
}

/// Unless `force`, refuses to restore onto a destination that already
/// exists as a non-empty directory, or as anything other than a directory.
async fn check_directory_destination<S: ObjectStore>(ctx: &RestoreContext<S>, dest: &Path) -> RekkordResult<()> {
    if ctx.settings.force {
        return Ok(());
    }
    match tokio::fs::metadata(dest).await {
        Ok(meta) if meta.is_dir() => {
            let mut read_dir = tokio::fs::read_dir(dest).await?;
            if read_dir.next_entry().await?.is_some() {
                return Err(RekkordError::AlreadyExists { path: dest.display().to_string() });
            }
            Ok(())
        }
        Ok(_) => Err(RekkordError::AlreadyExists { path: dest.display().to_string() }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Decodes one directory level, drops unreadable/`Unknown` entries, prunes
/// (if `settings.unlink`) anything already on disk that isn't among the
/// survivors, then extracts every survivor concurrently and waits for all
/// of them before returning.
async fn extract_entries<S: ObjectStore>(
    ctx: &Arc<RestoreContext<S>>,
    directory_bytes: &[u8],
    allow_separators: bool,
    dest_dir: &Path,
) -> RekkordResult<()> {
    let directory = Directory::decode(directory_bytes, allow_separators)?;

    let surviving: Vec<Entry> = directory
        .children
        .into_iter()
        .filter(|entry| entry.kind != EntryKind::Unknown && entry.flags.has(EntryFlags::READABLE))
        .collect();

    if allow_separators && !ctx.settings.fake {
        for entry in &surviving {
            if entry.name.contains('/') {
                if let Some(parent) = dest_dir.join(&entry.name).parent() {
                    if parent != dest_dir {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
            }
        }
    }

    if ctx.settings.unlink {
        let mut keep: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
        let mut ancestor_dirs: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
        for entry in &surviving {
            let dest_path = dest_dir.join(&entry.name);
            keep.insert(dest_path.clone());
            if allow_separators {
                let mut current = dest_path.as_path();
                while let Some(parent) = current.parent() {
                    if parent == dest_dir {
                        break;
                    }
                    keep.insert(parent.to_path_buf());
                    ancestor_dirs.insert(parent.to_path_buf());
                    current = parent;
                }
            }
        }
        clean_directory(ctx, dest_dir, &keep).await?;
        for dir in &ancestor_dirs {
            clean_directory(ctx, dir, &keep).await?;
        }
    }

    let mut join_set = JoinSet::new();
    for entry in surviving {
        let ctx = ctx.clone();
        let dest_path = dest_dir.join(&entry.name);
        join_set.spawn(async move { extract_one_entry(&ctx, entry, dest_path).await });
    }
    while let Some(joined) = join_set.join_next().await {
        joined.map_err(join_panic)??;
    }
    Ok(())
}

async fn extract_one_entry<S: ObjectStore>(ctx: &Arc<RestoreContext<S>>, entry: Entry, dest_path: PathBuf) -> RekkordResult<()> {
    let oid = entry.oid();
    let read = ctx.repo.read_blob(oid).await?;

    match entry.kind {
        EntryKind::Directory => {
            if read.blob_type != BlobType::Directory {
                return Err(RekkordError::MalformedBlob { oid, reason: "directory entry does not reference a Directory blob".into() });
            }
            if ctx.settings.verbose {
                tracing::info!(path = %dest_path.display(), "D");
            }
            if !ctx.settings.fake {
                tokio::fs::create_dir_all(&dest_path).await?;
            }
            extract_entries(ctx, &read.plaintext, false, &dest_path).await?;
            if !ctx.settings.fake {
                apply_metadata(&dest_path, &entry, false, ctx.settings.chown).await?;
            }
            ctx.entries.fetch_add(1, Ordering::Relaxed);
        }
        EntryKind::File => {
            if !matches!(read.blob_type, BlobType::File | BlobType::Chunk) {
                return Err(RekkordError::MalformedBlob { oid, reason: "file entry does not reference a File or Chunk blob".into() });
            }
            if ctx.settings.verbose {
                tracing::info!(path = %dest_path.display(), "F");
            }
            if entry.size != 0 {
                restore_file_content(ctx, read, &dest_path).await?;
            } else if !ctx.settings.fake {
                write_whole_file(&dest_path, &[]).await?;
            }
            if !ctx.settings.fake {
                apply_metadata(&dest_path, &entry, false, ctx.settings.chown).await?;
                if ctx.settings.xattrs && !entry.extended.is_empty() {
                    write_extended(&dest_path, entry.extended.clone()).await?;
                }
            }
            ctx.entries.fetch_add(1, Ordering::Relaxed);
        }
        EntryKind::Link => {
            if read.blob_type != BlobType::Link {
                return Err(RekkordError::MalformedBlob { oid, reason: "link entry does not reference a Link blob".into() });
            }
            if ctx.settings.verbose {
                tracing::info!(path = %dest_path.display(), "L");
            }
            let target = String::from_utf8(read.plaintext)
                .map_err(|_| RekkordError::MalformedBlob { oid, reason: "link target is not valid UTF-8".into() })?;
            if !ctx.settings.fake {
                create_symlink_forced(&target, &dest_path, ctx.settings.force).await?;
                apply_metadata(&dest_path, &entry, true, ctx.settings.chown).await?;
                if ctx.settings.xattrs && !entry.extended.is_empty() {
                    write_extended(&dest_path, entry.extended.clone()).await?;
                }
            }
            ctx.entries.fetch_add(1, Ordering::Relaxed);
        }
        EntryKind::Unknown => unreachable!("unreadable/unknown entries are filtered out before this is spawned"),
    }
    Ok(())
}

async fn restore_file_content<S: ObjectStore>(ctx: &Arc<RestoreContext<S>>, read: BlobRead, dest_path: &Path) -> RekkordResult<()> {
    match read.blob_type {
        BlobType::File => {
            let file_blob = FileBlob::decode(&read.plaintext)?;
            write_chunked_file(ctx, &file_blob, dest_path).await
        }
        BlobType::Chunk => {
            if !ctx.settings.fake {
                write_whole_file(dest_path, &read.plaintext).await?;
            }
            ctx.bytes.fetch_add(read.plaintext.len() as u64, Ordering::Relaxed);
            Ok(())
        }
        _ => unreachable!("blob type already validated by the caller"),
    }
}

async fn write_whole_file(dest: &Path, data: &[u8]) -> RekkordResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = sibling_temp_path(dest);
    tokio::fs::write(&tmp_path, data).await?;
    tokio::fs::rename(&tmp_path, dest).await?;
    Ok(())
}

/// Writes every chunk of a multi-chunk file at its recorded offset, scoped
/// to its own `JoinSet` (mirrors `GetFile`'s `SyncSoon`: a fence local to
/// this file's chunk tasks, not the whole restore's, so open file
/// descriptors don't accumulate across many files in flight at once), then
/// atomically renames the finished temp file into place.
async fn write_chunked_file<S: ObjectStore>(ctx: &Arc<RestoreContext<S>>, file_blob: &FileBlob, dest_path: &Path) -> RekkordResult<()> {
    if ctx.settings.fake {
        let mut join_set: JoinSet<RekkordResult<i64>> = JoinSet::new();
        for chunk in file_blob.chunks.clone() {
            let ctx = ctx.clone();
            join_set.spawn(async move { check_chunk(&ctx, chunk.hash.into(), chunk.len).await });
        }
        while let Some(joined) = join_set.join_next().await {
            let len = joined.map_err(join_panic)??;
            ctx.bytes.fetch_add(len as u64, Ordering::Relaxed);
        }
        return Ok(());
    }

    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = sibling_temp_path(dest_path);
    let file = tokio::fs::File::create(&tmp_path).await?;
    file.set_len(file_blob.total_size.max(0) as u64).await?;
    let file = Arc::new(tokio::sync::Mutex::new(file));

    let mut join_set: JoinSet<RekkordResult<i64>> = JoinSet::new();
    for chunk in file_blob.chunks.clone() {
        let ctx = ctx.clone();
        let file = file.clone();
        join_set.spawn(async move {
            let oid = Oid::new(Catalog::Raw, chunk.hash);
            let read = ctx.repo.read_blob(oid).await?;
            if read.blob_type != BlobType::Chunk {
                return Err(RekkordError::MalformedBlob { oid, reason: "expected a Chunk blob".into() });
            }
            if read.plaintext.len() as i32 != chunk.len {
                return Err(RekkordError::ChunkSizeMismatch {
                    oid,
                    expected: chunk.len as i64,
                    found: read.plaintext.len() as i64,
                });
            }
            write_at(&file, chunk.offset, &read.plaintext).await?;
            Ok(chunk.len as i64)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        let written = joined.map_err(join_panic)??;
        ctx.bytes.fetch_add(written as u64, Ordering::Relaxed);
    }
    drop(file);

    tokio::fs::rename(&tmp_path, dest_path).await?;
    Ok(())
}

async fn check_chunk<S: ObjectStore>(ctx: &Arc<RestoreContext<S>>, hash: crate::oid::Hash, expected_len: i32) -> RekkordResult<i64> {
    let oid = Oid::new(Catalog::Raw, hash);
    let read = ctx.repo.read_blob(oid).await?;
    if read.blob_type != BlobType::Chunk {
        return Err(RekkordError::MalformedBlob { oid, reason: "expected a Chunk blob".into() });
    }
    if read.plaintext.len() as i32 != expected_len {
        return Err(RekkordError::ChunkSizeMismatch { oid, expected: expected_len as i64, found: read.plaintext.len() as i64 });
    }
    Ok(expected_len as i64)
}

async fn write_at(file: &Arc<tokio::sync::Mutex<tokio::fs::File>>, offset: i64, data: &[u8]) -> RekkordResult<()> {
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};
    let mut file = file.lock().await;
    file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
    file.write_all(data).await?;
    Ok(())
}

fn sibling_temp_path(dest: &Path) -> PathBuf {
    let file_name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let mut suffix_bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut suffix_bytes);
    let suffix = data_encoding::HEXLOWER.encode(&suffix_bytes);
    dest.with_file_name(format!(".{file_name}.rekkord-tmp-{suffix}"))
}

async fn create_symlink_forced(target: &str, dest: &Path, force: bool) -> RekkordResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if force {
        let _ = tokio::fs::remove_file(dest).await;
    }
    #[cfg(unix)]
    {
        tokio::fs::symlink(target, dest).await?;
    }
    #[cfg(windows)]
    {
        tokio::fs::symlink_file(target, dest).await?;
    }
    Ok(())
}

/// A single recursive top-down pass: a directory already named in `keep` is
/// left alone (including its contents, unconditionally); anything else is
/// pruned after its own contents are pruned first. Grounded on
/// `CleanDirectory`'s recursion shape, not on a precomputed "everything to
/// keep on the whole tree" scan.
fn clean_directory<'a, S: ObjectStore>(
    ctx: &'a Arc<RestoreContext<S>>,
    dir: &'a Path,
    keep: &'a std::collections::HashSet<PathBuf>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = RekkordResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(child) = read_dir.next_entry().await? {
            let path = child.path();
            if keep.contains(&path) {
                continue;
            }
            let file_type = child.file_type().await?;
            if file_type.is_dir() {
                clean_directory(ctx, &path, keep).await?;
                if ctx.settings.fake {
                    if ctx.settings.verbose {
                        tracing::info!(path = %path.display(), "would delete directory");
                    }
                    continue;
                }
                if ctx.settings.verbose {
                    tracing::info!(path = %path.display(), "delete directory");
                }
                tokio::fs::remove_dir(&path).await?;
            } else {
                if ctx.settings.fake {
                    if ctx.settings.verbose {
                        tracing::info!(path = %path.display(), "would delete file");
                    }
                    continue;
                }
                if ctx.settings.verbose {
                    tracing::info!(path = %path.display(), "delete file");
                }
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    })
}

struct EntryMeta {
    uid: u32,
    gid: u32,
    mode: u32,
    mtime: i64,
    atime: i64,
}

/// Applies `entry`'s ownership, mode and timestamps to an already-created
/// file, directory, or symlink. Best-effort: a chown that fails for lack of
/// privilege is logged and otherwise ignored, matching a non-root restore's
/// expectations.
async fn apply_metadata(path: &Path, entry: &Entry, is_symlink: bool, chown: bool) -> RekkordResult<()> {
    let path = path.to_path_buf();
    let meta = EntryMeta { uid: entry.uid, gid: entry.gid, mode: entry.mode, mtime: entry.mtime, atime: entry.atime };
    tokio::task::spawn_blocking(move || apply_metadata_blocking(&path, &meta, is_symlink, chown))
        .await
        .map_err(|e| RekkordError::Other(anyhow::anyhow!("metadata task failed: {e}")))?
}

#[cfg(unix)]
fn apply_metadata_blocking(path: &Path, meta: &EntryMeta, is_symlink: bool, chown: bool) -> RekkordResult<()> {
    use std::os::unix::fs::PermissionsExt;

    if chown {
        let result = if is_symlink {
            std::os::unix::fs::lchown(path, Some(meta.uid), Some(meta.gid))
        } else {
            std::os::unix::fs::chown(path, Some(meta.uid), Some(meta.gid))
        };
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to chown (requires privilege)");
        }
    }
    if !is_symlink && meta.mode != 0 {
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(meta.mode)) {
            tracing::warn!(path = %path.display(), error = %e, "failed to set mode");
        }
    }

    let mtime = nanos_to_filetime(meta.mtime);
    let atime = nanos_to_filetime(meta.atime);
    let result = if is_symlink { filetime::set_symlink_file_times(path, atime, mtime) } else { filetime::set_file_times(path, atime, mtime) };
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to set timestamps");
    }
    Ok(())
}

#[cfg(unix)]
fn nanos_to_filetime(nanos: i64) -> filetime::FileTime {
    filetime::FileTime::from_unix_time(nanos.div_euclid(1_000_000_000), nanos.rem_euclid(1_000_000_000) as u32)
}

#[cfg(not(unix))]
fn apply_metadata_blocking(_path: &Path, _meta: &EntryMeta, _is_symlink: bool, _chown: bool) -> RekkordResult<()> {
    Ok(())
}

async fn write_extended(path: &Path, extended: Vec<(String, Vec<u8>)>) -> RekkordResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        for (key, value) in &extended {
            if let Err(e) = xattr::set(&path, key, value) {
                tracing::warn!(path = %path.display(), attr = %key, error = %e, "failed to restore extended attribute");
            }
        }
    })
    .await
    .map_err(|e| RekkordError::Other(anyhow::anyhow!("xattr task failed: {e}")))
}

fn join_panic(e: tokio::task::JoinError) -> RekkordError {
    RekkordError::Other(anyhow::anyhow!("restore task panicked: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStatCache;
    use crate::config::{RepositoryConfig, SaveSettings};
    use crate::keyset::Keyset;
    use rand::RngCore as _;

    async fn init_memory_repo() -> Arc<Repository<rekkord_store_memory::MemoryStore>> {
        let store = Arc::new(rekkord_store_memory::MemoryStore::default());
        let mut mkey = [0u8; 32];
        rand::rng().fill_bytes(&mut mkey);
        let master = Keyset::from_master_key(&mkey);
        let repo = Repository::init(store, &master, &[], RepositoryConfig::default()).await.unwrap();
        Arc::new(repo.with_cache(Arc::new(MemoryStatCache::new())))
    }

    #[tokio::test]
    async fn round_trips_a_small_tree() {
        let repo = init_memory_repo().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello world").unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"nested file").unwrap();

        let outcome = crate::save::save(repo.clone(), "daily", &[src.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        let result = restore(repo.clone(), outcome.oid, dest.path(), RestoreSettings::default()).await.unwrap();
        assert!(result.entries > 0);

        let restored_name = std::fs::read_dir(dest.path()).unwrap().next().unwrap().unwrap().file_name();
        let root = dest.path().join(restored_name);
        assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"hello world");
        assert_eq!(std::fs::read(root.join("sub/b.txt")).unwrap(), b"nested file");
    }

    #[tokio::test]
    async fn refuses_non_empty_destination_without_force() {
        let repo = init_memory_repo().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"content").unwrap();
        let outcome = crate::save::save(repo.clone(), "daily", &[src.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("preexisting"), b"junk").unwrap();

        let err = restore(repo.clone(), outcome.oid, dest.path(), RestoreSettings::default()).await.unwrap_err();
        assert!(matches!(err, RekkordError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn fake_restore_performs_no_writes() {
        let repo = init_memory_repo().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let outcome = crate::save::save(repo.clone(), "daily", &[src.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        let settings = RestoreSettings { fake: true, ..Default::default() };
        let result = restore(repo.clone(), outcome.oid, dest.path(), settings).await.unwrap();
        assert!(result.entries > 0);
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unlink_prunes_files_not_in_the_restored_snapshot() {
        let repo = init_memory_repo().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("keep.txt"), b"keep").unwrap();
        let outcome = crate::save::save(repo.clone(), "daily", &[src.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        restore(repo.clone(), outcome.oid, dest.path(), RestoreSettings::default()).await.unwrap();

        let top_level_name = std::fs::read_dir(dest.path()).unwrap().next().unwrap().unwrap().file_name();
        let root = dest.path().join(&top_level_name);
        std::fs::write(root.join("stale.txt"), b"stale").unwrap();

        let settings = RestoreSettings { force: true, unlink: true, ..Default::default() };
        restore(repo.clone(), outcome.oid, dest.path(), settings).await.unwrap();

        assert!(root.join("keep.txt").exists());
        assert!(!root.join("stale.txt").exists());
    }
}
