//! Recursively validates every blob hash reachable from a set of Snapshot
//! OIDs, amortizing repeat scans through the local `checks` cache and,
//! where the store supports it, extending object-lock retention over
//! everything this run actually touched.
//!
//! Reuses the keyed-BLAKE3 recompute-and-compare that [`Repository::read_blob_checked`]
//! already performs for a single blob, walked depth-first over the same
//! Directory/File/Link shape `restore` traverses, with a 7-day cache
//! short-circuit per blob and a final retention sweep over every OID
//! freshly checked this run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::CheckRow;
use crate::error::{RekkordError, RekkordResult};
use crate::oid::{Catalog, Hash, Oid};
use crate::repository::Repository;
use crate::store::ObjectStore;
use crate::tree::{Directory, EntryFlags, EntryKind, FileBlob};
use crate::wire::BlobType;

/// A snapshot (or any blob) whose last check was recorded within this
/// window is trusted without re-reading it.
const CHECK_DELAY_MS: i64 = 7 * 86_400_000;

/// Outcome of verifying one requested snapshot OID.
#[derive(Clone, Debug)]
pub struct SnapshotCheck {
    pub oid: Oid,
    pub valid: bool,
    /// Set when `valid` is false: the first failure encountered while
    /// walking this snapshot's tree.
    pub error: Option<String>,
}

struct VerifyContext<S: ObjectStore> {
    repo: Arc<Repository<S>>,
    semaphore: Arc<Semaphore>,
    /// OIDs this run actually re-read and re-hashed (cache short-circuits
    /// don't count), fed to the final retention sweep.
    observed: Mutex<HashSet<Oid>>,
}

/// Verifies every OID in `oids`, recursing into each snapshot's full tree.
/// A failure partway through one snapshot's tree marks only that snapshot
/// invalid; it never prevents the others in `oids` from being checked.
/// After every
/// snapshot has been walked, every blob freshly read this run has its
/// object-lock retention extended, if the store honors that at all.
pub async fn verify<S: ObjectStore>(repo: Arc<Repository<S>>, oids: &[Oid]) -> Vec<SnapshotCheck> {
    let threads = repo.config.effective_threads(repo.store.default_parallelism());
    let ctx = Arc::new(VerifyContext {
        repo: repo.clone(),
        semaphore: Arc::new(Semaphore::new(threads.max(1))),
        observed: Mutex::new(HashSet::new()),
    });

    let mut join_set = JoinSet::new();
    for &oid in oids {
        let ctx = ctx.clone();
        join_set.spawn(async move { check_snapshot(&ctx, oid).await });
    }

    let mut results = Vec::with_capacity(oids.len());
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(check) => results.push(check),
            Err(e) => tracing::error!(error = %e, "a verify task panicked; its snapshot result is missing"),
        }
    }

    retain_observed(&ctx).await;
    results
}

async fn check_snapshot<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, oid: Oid) -> SnapshotCheck {
    match check_blob(ctx, oid, true).await {
        Ok(()) => SnapshotCheck { oid, valid: true, error: None },
        Err(e) => {
            tracing::warn!(%oid, error = %e, "snapshot failed verification");
            SnapshotCheck { oid, valid: false, error: Some(e.to_string()) }
        }
    }
}

/// Checks one blob: a cache hit within [`CHECK_DELAY_MS`] short-circuits
/// entirely; otherwise re-reads and re-hashes it via `read_blob_checked`
/// and recurses into whatever it references. `expect_snapshot` selects
/// which blob type is acceptable at this OID — `true` only for the root
/// OIDs handed to [`verify`], `false` for every Directory/Link reached by
/// recursion.
async fn check_blob<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, oid: Oid, expect_snapshot: bool) -> RekkordResult<()> {
    if already_fresh(ctx, oid).await? {
        return Ok(());
    }

    let permit = ctx.semaphore.clone().acquire_owned().await.expect("verify semaphore is never closed");
    let read = ctx.repo.read_blob_checked(oid).await;
    drop(permit);

    let result = match read {
        Err(e) => Err(e),
        Ok(read) => {
            ctx.observed.lock().unwrap().insert(oid);
            match (read.blob_type, expect_snapshot) {
                (BlobType::Link, false) => Ok(()),
                (BlobType::Directory, false) => check_directory_blob(ctx, &read.plaintext, false).await,
                (BlobType::Snapshot, true) => check_snapshot_blob(ctx, oid, &read.plaintext).await,
                (other, _) => Err(RekkordError::MalformedBlob { oid, reason: format!("unexpected blob type {other:?} while verifying") }),
            }
        }
    };

    record_check(ctx, oid, result.is_ok()).await;
    result
}

async fn check_snapshot_blob<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, oid: Oid, bytes: &[u8]) -> RekkordResult<()> {
    if bytes.len() < crate::tree::SNAPSHOT_HEADER3_LEN {
        return Err(RekkordError::MalformedBlob { oid, reason: "snapshot has no root directory".into() });
    }
    let root_bytes = &bytes[crate::tree::SNAPSHOT_HEADER3_LEN..];
    check_directory_blob(ctx, root_bytes, true).await
}

/// Decodes one directory level and checks every *Readable* child
/// concurrently. Matches `restore`'s `extract_entries`: unreadable or
/// `Unknown` entries have no payload to check and are skipped.
async fn check_directory_blob<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, bytes: &[u8], allow_separators: bool) -> RekkordResult<()> {
    let directory = Directory::decode(bytes, allow_separators)?;

    let mut join_set = JoinSet::new();
    for entry in directory.children {
        if entry.kind == EntryKind::Unknown || !entry.flags.has(EntryFlags::READABLE) {
            continue;
        }
        let ctx = ctx.clone();
        let oid = entry.oid();
        let kind = entry.kind;
        let size = entry.size;
        join_set.spawn(async move {
            match kind {
                EntryKind::Directory | EntryKind::Link => check_blob(&ctx, oid, false).await,
                EntryKind::File => check_file_entry(&ctx, oid, size).await,
                EntryKind::Unknown => unreachable!("unreadable/unknown entries are filtered out before this is spawned"),
            }
        });
    }
    while let Some(joined) = join_set.join_next().await {
        joined.map_err(join_panic)??;
    }
    Ok(())
}

/// Checks a File-kind entry's referenced blob: either a lone Chunk (the
/// file fit in one chunk) or a File blob wrapping the full chunk list. The
/// Chunk case is the only place a File-kind entry's recorded `size` is
/// checked directly against a blob's plaintext length — a multi-chunk
/// File blob's own chunk records carry that obligation instead.
async fn check_file_entry<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, oid: Oid, expected_size: i64) -> RekkordResult<()> {
    if already_fresh(ctx, oid).await? {
        return Ok(());
    }

    let permit = ctx.semaphore.clone().acquire_owned().await.expect("verify semaphore is never closed");
    let read = ctx.repo.read_blob_checked(oid).await;
    drop(permit);

    let result = match read {
        Err(e) => Err(e),
        Ok(read) => {
            ctx.observed.lock().unwrap().insert(oid);
            match read.blob_type {
                BlobType::Chunk if read.plaintext.len() as i64 != expected_size => {
                    Err(RekkordError::ChunkSizeMismatch { oid, expected: expected_size, found: read.plaintext.len() as i64 })
                }
                BlobType::Chunk => Ok(()),
                BlobType::File => check_file_blob(ctx, &read.plaintext).await,
                other => Err(RekkordError::MalformedBlob { oid, reason: format!("expected a File or Chunk blob, found {other:?}") }),
            }
        }
    };

    record_check(ctx, oid, result.is_ok()).await;
    result
}

async fn check_file_blob<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, bytes: &[u8]) -> RekkordResult<()> {
    let file_blob = FileBlob::decode(bytes)?;

    let mut join_set = JoinSet::new();
    for chunk in file_blob.chunks {
        let ctx = ctx.clone();
        join_set.spawn(async move { check_chunk(&ctx, chunk.hash, chunk.len).await });
    }
    while let Some(joined) = join_set.join_next().await {
        joined.map_err(join_panic)??;
    }
    Ok(())
}

async fn check_chunk<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, hash: Hash, expected_len: i32) -> RekkordResult<()> {
    let oid = Oid::new(Catalog::Raw, hash);
    if already_fresh(ctx, oid).await? {
        return Ok(());
    }

    let permit = ctx.semaphore.clone().acquire_owned().await.expect("verify semaphore is never closed");
    let read = ctx.repo.read_blob_checked(oid).await;
    drop(permit);

    let result = match read {
        Err(e) => Err(e),
        Ok(read) if read.blob_type != BlobType::Chunk => {
            Err(RekkordError::MalformedBlob { oid, reason: "expected a Chunk blob".into() })
        }
        Ok(read) if read.plaintext.len() as i32 != expected_len => {
            Err(RekkordError::ChunkSizeMismatch { oid, expected: expected_len as i64, found: read.plaintext.len() as i64 })
        }
        Ok(_) => {
            ctx.observed.lock().unwrap().insert(oid);
            Ok(())
        }
    };

    record_check(ctx, oid, result.is_ok()).await;
    result
}

/// Consults the local `checks` table; `true` means the caller should trust
/// the cached verdict without re-reading `oid` at all.
async fn already_fresh<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, oid: Oid) -> RekkordResult<bool> {
    let Some(cache) = &ctx.repo.cache else { return Ok(false) };
    let Some(row) = cache.get_check(oid).await? else { return Ok(false) };
    Ok(row.valid && now_ms() - row.mark < CHECK_DELAY_MS)
}

/// Records this check's outcome in the `checks` cache regardless of
/// success or failure, preserving whatever `retained` bit a prior run had
/// set.
async fn record_check<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>, oid: Oid, valid: bool) {
    let Some(cache) = &ctx.repo.cache else { return };
    let retained = match cache.get_check(oid).await {
        Ok(row) => row.map(|r| r.retained).unwrap_or(false),
        Err(e) => {
            tracing::warn!(%oid, error = %e, "failed to read prior check row");
            false
        }
    };
    if let Err(e) = cache.put_check(oid, CheckRow { mark: now_ms(), valid, retained }).await {
        tracing::warn!(%oid, error = %e, "failed to record check result");
    }
}

/// The retention sweep: extends object-lock retention over every OID this
/// run actually re-read. A store without retention support
/// treats `retain_file` as a silent no-op, so this is safe to call
/// unconditionally rather than gated on a capability probe.
async fn retain_observed<S: ObjectStore>(ctx: &Arc<VerifyContext<S>>) {
    let oids: Vec<Oid> = ctx.observed.lock().unwrap().iter().copied().collect();
    for oid in oids {
        if let Err(e) = ctx.repo.retain_blob(oid).await {
            tracing::warn!(%oid, error = %e, "failed to extend retention");
            continue;
        }
        let Some(cache) = &ctx.repo.cache else { continue };
        if let Ok(Some(row)) = cache.get_check(oid).await {
            let _ = cache.put_check(oid, CheckRow { retained: true, ..row }).await;
        }
    }
}

fn join_panic(e: tokio::task::JoinError) -> RekkordError {
    RekkordError::Other(anyhow::anyhow!("verify task panicked: {e}"))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStatCache;
    use crate::config::{RepositoryConfig, SaveSettings};
    use crate::keyset::Keyset;
    use crate::store::WriteSettings;
    use bytes::Bytes;
    use rand::RngCore;

    async fn init_memory_repo() -> Arc<Repository<rekkord_store_memory::MemoryStore>> {
        let store = Arc::new(rekkord_store_memory::MemoryStore::default());
        let mut mkey = [0u8; 32];
        rand::rng().fill_bytes(&mut mkey);
        let master = Keyset::from_master_key(&mkey);
        let repo = Repository::init(store, &master, &[], RepositoryConfig::default()).await.unwrap();
        Arc::new(repo.with_cache(Arc::new(MemoryStatCache::new())))
    }

    #[tokio::test]
    async fn a_freshly_saved_snapshot_verifies_clean() {
        let repo = init_memory_repo().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello world").unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"nested file").unwrap();

        let outcome = crate::save::save(repo.clone(), "daily", &[src.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        let results = verify(repo.clone(), &[outcome.oid]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].valid, "expected a clean verify, got {:?}", results[0].error);
    }

    #[tokio::test]
    async fn a_corrupted_raw_blob_fails_verification() {
        let repo = init_memory_repo().await;

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"content that will be corrupted").unwrap();
        let outcome = crate::save::save(repo.clone(), "daily", &[src.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        // Corrupt every raw blob (the chunk(s) backing `a.txt`) by
        // overwriting it in place with garbage of unrelated content.
        let mut raw_paths = Vec::new();
        repo.store
            .list_files("blobs/R/", &mut |path, _size| {
                raw_paths.push(path.to_string());
                true
            })
            .await
            .unwrap();
        assert!(!raw_paths.is_empty(), "expected at least one raw blob to corrupt");
        for path in &raw_paths {
            repo.store.write_file(path, Bytes::from_static(b"not a valid blob at all, just garbage"), WriteSettings::default()).await.unwrap();
        }

        let results = verify(repo.clone(), &[outcome.oid]).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].valid);
        assert!(results[0].error.is_some());
    }

    #[tokio::test]
    async fn two_independent_snapshots_are_checked_independently() {
        let repo = init_memory_repo().await;

        let src_a = tempfile::tempdir().unwrap();
        std::fs::write(src_a.path().join("a.txt"), b"first snapshot's content").unwrap();
        let first = crate::save::save(repo.clone(), "daily", &[src_a.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        let src_b = tempfile::tempdir().unwrap();
        std::fs::write(src_b.path().join("b.txt"), b"second snapshot's content").unwrap();
        let second = crate::save::save(repo.clone(), "daily", &[src_b.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        let results = verify(repo.clone(), &[first.oid, second.oid]).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.valid));
    }

    #[tokio::test]
    async fn a_second_verify_short_circuits_via_the_checks_cache() {
        let repo = init_memory_repo().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"stable content").unwrap();
        let outcome = crate::save::save(repo.clone(), "daily", &[src.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        let first = verify(repo.clone(), &[outcome.oid]).await;
        assert!(first[0].valid);

        let cache = repo.cache.as_ref().unwrap();
        let row = cache.get_check(outcome.oid).await.unwrap().unwrap();
        assert!(row.valid);

        let second = verify(repo.clone(), &[outcome.oid]).await;
        assert!(second[0].valid);
    }

    #[tokio::test]
    async fn verify_retains_every_blob_it_freshly_reads() {
        let repo = init_memory_repo().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"retain me").unwrap();
        let outcome = crate::save::save(repo.clone(), "daily", &[src.path().to_path_buf()], SaveSettings::default()).await.unwrap();

        verify(repo.clone(), &[outcome.oid]).await;

        let cache = repo.cache.as_ref().unwrap();
        let row = cache.get_check(outcome.oid).await.unwrap().unwrap();
        assert!(row.retained, "the memory store's retain_file is a no-op success, so the bit should still be set");
    }
}
