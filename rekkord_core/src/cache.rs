//! The local stat/blob/check cache abstraction.
//!
//! The core depends only on this trait; a production `redb`-backed
//! implementation lives in the sibling `rekkord_cache_redb` crate.
//! [`MemoryStatCache`] here is the in-process implementation used by tests
//! and by callers that don't want a local cache directory at all.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;

use crate::error::RekkordResult;
use crate::oid::{Hash, Oid};
use crate::store::{ObjectStore, TestStatus};

/// A cached stat result for one absolute source path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatRow {
    pub mtime: i64,
    pub ctime: i64,
    pub mode: u32,
    pub size: i64,
    pub hash: Hash,
    pub stored: i64,
}

impl StatRow {
    /// Whether this row still matches a freshly-stat'd file: all four of
    /// `(mtime, ctime, mode, size)` must agree.
    pub fn matches(&self, mtime: i64, ctime: i64, mode: u32, size: i64) -> bool {
        self.mtime == mtime && self.ctime == ctime && self.mode == mode && self.size == size
    }
}

/// A cached integrity-check result for one blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckRow {
    /// Unix milliseconds of the last successful check.
    pub mark: i64,
    pub valid: bool,
    pub retained: bool,
}

/// Local persistent cache of (stat, blob-presence, check) facts, scoped to
/// one repository's current `cid`. Never a source of truth: wiping it only
/// causes redundant work, except for the probabilistic presence check below,
/// whose entire point is to catch the one case where trusting it would be
/// unsafe.
#[async_trait]
pub trait StatCache: Send + Sync + 'static {
    async fn get_stat(&self, path: &str) -> RekkordResult<Option<StatRow>>;
    async fn put_stat(&self, path: &str, row: StatRow) -> RekkordResult<()>;

    async fn has_blob(&self, oid: Oid) -> RekkordResult<bool>;
    async fn put_blob(&self, oid: Oid, size: u64) -> RekkordResult<()>;

    async fn get_check(&self, oid: Oid) -> RekkordResult<Option<CheckRow>>;
    async fn put_check(&self, oid: Oid, row: CheckRow) -> RekkordResult<()>;

    /// Drops every row. Called after a `cid` change or a failed
    /// probabilistic presence check; always safe, never lossy for anything
    /// but re-upload/re-scan work.
    async fn reset(&self) -> RekkordResult<()>;

    /// Flushes any write batched since the last flush. Implementations that
    /// write through immediately may treat this as a no-op.
    async fn flush(&self) -> RekkordResult<()>;

    /// Rolls a ~2% gate and, if it fires, confirms `oid` is still present in
    /// the store. A miss means the cache disagrees with reality: this is
    /// the one case a cache is not allowed to be casually wrong about, so
    /// the whole cache is wiped and the caller must abort the save that
    /// was about to trust this row.
    async fn probabilistic_presence_check(
        &self,
        store: &dyn ObjectStore,
        oid: Oid,
    ) -> RekkordResult<()> {
        if rand::rng().random_range(0..100) >= 2 {
            return Ok(());
        }
        let path = oid.blob_path();
        let exists = matches!(
            store.test_file(&path).await.map_err(crate::error::RekkordError::Other)?,
            TestStatus::Exists { .. }
        );
        if exists {
            Ok(())
        } else {
            self.reset().await?;
            Err(crate::error::RekkordError::CacheInconsistent)
        }
    }
}

/// An in-memory `StatCache`, used by tests and by any caller that opts out
/// of a persistent local cache.
#[derive(Default)]
pub struct MemoryStatCache {
    stats: Mutex<HashMap<String, StatRow>>,
    blobs: Mutex<HashMap<Oid, u64>>,
    checks: Mutex<HashMap<Oid, CheckRow>>,
}

impl MemoryStatCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatCache for MemoryStatCache {
    async fn get_stat(&self, path: &str) -> RekkordResult<Option<StatRow>> {
        Ok(self.stats.lock().unwrap().get(path).copied())
    }

    async fn put_stat(&self, path: &str, row: StatRow) -> RekkordResult<()> {
        self.stats.lock().unwrap().insert(path.to_string(), row);
        Ok(())
    }

    async fn has_blob(&self, oid: Oid) -> RekkordResult<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(&oid))
    }

    async fn put_blob(&self, oid: Oid, size: u64) -> RekkordResult<()> {
        self.blobs.lock().unwrap().insert(oid, size);
        Ok(())
    }

    async fn get_check(&self, oid: Oid) -> RekkordResult<Option<CheckRow>> {
        Ok(self.checks.lock().unwrap().get(&oid).copied())
    }

    async fn put_check(&self, oid: Oid, row: CheckRow) -> RekkordResult<()> {
        self.checks.lock().unwrap().insert(oid, row);
        Ok(())
    }

    async fn reset(&self) -> RekkordResult<()> {
        self.stats.lock().unwrap().clear();
        self.blobs.lock().unwrap().clear();
        self.checks.lock().unwrap().clear();
        Ok(())
    }

    async fn flush(&self) -> RekkordResult<()> {
        Ok(())
    }
}

/// Derives the on-disk cache directory name for a repository:
/// `hex(sha256(url || rid))`.
pub fn cache_dir_name(url: &str, rid: &[u8; 16]) -> String {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(rid);
    data_encoding::HEXLOWER.encode(&hasher.finalize())
}

/// The platform cache root under which per-repository cache directories
/// (named by [`cache_dir_name`]) live, e.g. `~/.cache/rekkord` on Linux.
/// `None` if the platform has no meaningful home/cache directory (containers,
/// some CI sandboxes); callers fall back to running with no persistent cache.
pub fn cache_root() -> Option<std::path::PathBuf> {
    directories::ProjectDirs::from("", "", "rekkord").map(|dirs| dirs.cache_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stat_row_round_trips() {
        let cache = MemoryStatCache::new();
        let row = StatRow { mtime: 1, ctime: 2, mode: 0o644, size: 100, hash: Hash::from_bytes([1; 32]), stored: 100 };
        cache.put_stat("/a/b", row).await.unwrap();
        let got = cache.get_stat("/a/b").await.unwrap().unwrap();
        assert!(got.matches(1, 2, 0o644, 100));
        assert_eq!(got.hash, row.hash);
        assert!(cache.get_stat("/a/c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_clears_every_table() {
        let cache = MemoryStatCache::new();
        let oid = Oid::new(crate::oid::Catalog::Raw, Hash::from_bytes([2; 32]));
        cache.put_blob(oid, 10).await.unwrap();
        cache.put_check(oid, CheckRow { mark: 0, valid: true, retained: false }).await.unwrap();
        cache.reset().await.unwrap();
        assert!(!cache.has_blob(oid).await.unwrap());
        assert!(cache.get_check(oid).await.unwrap().is_none());
    }

    #[test]
    fn cache_dir_name_is_stable() {
        let rid = [9u8; 16];
        let a = cache_dir_name("file:///tmp/repo", &rid);
        let b = cache_dir_name("file:///tmp/repo", &rid);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn cache_root_names_the_project_when_present() {
        if let Some(root) = cache_root() {
            assert!(root.ends_with("rekkord"));
        }
    }
}
