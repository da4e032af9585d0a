//! A local-filesystem [`ObjectStore`], used for single-machine repositories
//! and as the backend exercised by most of the pipeline integration tests.
//!
//! `resolve_path` rejects any path component that would escape the store
//! root (`..`, an absolute path) before ever touching the filesystem;
//! `write_file` creates parent directories on demand so callers never have
//! to pre-create the two-hex-digit blob subdirectories themselves.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use rekkord_core::store::{ChecksumType, DirStatus, ObjectStore, StoreResult, TestStatus, WriteSettings, WriteStatus};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalStore { base_path: base_path.into() }
    }

    fn resolve_path(&self, path: &str) -> anyhow::Result<PathBuf> {
        if path.contains("..") || path.starts_with('/') {
            anyhow::bail!("invalid path: '{path}'. Must be a relative path without '..'.");
        }
        Ok(self.base_path.join(path))
    }
}

/// Recursively lists every regular file under `root`, feeding each one
/// (relative to `root`, using `/` separators) plus its size to `callback`.
/// Synchronous; callers run this inside `spawn_blocking`.
fn walk(root: &Path, out: &mut Vec<(String, u64)>) {
    for entry in walkdir::WalkDir::new(root).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else { continue };
        let Some(relative) = relative.to_str() else { continue };
        let relative = relative.replace(std::path::MAIN_SEPARATOR, "/");
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        out.push((relative, size));
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn create_directory(&self, path: &str) -> StoreResult<DirStatus> {
        let full_path = self.resolve_path(path)?;
        tokio::fs::create_dir_all(&full_path).await?;
        Ok(DirStatus::Exists)
    }

    async fn delete_directory(&self, path: &str) -> StoreResult<DirStatus> {
        let full_path = self.resolve_path(path)?;
        match tokio::fs::remove_dir_all(&full_path).await {
            Ok(()) => Ok(DirStatus::Missing),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DirStatus::Missing),
            Err(e) => Err(e.into()),
        }
    }

    async fn test_directory(&self, path: &str) -> StoreResult<DirStatus> {
        let full_path = self.resolve_path(path)?;
        match tokio::fs::metadata(&full_path).await {
            Ok(meta) if meta.is_dir() => Ok(DirStatus::Exists),
            Ok(_) => Ok(DirStatus::Missing),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DirStatus::Missing),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(DirStatus::AccessDenied),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_file(&self, path: &str) -> StoreResult<Bytes> {
        let full_path = self.resolve_path(path)?;
        let bytes = tokio::fs::read(&full_path).await?;
        Ok(Bytes::from(bytes))
    }

    async fn write_file(&self, path: &str, bytes: Bytes, settings: WriteSettings) -> StoreResult<WriteStatus> {
        let full_path = self.resolve_path(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if settings.conditional {
            let mut file = match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&full_path).await {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(WriteStatus::AlreadyExists),
                Err(e) => return Err(e.into()),
            };
            file.write_all(&bytes).await?;
            file.flush().await?;
        } else {
            tokio::fs::write(&full_path, &bytes).await?;
        }
        Ok(WriteStatus::Success)
    }

    async fn delete_file(&self, path: &str) -> StoreResult<()> {
        let full_path = self.resolve_path(path)?;
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn retain_file(&self, _path: &str, _retain_ms: i64) -> StoreResult<()> {
        // The local filesystem has no object-lock equivalent; retention is a no-op.
        Ok(())
    }

    async fn list_files(&self, prefix: &str, callback: &mut (dyn FnMut(&str, u64) -> bool + Send)) -> StoreResult<()> {
        let root = self.resolve_path(prefix)?;
        let prefix = prefix.trim_end_matches('/').to_string();

        let entries = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk(&root, &mut out);
            out
        })
        .await
        .map_err(|e| anyhow::anyhow!("local store listing task failed: {e}"))?;

        for (relative, size) in entries {
            let path = if relative.is_empty() { prefix.clone() } else { format!("{prefix}/{relative}") };
            if !callback(&path, size) {
                break;
            }
        }
        Ok(())
    }

    async fn test_file(&self, path: &str) -> StoreResult<TestStatus> {
        let full_path = self.resolve_path(path)?;
        match tokio::fs::metadata(&full_path).await {
            Ok(meta) => Ok(TestStatus::Exists { size: meta.len() }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(TestStatus::Missing),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(TestStatus::AccessDenied),
            Err(e) => Err(e.into()),
        }
    }

    fn checksum_type(&self) -> Option<ChecksumType> {
        None
    }

    fn default_parallelism(&self) -> usize {
        2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_traversal_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let err = store.write_file("../escape", Bytes::new(), WriteSettings::default()).await.unwrap_err();
        assert!(err.to_string().contains("invalid path"));
    }

    #[tokio::test]
    async fn write_read_round_trips_and_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.write_file("blobs/R/aa/deadbeef", Bytes::from_static(b"hello"), WriteSettings::default()).await.unwrap();
        let read = store.read_file("blobs/R/aa/deadbeef").await.unwrap();
        assert_eq!(read, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn conditional_write_reports_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let settings = WriteSettings { conditional: true, retain_ms: 0, checksum: None };
        assert_eq!(store.write_file("x", Bytes::from_static(b"1"), settings.clone()).await.unwrap(), WriteStatus::Success);
        assert_eq!(store.write_file("x", Bytes::from_static(b"2"), settings).await.unwrap(), WriteStatus::AlreadyExists);
        assert_eq!(store.read_file("x").await.unwrap(), Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn list_files_finds_nested_entries_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.write_file("blobs/R/aa/1", Bytes::new(), WriteSettings::default()).await.unwrap();
        store.write_file("blobs/R/bb/2", Bytes::new(), WriteSettings::default()).await.unwrap();
        store.write_file("tags/x", Bytes::new(), WriteSettings::default()).await.unwrap();

        let mut seen = Vec::new();
        store
            .list_files("blobs", &mut |path, _size| {
                seen.push(path.to_string());
                true
            })
            .await
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| p.starts_with("blobs")));
    }

    #[tokio::test]
    async fn test_file_reports_missing_and_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert_eq!(store.test_file("nope").await.unwrap(), TestStatus::Missing);
        store.write_file("x", Bytes::from_static(b"hello"), WriteSettings::default()).await.unwrap();
        assert_eq!(store.test_file("x").await.unwrap(), TestStatus::Exists { size: 5 });
    }

    #[tokio::test]
    async fn delete_file_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.delete_file("nope").await.unwrap();
    }
}
