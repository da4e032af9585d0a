//! An in-memory [`ObjectStore`], used by the core's own test suite and by
//! any caller that wants a repository with no real backing storage.
//!
//! Backed by a `DashMap<String, Bytes>`, widened to the directory-ful,
//! conditional-write, retention-hint shape `ObjectStore` requires.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rekkord_core::store::{ChecksumType, DirStatus, ObjectStore, StoreResult, TestStatus, WriteSettings, WriteStatus};

#[derive(Debug, Default)]
pub struct MemoryStore {
    files: DashMap<String, Bytes>,
    directories: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_directory(&self, path: &str) -> StoreResult<DirStatus> {
        self.directories.lock().unwrap().insert(path.trim_end_matches('/').to_string());
        Ok(DirStatus::Exists)
    }

    async fn delete_directory(&self, path: &str) -> StoreResult<DirStatus> {
        self.directories.lock().unwrap().remove(path.trim_end_matches('/'));
        Ok(DirStatus::Missing)
    }

    async fn test_directory(&self, path: &str) -> StoreResult<DirStatus> {
        let path = path.trim_end_matches('/');
        if self.directories.lock().unwrap().contains(path) {
            Ok(DirStatus::Exists)
        } else {
            Ok(DirStatus::Missing)
        }
    }

    async fn read_file(&self, path: &str) -> StoreResult<Bytes> {
        self.files.get(path).map(|entry| entry.clone()).ok_or_else(|| anyhow::anyhow!("'{path}' not found"))
    }

    async fn write_file(&self, path: &str, bytes: Bytes, settings: WriteSettings) -> StoreResult<WriteStatus> {
        if settings.conditional && self.files.contains_key(path) {
            return Ok(WriteStatus::AlreadyExists);
        }
        self.files.insert(path.to_string(), bytes);
        Ok(WriteStatus::Success)
    }

    async fn delete_file(&self, path: &str) -> StoreResult<()> {
        self.files.remove(path);
        Ok(())
    }

    async fn retain_file(&self, _path: &str, _retain_ms: i64) -> StoreResult<()> {
        // This backend has no object-lock concept; retention is a silent no-op.
        Ok(())
    }

    async fn list_files(&self, prefix: &str, callback: &mut (dyn FnMut(&str, u64) -> bool + Send)) -> StoreResult<()> {
        for entry in self.files.iter() {
            if entry.key().starts_with(prefix) && !callback(entry.key(), entry.value().len() as u64) {
                break;
            }
        }
        Ok(())
    }

    async fn test_file(&self, path: &str) -> StoreResult<TestStatus> {
        match self.files.get(path) {
            Some(entry) => Ok(TestStatus::Exists { size: entry.len() as u64 }),
            None => Ok(TestStatus::Missing),
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
    async fn conditional_write_reports_already_exists() {
        let store = MemoryStore::new();
        let settings = WriteSettings { conditional: true, retain_ms: 0, checksum: None };
        assert_eq!(store.write_file("a", Bytes::from_static(b"1"), settings.clone()).await.unwrap(), WriteStatus::Success);
        assert_eq!(store.write_file("a", Bytes::from_static(b"2"), settings).await.unwrap(), WriteStatus::AlreadyExists);
        assert_eq!(store.read_file("a").await.unwrap(), Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn list_files_respects_prefix_and_early_stop() {
        let store = MemoryStore::new();
        let settings = WriteSettings::default();
        store.write_file("blobs/R/aa/1", Bytes::new(), settings.clone()).await.unwrap();
        store.write_file("blobs/R/aa/2", Bytes::new(), settings.clone()).await.unwrap();
        store.write_file("tags/x", Bytes::new(), settings).await.unwrap();

        let mut seen = Vec::new();
        store
            .list_files("blobs/", &mut |path, _size| {
                seen.push(path.to_string());
                true
            })
            .await
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_file_reports_missing_and_present() {
        let store = MemoryStore::new();
        assert_eq!(store.test_file("nope").await.unwrap(), TestStatus::Missing);
        store.write_file("x", Bytes::from_static(b"hello"), WriteSettings::default()).await.unwrap();
        assert_eq!(store.test_file("x").await.unwrap(), TestStatus::Exists { size: 5 });
    }
}
