//! The abstract Object Store interface.
//!
//! A narrow contract; every back-end (local filesystem, SFTP, S3-compatible)
//! implements it identically. The core never depends on a concrete
//! back-end, only on this trait.

use async_trait::async_trait;
use bytes::Bytes;

pub type StoreResult<T> = anyhow::Result<T>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirStatus {
    Exists,
    Missing,
    AccessDenied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
    AlreadyExists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestStatus {
    Exists { size: u64 },
    Missing,
    AccessDenied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumType {
    Crc32,
    Crc32c,
    Crc64Nvme,
    Sha1,
    Sha256,
}

/// Settings carried by a single `write_file` call.
#[derive(Clone, Debug, Default)]
pub struct WriteSettings {
    /// Fail (return `AlreadyExists`) instead of overwriting if the path is
    /// already occupied.
    pub conditional: bool,
    /// Milliseconds to apply an object-lock/retention hint for, if the
    /// back-end supports it. `0` means "no retention requested".
    pub retain_ms: i64,
    /// An optional precomputed checksum of the kind the back-end prefers
    /// (see [`ObjectStore::checksum_type`]), to avoid the back-end
    /// recomputing it.
    pub checksum: Option<(ChecksumType, Vec<u8>)>,
}

/// Opaque CRUD of named blobs with conditional-write and retention hints.
///
/// All operations must be safe to invoke from multiple tasks simultaneously;
/// the core never serializes its calls into one back-end.
#[async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync + 'static {
    async fn create_directory(&self, path: &str) -> StoreResult<DirStatus>;
    async fn delete_directory(&self, path: &str) -> StoreResult<DirStatus>;
    async fn test_directory(&self, path: &str) -> StoreResult<DirStatus>;

    /// Reads a whole file. Back-ends are expected to enforce an upper size
    /// limit appropriate to the path (several MiB for most paths, up to
    /// 256 MiB for chunk blobs) and return an error rather than exhausting
    /// memory on a pathological read.
    async fn read_file(&self, path: &str) -> StoreResult<Bytes>;

    async fn write_file(
        &self,
        path: &str,
        bytes: Bytes,
        settings: WriteSettings,
    ) -> StoreResult<WriteStatus>;

    async fn delete_file(&self, path: &str) -> StoreResult<()>;

    /// Applies (or refreshes) an object-lock/retention hint. Back-ends that
    /// do not support retention MUST treat this as a silent no-op success.
    async fn retain_file(&self, path: &str, retain_ms: i64) -> StoreResult<()>;

    /// Enumerates leaf blobs beneath `prefix`. Lexical order is not
    /// required. The callback returns `false` to stop enumeration early.
    async fn list_files(
        &self,
        prefix: &str,
        callback: &mut (dyn FnMut(&str, u64) -> bool + Send),
    ) -> StoreResult<()>;

    async fn test_file(&self, path: &str) -> StoreResult<TestStatus>;

    /// Which checksum kind, if any, this back-end expects in
    /// [`WriteSettings::checksum`].
    fn checksum_type(&self) -> Option<ChecksumType>;

    /// A default parallelism hint (e.g. 2x cores for local disk, up to
    /// 8x cores capped at 64 for S3-class stores).
    fn default_parallelism(&self) -> usize;
}
