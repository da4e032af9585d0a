//! Ambient configuration knobs consumed by the core: thread budget,
//! compression level, retention, and the per-operation flag bundles for
//! save/restore.

/// Repository-wide knobs. The CLI/config-file layer (out of scope) is
/// expected to populate this and hand it to [`crate::repository::Repository`].
///
/// `Serialize`/`Deserialize` exist for test fixtures only; the wire format
/// this core actually persists is the fixed binary `rekkord` config blob in
/// [`crate::repository`], never this struct.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RepositoryConfig {
    /// Width of the dir/file task pools. `0` means "use the store's own
    /// `default_parallelism()` hint".
    pub threads: usize,
    /// LZ4 compression level passed to `lz4_flex`'s frame encoder.
    pub compression_level: i32,
    /// Milliseconds to request object-lock retention for on every blob
    /// write, if the store supports it. `0` disables retention requests.
    pub retain_ms: i64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            compression_level: 0,
            retain_ms: 0,
        }
    }
}

impl RepositoryConfig {
    pub fn effective_threads(&self, store_hint: usize) -> usize {
        if self.threads == 0 {
            store_hint.max(1)
        } else {
            self.threads
        }
    }
}

/// Per-save flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct SaveSettings {
    pub follow_symlinks: bool,
    pub noatime: bool,
    pub atime: bool,
    pub xattrs: bool,
}

/// Per-restore flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreSettings {
    pub force: bool,
    pub unlink: bool,
    pub chown: bool,
    pub xattrs: bool,
    pub verbose: bool,
    /// Read every referenced blob but perform no filesystem writes.
    pub fake: bool,
}
