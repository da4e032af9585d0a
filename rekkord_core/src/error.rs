//! The error taxonomy surfaced to callers of the repository core.
//!
//! Every variant corresponds to one row of the error table: most flow
//! through `Result<T, RekkordError>` and are either propagated, downgraded
//! to success (`AlreadyExists`), or logged-and-skipped by the caller
//! depending on context. `PermissionError` is the sole exception: a keyset
//! mode violation is a programming error and is raised via `panic!`, never
//! returned here (see [`crate::keyset::Keyset::require_mode`]).

use crate::oid::Oid;

pub type RekkordResult<T> = std::result::Result<T, RekkordError>;

#[derive(thiserror::Error, Debug)]
pub enum RekkordError {
    #[error("object store reports '{path}' missing")]
    StoreMissing { path: String },

    #[error("object store denied access to '{path}'")]
    StoreAccessDenied { path: String },

    #[error("object already exists at '{path}'")]
    AlreadyExists { path: String },

    #[error("blob '{oid}' is truncated (secretstream never reached TAG_FINAL)")]
    Truncated { oid: Oid },

    #[error("authentication failed while decoding blob '{oid}'")]
    AuthenticationFailed { oid: Oid },

    #[error("unexpected blob version {found} (expected {expected}) for '{oid}'")]
    UnexpectedVersion {
        oid: Oid,
        found: u8,
        expected: u8,
    },

    #[error("malformed blob '{oid}': {reason}")]
    MalformedBlob { oid: Oid, reason: String },

    #[error("hash mismatch for blob '{oid}'")]
    HashMismatch { oid: Oid },

    #[error("chunk size mismatch for blob '{oid}': expected {expected}, got {found}")]
    ChunkSizeMismatch {
        oid: Oid,
        expected: i64,
        found: i64,
    },

    #[error("unsafe entry name '{name}'")]
    UnsafeName { name: String },

    #[error("local cache is inconsistent with the store; it has been wiped")]
    CacheInconsistent,

    #[error("key file signature verification failed, it may be corrupt or tampered with")]
    KeyfileInvalid,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RekkordError {
    /// Whether this error is the silent-success `AlreadyExists` case.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, RekkordError::AlreadyExists { .. })
    }
}
