//! Wire-format constants and the blob type code table.
//!
//! These are load-bearing on-disk constants, not style choices: changing
//! any of them changes what existing repositories decode as.

use crate::oid::Hash;

/// Blob intro format version (`BlobIntro.version`).
pub const BLOB_VERSION: u8 = 7;
/// Tag payload format version (`TagIntro.version`).
pub const TAG_VERSION: u8 = 2;
/// Identity config blob format version.
pub const CONFIG_VERSION: u8 = 2;
/// Plaintext segment size fed to the secretstream codec.
pub const BLOB_SPLIT: usize = 32 * 1024;
/// Per-segment authenticated overhead: 1 tag byte + 16-byte Poly1305 tag.
pub const SEGMENT_OVERHEAD: usize = 17;

/// Integer type codes for every blob kind, including legacy codes kept for
/// read-path migration. The type code is part of the hash input, so
/// re-typing a blob changes its OID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum BlobType {
    Chunk = 0,
    File = 1,
    Directory1 = 2,
    Snapshot1 = 3,
    Link = 4,
    Snapshot2 = 5,
    Directory2 = 6,
    Snapshot3 = 7,
    Directory3 = 8,
    Snapshot4 = 9,
    Directory = 10,
    Snapshot5 = 11,
    Snapshot = 12,
}

impl BlobType {
    pub fn from_i8(v: i8) -> Option<Self> {
        use BlobType::*;
        Some(match v {
            0 => Chunk,
            1 => File,
            2 => Directory1,
            3 => Snapshot1,
            4 => Link,
            5 => Snapshot2,
            6 => Directory2,
            7 => Snapshot3,
            8 => Directory3,
            9 => Snapshot4,
            10 => Directory,
            11 => Snapshot5,
            12 => Snapshot,
            _ => return None,
        })
    }

    pub fn is_directory_like(self) -> bool {
        matches!(
            self,
            BlobType::Directory1 | BlobType::Directory2 | BlobType::Directory3 | BlobType::Directory
        )
    }

    pub fn is_snapshot_like(self) -> bool {
        matches!(
            self,
            BlobType::Snapshot1
                | BlobType::Snapshot2
                | BlobType::Snapshot3
                | BlobType::Snapshot4
                | BlobType::Snapshot5
                | BlobType::Snapshot
        )
    }
}

/// Keyed BLAKE3 over `plaintext`, with `salt` XORed in its last byte with
/// the blob's type code. Binds the hash to both the repository (via the
/// per-repo salt) and the blob's semantic kind.
pub fn hash_blob(blob_type: i8, plaintext: &[u8], salt: &[u8; 32]) -> Hash {
    let mut key = *salt;
    key[31] ^= blob_type as u8;
    let hash = blake3::Hasher::new_keyed(&key).update(plaintext).finalize();
    Hash::from_bytes(*hash.as_bytes())
}
