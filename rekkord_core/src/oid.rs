//! Object identifiers: the (catalog, hash) pair that addresses every blob.

use std::fmt;

/// Domain-specific salt XORed (in its last byte) with a blob's type code
/// before keying BLAKE3, so a hash is bound to both the repository and the
/// blob's semantic kind. See [`crate::repository::Repository::make_salt`].
pub const HASH_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; HASH_LEN];
        data_encoding::HEXLOWER.decode_mut(s.as_bytes(), &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}…)", &self.to_hex()[..10])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Two-way storage-tier partition: metadata (directories, snapshots) vs raw
/// (chunks, files, links). Used only as a path hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Catalog {
    Meta,
    Raw,
}

impl Catalog {
    pub fn as_char(self) -> char {
        match self {
            Catalog::Meta => 'M',
            Catalog::Raw => 'R',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'M' => Some(Catalog::Meta),
            'R' => Some(Catalog::Raw),
            _ => None,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Catalog::Meta => "M",
            Catalog::Raw => "R",
        }
    }
}

/// The canonical address of a blob: `(catalog, hash)`, serialized as
/// `<C><hex32>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid {
    pub catalog: Catalog,
    pub hash: Hash,
}

impl Oid {
    pub fn new(catalog: Catalog, hash: Hash) -> Self {
        Self { catalog, hash }
    }

    /// Blob path under the repository root: `blobs/<catalog>/<prefix2hex>/<hash64hex>`.
    pub fn blob_path(&self) -> String {
        let hex = self.hash.to_hex();
        format!("blobs/{}/{}/{}", self.catalog.dir_name(), &hex[0..2], hex)
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut chars = s.chars();
        let catalog = Catalog::from_char(chars.next()?)?;
        let hash = Hash::from_hex(chars.as_str())?;
        Some(Self { catalog, hash })
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.catalog.as_char(), self.hash)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.catalog.as_char(), self.hash)
    }
}
