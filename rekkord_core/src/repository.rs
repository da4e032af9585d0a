//! The Repository: owns the object store, keyset, and repository identity;
//! mediates every blob/tag/config read and write.

use std::sync::Arc;

use bytes::Bytes;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce, aead::Aead};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;

use crate::cache::StatCache;
use crate::codec::{self, DecodedBlob};
use crate::config::RepositoryConfig;
use crate::error::{RekkordError, RekkordResult};
use crate::keyset::{AccessMode, Keyset, Role, BADGE_LEN};
use crate::oid::{Catalog, Hash, Oid};
use crate::store::{ObjectStore, TestStatus, WriteSettings, WriteStatus};
use crate::wire::{BlobType, CONFIG_VERSION, TAG_VERSION};

const CONFIG_PATH: &str = "rekkord";
const ID_LEN: usize = 16;
/// Ciphertext bytes per tag fragment; keeps fragment count (at most 100,
/// two decimal digits) comfortably under budget for any realistic tag.
const TAG_FRAGMENT_MAX: usize = 160;

#[derive(Clone, Copy, Debug)]
pub struct RepositoryIdentity {
    pub rid: [u8; ID_LEN],
    pub cid: [u8; ID_LEN],
}

/// Which domain a [`Repository::make_salt`] call is keying: the blob hash
/// salt, or the content-defined chunker's gear-table seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaltKind {
    Hash = 0,
    SplitterSeed = 1,
}

pub struct TagInfo {
    pub name: String,
    pub oid: Oid,
    pub payload: Vec<u8>,
}

pub struct BlobRead {
    pub blob_type: BlobType,
    pub plaintext: Vec<u8>,
    pub raw_size: usize,
}

/// Owns an Object Store, a Keyset, and the repository identity. The
/// parallel task pools live one layer up (in the save/restore pipelines,
/// which own their own `tokio` task sets sized from `config.threads`); the
/// repository itself is just the mediator of reads/writes.
pub struct Repository<S: ObjectStore> {
    pub store: Arc<S>,
    pub keyset: Keyset,
    pub cache: Option<Arc<dyn StatCache>>,
    pub config: RepositoryConfig,
    pub identity: RepositoryIdentity,
}

impl<S: ObjectStore> Repository<S> {
    pub async fn is_repository(store: &S) -> RekkordResult<bool> {
        match store.test_file(CONFIG_PATH).await.map_err(RekkordError::Other)? {
            TestStatus::Exists { .. } => Ok(true),
            TestStatus::Missing | TestStatus::AccessDenied => Ok(false),
        }
    }

    /// Initializes an empty store: directory scaffolding, fresh `{rid, cid}`,
    /// a signed-and-encrypted config blob, and one exported key file per
    /// user (written to local disk at the given paths, never into the store
    /// — several roles' key files carry live secret key material).
    pub async fn init(
        store: Arc<S>,
        master: &Keyset,
        users: &[(Role, &std::path::Path)],
        config: RepositoryConfig,
    ) -> RekkordResult<Self> {
        master.require_mode(AccessMode::Config);
        if Self::is_repository(&store).await? {
            return Err(RekkordError::AlreadyExists { path: CONFIG_PATH.into() });
        }

        for dir in ["blobs", "tags", "tmp", "keys"] {
            store.create_directory(dir).await.map_err(RekkordError::Other)?;
        }
        for catalog in [Catalog::Meta, Catalog::Raw] {
            let base = format!("blobs/{}", catalog.dir_name());
            store.create_directory(&base).await.map_err(RekkordError::Other)?;
            for byte in 0u16..256 {
                store
                    .create_directory(&format!("{base}/{byte:02x}"))
                    .await
                    .map_err(RekkordError::Other)?;
            }
        }

        let mut rng = rand::rng();
        let mut rid = [0u8; ID_LEN];
        let mut cid = [0u8; ID_LEN];
        rng.fill_bytes(&mut rid);
        rng.fill_bytes(&mut cid);

        let repo = Repository {
            store,
            keyset: master.clone(),
            cache: None,
            config,
            identity: RepositoryIdentity { rid, cid },
        };
        repo.write_config(false).await?;

        for (role, path) in users {
            let (raw, _decoded) = master.export_key_file(*role)?;
            crate::keyset::write_key_file(path, &raw)?;
        }

        Ok(repo)
    }

    /// Loads a keyset from `keyfile_path`, reads and verifies the config
    /// blob with its `akey`, and returns an authenticated repository handle.
    pub async fn authenticate(
        store: Arc<S>,
        keyfile_path: &std::path::Path,
        vkey: Option<&[u8; 32]>,
        config: RepositoryConfig,
    ) -> RekkordResult<Self> {
        let keyset = crate::keyset::load_keyset(keyfile_path, vkey)?;
        let mut repo = Repository {
            store,
            keyset,
            cache: None,
            config,
            identity: RepositoryIdentity { rid: [0; ID_LEN], cid: [0; ID_LEN] },
        };
        repo.identity = repo.read_config().await?;
        Ok(repo)
    }

    pub fn with_cache(mut self, cache: Arc<dyn StatCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Deterministic per-repository domain salt, derived from the public
    /// `wkey` via keyed BLAKE2b with `kind` as the personalization field —
    /// every role can compute this without needing `dkey`.
    pub fn make_salt(&self, kind: SaltKind) -> [u8; 32] {
        let wkey = self.keyset.wkey.expect("make_salt requires wkey");
        make_salt_from(&wkey, kind as u64)
    }

    /// A 64-bit seed for the content-defined chunker, derived from
    /// [`SaltKind::SplitterSeed`].
    pub fn splitter_seed(&self) -> u64 {
        let salt = self.make_salt(SaltKind::SplitterSeed);
        u64::from_le_bytes(salt[..8].try_into().unwrap())
    }

    async fn write_config(&self, overwrite: bool) -> RekkordResult<()> {
        let ckey = self.keyset.ckey.expect("write_config requires ckey");
        let vkey = self.keyset.vkey.expect("write_config requires vkey");

        let mut plaintext = Vec::with_capacity(1 + 16 + 16 + 8);
        plaintext.push(CONFIG_VERSION);
        plaintext.extend_from_slice(&self.identity.rid);
        plaintext.extend_from_slice(&self.identity.cid);
        plaintext.extend_from_slice(&self.config.retain_ms.to_le_bytes());

        let signing = SigningKey::from_bytes(&ckey);
        let sig = signing.sign(&plaintext);

        let mut signed = plaintext;
        signed.extend_from_slice(&sig.to_bytes());

        let cipher = XChaCha20Poly1305::new((&config_cipher_key(&vkey)).into());
        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let ct = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), signed.as_slice())
            .expect("config encryption cannot fail");

        let mut ciphertext = Vec::with_capacity(24 + ct.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&ct);

        let settings = WriteSettings { conditional: !overwrite, retain_ms: 0, checksum: None };
        match self.store.write_file(CONFIG_PATH, Bytes::from(ciphertext), settings).await.map_err(RekkordError::Other)? {
            WriteStatus::Success | WriteStatus::AlreadyExists => Ok(()),
        }
    }

    async fn read_config(&self) -> RekkordResult<RepositoryIdentity> {
        let vkey = self.keyset.vkey.expect("read_config requires vkey");
        let akey = self.keyset.akey.expect("read_config requires akey");

        let raw = self.store.read_file(CONFIG_PATH).await.map_err(RekkordError::Other)?;
        if raw.len() < 24 {
            return Err(RekkordError::Other(anyhow::anyhow!("config blob is truncated")));
        }
        let (nonce_bytes, ct) = raw.split_at(24);
        let cipher = XChaCha20Poly1305::new((&config_cipher_key(&vkey)).into());
        let signed = cipher
            .decrypt(XNonce::from_slice(nonce_bytes), ct)
            .map_err(|_| RekkordError::AuthenticationFailed { oid: Oid::new(Catalog::Meta, Hash::from_bytes([0; 32])) })?;

        if signed.len() < 1 + 16 + 16 + 8 + 64 {
            return Err(RekkordError::Other(anyhow::anyhow!("config blob is truncated")));
        }
        let body_len = signed.len() - 64;
        let (body, sig_bytes) = signed.split_at(body_len);

        let verifier = VerifyingKey::from_bytes(&akey).map_err(|_| RekkordError::Other(anyhow::anyhow!("invalid akey")))?;
        let sig = Signature::from_bytes(sig_bytes.try_into().expect("signature slice is 64 bytes"));
        verifier.verify_strict(body, &sig).map_err(|_| RekkordError::AuthenticationFailed {
            oid: Oid::new(Catalog::Meta, Hash::from_bytes([0; 32])),
        })?;

        let version = body[0];
        if version != CONFIG_VERSION {
            return Err(RekkordError::UnexpectedVersion {
                oid: Oid::new(Catalog::Meta, Hash::from_bytes([0; 32])),
                found: version,
                expected: CONFIG_VERSION,
            });
        }
        let mut rid = [0u8; ID_LEN];
        rid.copy_from_slice(&body[1..17]);
        let mut cid = [0u8; ID_LEN];
        cid.copy_from_slice(&body[17..33]);

        Ok(RepositoryIdentity { rid, cid })
    }

    /// Rotates `cid`, forcing every local cache keyed on the old value to
    /// rebuild. Requires `Config` mode, same as `init`.
    pub async fn change_cid(&mut self) -> RekkordResult<()> {
        self.keyset.require_mode(AccessMode::Config);
        let mut cid = [0u8; ID_LEN];
        rand::rng().fill_bytes(&mut cid);
        self.identity.cid = cid;
        self.write_config(true).await
    }

    /// Fetches and decrypts `oid`. Always goes to the store directly —
    /// callers that want the stat-cache short-circuit check
    /// `cache.has_blob` themselves before calling this (mirrors
    /// `write_blob`'s own short-circuit, which lives here because writing,
    /// unlike reading, is otherwise redundant work worth skipping inside
    /// the repository itself).
    pub async fn read_blob(&self, oid: Oid) -> RekkordResult<BlobRead> {
        let dkey = self.keyset.dkey.expect("read_blob requires dkey");
        let wkey = self.keyset.wkey.expect("read_blob requires wkey");

        let raw = self.store.read_file(&oid.blob_path()).await.map_err(RekkordError::Other)?;
        let raw_size = raw.len();
        let DecodedBlob { blob_type, plaintext } = codec::decode_blob(&oid, &raw, &dkey, &wkey)?;

        let (blob_type, plaintext) = if blob_type.is_directory_like() || blob_type.is_snapshot_like() {
            crate::tree::migrate_legacy(blob_type, plaintext)
        } else {
            (blob_type, plaintext)
        };

        Ok(BlobRead { blob_type, plaintext, raw_size })
    }

    /// Like [`Self::read_blob`], but additionally recomputes the keyed hash
    /// of the blob exactly as it sat on disk — *before* any legacy
    /// migration — and confirms it matches `oid.hash`.
    ///
    /// `decode_blob` authenticates the ciphertext against tampering but
    /// never checks that the plaintext it decrypted is the one `oid` names:
    /// nothing stops a store from serving the (validly encrypted) bytes for
    /// one OID at another OID's path. `migrate_legacy` is documented as
    /// hash-preserving, so the hash must be taken against the pre-migration
    /// `(type, bytes)` pair for this to mean anything for an old blob; this
    /// is why the check lives here, with access to the undecoded pair,
    /// rather than in a caller working from [`BlobRead`] alone.
    pub async fn read_blob_checked(&self, oid: Oid) -> RekkordResult<BlobRead> {
        let dkey = self.keyset.dkey.expect("read_blob_checked requires dkey");
        let wkey = self.keyset.wkey.expect("read_blob_checked requires wkey");

        let raw = self.store.read_file(&oid.blob_path()).await.map_err(RekkordError::Other)?;
        let raw_size = raw.len();
        let DecodedBlob { blob_type, plaintext } = codec::decode_blob(&oid, &raw, &dkey, &wkey)?;

        let salt = self.make_salt(SaltKind::Hash);
        let hash = crate::wire::hash_blob(blob_type as i8, &plaintext, &salt);
        if hash != oid.hash {
            return Err(RekkordError::HashMismatch { oid });
        }

        let (blob_type, plaintext) = if blob_type.is_directory_like() || blob_type.is_snapshot_like() {
            crate::tree::migrate_legacy(blob_type, plaintext)
        } else {
            (blob_type, plaintext)
        };

        Ok(BlobRead { blob_type, plaintext, raw_size })
    }

    /// Encrypts and writes `plaintext` as a blob of `blob_type`, short-
    /// circuiting through the local blob cache when it already knows this
    /// OID. `AlreadyExists` from the store is treated as success.
    pub async fn write_blob(&self, blob_type: BlobType, plaintext: &[u8]) -> RekkordResult<(Oid, usize)> {
        let wkey = self.keyset.wkey.expect("write_blob requires wkey");
        let salt = self.make_salt(SaltKind::Hash);

        let hash = crate::wire::hash_blob(blob_type as i8, plaintext, &salt);
        let catalog = if blob_type.is_directory_like() || blob_type.is_snapshot_like() { Catalog::Meta } else { Catalog::Raw };
        let oid = Oid::new(catalog, hash);

        if let Some(cache) = &self.cache {
            if cache.has_blob(oid).await? {
                return Ok((oid, 0));
            }
        }

        let (encoded, encoded_oid) = codec::encode_blob(blob_type, plaintext, &wkey, &salt, self.config.compression_level)?;
        debug_assert_eq!(encoded_oid.hash, oid.hash);
        let size = encoded.len();

        let settings = WriteSettings { conditional: true, retain_ms: self.config.retain_ms, checksum: None };
        let status = self.store.write_file(&oid.blob_path(), Bytes::from(encoded), settings).await.map_err(RekkordError::Other)?;

        if let Some(cache) = &self.cache {
            cache.put_blob(oid, size as u64).await?;
        }

        match status {
            WriteStatus::Success => Ok((oid, size)),
            WriteStatus::AlreadyExists => Ok((oid, 0)),
        }
    }

    pub async fn retain_blob(&self, oid: Oid) -> RekkordResult<()> {
        self.store.retain_file(&oid.blob_path(), self.config.retain_ms).await.map_err(RekkordError::Other)
    }

    pub async fn test_blob(&self, oid: Oid) -> RekkordResult<TestStatus> {
        self.store.test_file(&oid.blob_path()).await.map_err(RekkordError::Other)
    }

    /// Produces a tag: signs `oid || header_payload` with this keyset's
    /// `skey`, bundles the signature with this keyset's own badge (so any
    /// reader holding only `vkey` can certify the signer's `pkey`), seals
    /// the bundle to `tkey`, and splits the ciphertext into ≤160-byte
    /// fragments named `<prefix32hex>_<index02>_<base64url_nopad>` — the
    /// entire payload lives in the path, so fragment file contents are
    /// empty.
    pub async fn write_tag(&self, oid: Oid, header_payload: &[u8]) -> RekkordResult<String> {
        self.keyset.require_mode(AccessMode::Log);
        let skey = self.keyset.skey.expect("Log mode implies skey");
        let tkey = self.keyset.tkey.expect("Log mode implies tkey");
        let badge = self.keyset.badge();

        let mut intro = Vec::with_capacity(1 + 1 + 32 + header_payload.len());
        intro.push(TAG_VERSION);
        intro.push(oid.catalog.as_char() as u8);
        intro.extend_from_slice(oid.hash.as_bytes());
        intro.extend_from_slice(header_payload);

        let signing = SigningKey::from_bytes(&skey);
        let sig = signing.sign(&intro);

        let mut plaintext = Vec::with_capacity(BADGE_LEN + 64 + intro.len());
        plaintext.extend_from_slice(badge);
        plaintext.extend_from_slice(&sig.to_bytes());
        plaintext.extend_from_slice(&intro);

        let ciphertext = codec::seal_to(&plaintext, &tkey);

        let mut prefix_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut prefix_bytes);
        let prefix = data_encoding::HEXLOWER.encode(&prefix_bytes);

        let fragments: Vec<&[u8]> = ciphertext.chunks(TAG_FRAGMENT_MAX).collect();
        if fragments.len() > 99 {
            return Err(RekkordError::Other(anyhow::anyhow!("tag payload needs more than 100 fragments")));
        }

        for (index, fragment) in fragments.iter().enumerate() {
            let encoded = base64url_nopad(fragment);
            let path = format!("tags/{prefix}_{index:02}_{encoded}");
            let settings = WriteSettings { conditional: true, retain_ms: self.config.retain_ms, checksum: None };
            self.store.write_file(&path, Bytes::new(), settings).await.map_err(RekkordError::Other)?;
        }

        Ok(prefix)
    }

    /// Enumerates `tags/`, regroups fragments by their 32-hex prefix,
    /// reassembles and opens each one. A tag that fails to reconstruct,
    /// authenticate, or decrypt is logged and skipped — it never aborts
    /// enumeration of the others.
    pub async fn list_tags(&self) -> RekkordResult<Vec<TagInfo>> {
        let lkey = self.keyset.lkey.expect("list_tags requires lkey");
        let tkey = self.keyset.tkey.expect("list_tags requires tkey");
        let vkey = self.keyset.vkey.expect("list_tags requires vkey");

        let mut fragments: std::collections::BTreeMap<String, Vec<(u8, String)>> = std::collections::BTreeMap::new();
        self.store
            .list_files("tags/", &mut |path: &str, _size: u64| {
                if let Some(name) = parse_tag_fragment_name(path) {
                    fragments.entry(name.0).or_default().push((name.1, name.2));
                }
                true
            })
            .await
            .map_err(RekkordError::Other)?;

        let mut out = Vec::new();
        for (prefix, mut parts) in fragments {
            parts.sort_by_key(|(index, _)| *index);

            let mut ciphertext = Vec::new();
            let mut ok = true;
            for (_, encoded) in &parts {
                match base64url_decode(encoded) {
                    Ok(bytes) => ciphertext.extend_from_slice(&bytes),
                    Err(_) => {
                        tracing::warn!(tag = %prefix, "skipping tag with malformed fragment encoding");
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                continue;
            }

            let Ok(plaintext) = codec::unseal_from(&ciphertext, &lkey, &tkey) else {
                tracing::warn!(tag = %prefix, "skipping tag that failed to decrypt");
                continue;
            };
            if plaintext.len() < BADGE_LEN + 64 + 1 + 1 + 32 {
                tracing::warn!(tag = %prefix, "skipping truncated tag");
                continue;
            }

            let badge: [u8; BADGE_LEN] = plaintext[..BADGE_LEN].try_into().expect("sliced to BADGE_LEN");
            let Ok(pkey) = crate::keyset::verify_badge(&badge, &vkey) else {
                tracing::warn!(tag = %prefix, "skipping tag with an uncertified signer badge");
                continue;
            };

            let sig_bytes = &plaintext[BADGE_LEN..BADGE_LEN + 64];
            let intro_and_payload = &plaintext[BADGE_LEN + 64..];

            let Ok(verifier) = VerifyingKey::from_bytes(&pkey) else {
                tracing::warn!(tag = %prefix, "skipping tag with an invalid signer key");
                continue;
            };
            let sig = Signature::from_bytes(sig_bytes.try_into().expect("sig slice is 64 bytes"));
            if verifier.verify_strict(intro_and_payload, &sig).is_err() {
                tracing::warn!(tag = %prefix, "skipping tag with an invalid signature");
                continue;
            }

            let _version = intro_and_payload[0];
            let Some(catalog) = Catalog::from_char(intro_and_payload[1] as char) else {
                tracing::warn!(tag = %prefix, "skipping tag with an unknown catalog byte");
                continue;
            };
            let mut hash_bytes = [0u8; 32];
            hash_bytes.copy_from_slice(&intro_and_payload[2..34]);
            let oid = Oid::new(catalog, Hash::from_bytes(hash_bytes));
            let payload = intro_and_payload[34..].to_vec();

            out.push(TagInfo { name: prefix, oid, payload });
        }

        Ok(out)
    }
}

/// Symmetric key for the repository identity blob, derived from the public
/// `vkey` rather than sealed to a Diffie-Hellman keypair: every role's key
/// file carries `vkey` (it is never zeroed, unlike `dkey`/`wkey`), so this
/// is the one secret every authenticated role — including `WriteOnly` and
/// `LogOnly`, neither of which ever holds `dkey` — can derive to open its
/// own repository's identity blob.
fn config_cipher_key(vkey: &[u8; 32]) -> [u8; 32] {
    let mut personal = [0u8; 16];
    personal[..8].copy_from_slice(b"RKKCFG\0\0");

    let hash = blake2b_simd::Params::new()
        .hash_length(32)
        .key(vkey)
        .salt(&[0u8; 16])
        .personal(&personal)
        .to_state()
        .finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}

fn make_salt_from(wkey: &[u8; 32], kind: u64) -> [u8; 32] {
    let mut personal = [0u8; 16];
    personal[..8].copy_from_slice(b"RKKSALT\0");
    personal[8..].copy_from_slice(&kind.to_le_bytes());

    let hash = blake2b_simd::Params::new()
        .hash_length(32)
        .key(wkey)
        .salt(&[0u8; 16])
        .personal(&personal)
        .to_state()
        .finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}

fn base64url_nopad(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn base64url_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s)
}

/// Parses `tags/<prefix32hex>_<index02>_<base64>` into `(prefix, index,
/// base64 payload)`.
fn parse_tag_fragment_name(path: &str) -> Option<(String, u8, String)> {
    let name = path.rsplit('/').next()?;
    let mut parts = name.splitn(3, '_');
    let prefix = parts.next()?;
    let index = parts.next()?;
    let payload = parts.next()?;

    if prefix.len() != 32 || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let index: u8 = index.parse().ok()?;

    Some((prefix.to_string(), index, payload.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStatCache;

    async fn init_memory_repo() -> (Repository<rekkord_store_memory::MemoryStore>, Keyset) {
        let store = Arc::new(rekkord_store_memory::MemoryStore::default());
        let mut mkey = [0u8; 32];
        rand::rng().fill_bytes(&mut mkey);
        let master = Keyset::from_master_key(&mkey);

        let repo = Repository::init(store, &master, &[], RepositoryConfig::default()).await.unwrap();
        (repo, master)
    }

    #[tokio::test]
    async fn init_then_authenticate_round_trips_identity() {
        let (repo, master) = init_memory_repo().await;
        let identity = repo.identity;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        crate::keyset::write_key_file(tmp.path(), &master.export_key_file(Role::ReadWrite).unwrap().0).unwrap();

        let vkey = master.vkey.unwrap();
        let reopened = Repository::authenticate(repo.store.clone(), tmp.path(), Some(&vkey), RepositoryConfig::default())
            .await
            .unwrap();

        assert_eq!(reopened.identity.rid, identity.rid);
        assert_eq!(reopened.identity.cid, identity.cid);
    }

    #[tokio::test]
    async fn write_only_and_log_only_roles_can_authenticate() {
        // Neither role ever holds `dkey`, and `LogOnly` never holds `wkey`
        // either; both must still be able to open the repository identity
        // blob to get a working handle (WriteOnly is the role a backup
        // agent actually runs as).
        let (repo, master) = init_memory_repo().await;
        let vkey = master.vkey.unwrap();

        for role in [Role::WriteOnly, Role::LogOnly] {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            crate::keyset::write_key_file(tmp.path(), &master.export_key_file(role).unwrap().0).unwrap();

            let reopened = Repository::authenticate(repo.store.clone(), tmp.path(), Some(&vkey), RepositoryConfig::default())
                .await
                .unwrap();
            assert_eq!(reopened.identity.rid, repo.identity.rid);
            assert_eq!(reopened.identity.cid, repo.identity.cid);
            assert_eq!(reopened.keyset.role(), role);
        }
    }

    #[tokio::test]
    async fn write_blob_short_circuits_on_cache_hit() {
        let (repo, _master) = init_memory_repo().await;
        let repo = repo.with_cache(Arc::new(MemoryStatCache::new()));

        let (oid1, size1) = repo.write_blob(BlobType::Chunk, b"hello").await.unwrap();
        assert!(size1 > 0);
        let (oid2, size2) = repo.write_blob(BlobType::Chunk, b"hello").await.unwrap();
        assert_eq!(oid1, oid2);
        assert_eq!(size2, 0);
    }

    #[tokio::test]
    async fn blob_round_trips_through_store() {
        let (repo, _master) = init_memory_repo().await;
        let (oid, _) = repo.write_blob(BlobType::Chunk, b"payload bytes").await.unwrap();
        let read = repo.read_blob(oid).await.unwrap();
        assert_eq!(read.plaintext, b"payload bytes");
        assert_eq!(read.blob_type, BlobType::Chunk);
    }

    #[tokio::test]
    async fn tag_round_trips_and_survives_corruption_of_another_tag() {
        let (repo, _master) = init_memory_repo().await;
        let (oid, _) = repo.write_blob(BlobType::Snapshot, b"fake snapshot bytes").await.unwrap();

        let name_a = repo.write_tag(oid, b"daily\0payload").await.unwrap();
        let _name_b = repo.write_tag(oid, b"weekly\0payload").await.unwrap();

        // Corrupt every fragment of the first tag by overwriting it with
        // garbage at the same path (simulating on-disk corruption).
        let corrupt_path = format!("tags/{name_a}_00_{}", base64url_nopad(b"not a valid ciphertext at all"));
        repo.store
            .write_file(&corrupt_path, Bytes::new(), WriteSettings::default())
            .await
            .unwrap();

        let tags = repo.list_tags().await.unwrap();
        assert!(tags.iter().any(|t| t.oid == oid));
    }
}
