//! Keyset derivation, role-based key narrowing, and the key file format.
//!
//! A master key derives a fixed tree of per-purpose subkeys via a keyed
//! BLAKE2b KDF (the same construction as libsodium's
//! `crypto_kdf_blake2b_derive_from_key`). Signing and Diffie-Hellman public
//! keys are then derived from those subkeys as seeds. Exported key files
//! carry only the subset of keys their role needs; decoding one re-derives
//! the public halves and zeroes anything the role doesn't grant, so a
//! `Keyset` never holds more authority in memory than its file claimed.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{RekkordError, RekkordResult};

pub const MASTER_KEY_LEN: usize = 32;

const DERIVATION_CONTEXT: &[u8; 8] = b"REKKORD0";
const MAX_KEYS: usize = 24;
const KEYS_LEN: usize = 32 * MAX_KEYS;
pub const BADGE_LEN: usize = 113;
const KEY_DATA_LEN: usize = 5 + BADGE_LEN + KEYS_LEN + 64;
const KEYFILE_PREFIX: &[u8; 5] = b"RKK01";

const PEM_BEGIN: &str = "-----BEGIN REKKORD KEY-----";
const PEM_END: &str = "-----END REKKORD KEY-----";
const PEM_LINE_LEN: usize = 70;
const PEM_LIMIT: usize = 16384;

/// Which of the ten key slots a field occupies inside `KeyData::keys`.
/// Fixed by the wire format; reordering these breaks every existing key file.
mod slot {
    pub const CKEY: usize = 0;
    pub const AKEY: usize = 1;
    pub const DKEY: usize = 2;
    pub const WKEY: usize = 3;
    pub const LKEY: usize = 4;
    pub const TKEY: usize = 5;
    pub const NKEY: usize = 6;
    pub const VKEY: usize = 7;
    pub const SKEY: usize = 8;
    pub const PKEY: usize = 9;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Subkey {
    ConfigKey = 0,
    DataKey = 1,
    LogKey = 2,
    NeutralKey = 3,
}

#[repr(i8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Master = 0,
    WriteOnly = 1,
    ReadWrite = 2,
    LogOnly = 3,
}

impl Role {
    fn from_i8(v: i8) -> Option<Self> {
        Some(match v {
            0 => Role::Master,
            1 => Role::WriteOnly,
            2 => Role::ReadWrite,
            3 => Role::LogOnly,
            _ => return None,
        })
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Config = 1 << 0,
    Read = 1 << 1,
    Write = 1 << 2,
    Log = 1 << 3,
}

/// A repository keyset: the ten derived keys, narrowed to whatever a given
/// [`Role`] is allowed to hold. Fields the role doesn't grant are `None`.
///
/// Zeroized on drop. Equality and `Debug` intentionally don't expose key
/// material; use [`Keyset::kid`] and [`Keyset::role`] for diagnostics.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Keyset {
    #[zeroize(skip)]
    kid: [u8; 16],
    #[zeroize(skip)]
    role: Role,
    #[zeroize(skip)]
    modes: u32,

    pub ckey: Option<[u8; 32]>,
    pub akey: Option<[u8; 32]>,
    pub dkey: Option<[u8; 32]>,
    pub wkey: Option<[u8; 32]>,
    pub lkey: Option<[u8; 32]>,
    pub tkey: Option<[u8; 32]>,
    pub nkey: Option<[u8; 32]>,
    pub vkey: Option<[u8; 32]>,
    pub skey: Option<[u8; 32]>,
    pub pkey: Option<[u8; 32]>,

    #[zeroize(skip)]
    badge: [u8; BADGE_LEN],
}

impl std::fmt::Debug for Keyset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyset")
            .field("kid", &data_encoding::HEXLOWER.encode(&self.kid))
            .field("role", &self.role)
            .field("modes", &self.modes)
            .finish_non_exhaustive()
    }
}

impl Keyset {
    pub fn kid(&self) -> &[u8; 16] {
        &self.kid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// This keyset's own Badge: `kid || role || pkey || sig(by nkey)`. Tags
    /// embed a writer's badge alongside their payload so any reader holding
    /// only `vkey` can certify the `pkey` that actually signed the tag,
    /// without needing to have seen that key file itself.
    pub fn badge(&self) -> &[u8; BADGE_LEN] {
        &self.badge
    }

    pub fn has_mode(&self, mode: AccessMode) -> bool {
        self.modes & mode as u32 != 0
    }

    /// Asserts that this keyset grants `mode`. A missing mode here is a
    /// caller bug, not a recoverable condition: it means a command path
    /// reached into a keyset it was never handed the right key file for.
    pub fn require_mode(&self, mode: AccessMode) {
        assert!(
            self.has_mode(mode),
            "keyset {:?} does not grant {mode:?}",
            self.role
        );
    }

    /// Derives the full key tree from a 32-byte master key. Every subkey is
    /// present; `modes` grants everything.
    pub fn from_master_key(master_key: &[u8; MASTER_KEY_LEN]) -> Self {
        let ckey = derive_subkey(master_key, Subkey::ConfigKey);
        let dkey = derive_subkey(master_key, Subkey::DataKey);
        let lkey = derive_subkey(master_key, Subkey::LogKey);
        let nkey = derive_subkey(master_key, Subkey::NeutralKey);

        let akey = signing_public_key(&ckey);
        let wkey = x25519_public_key(&dkey);
        let tkey = x25519_public_key(&lkey);
        let vkey = signing_public_key(&nkey);

        // The master keyset signs for itself: skey/pkey reuse nkey/vkey
        // verbatim (no export step to generate a fresh pair), so its badge
        // is self-certified the same way an exported key file's is.
        let signing = SigningKey::from_bytes(&nkey);
        let mut badge = [0u8; BADGE_LEN];
        badge[16] = Role::Master as i8 as u8;
        badge[17..49].copy_from_slice(&vkey);
        let badge_sig = signing.sign(&badge[..49]);
        badge[49..113].copy_from_slice(&badge_sig.to_bytes());

        Keyset {
            kid: [0u8; 16],
            role: Role::Master,
            modes: u32::MAX,
            ckey: Some(ckey),
            akey: Some(akey),
            dkey: Some(dkey),
            wkey: Some(wkey),
            lkey: Some(lkey),
            tkey: Some(tkey),
            nkey: Some(nkey),
            vkey: Some(vkey),
            skey: Some(nkey),
            pkey: Some(vkey),
            badge,
        }
    }

    /// Exports a narrowed key file for `role`, signed by this (master)
    /// keyset's neutral signing key. Returns the raw 950-byte key file body
    /// and the `Keyset` that decoding it would produce.
    pub fn export_key_file(&self, role: Role) -> RekkordResult<(Vec<u8>, Keyset)> {
        if self.role != Role::Master {
            return Err(RekkordError::Other(anyhow::anyhow!(
                "only a master keyset can export derived key files"
            )));
        }
        if role == Role::Master {
            return Err(RekkordError::Other(anyhow::anyhow!(
                "cannot export a master key file"
            )));
        }

        let akey = self.akey.expect("master keyset always carries akey");
        let dkey = self.dkey.expect("master keyset always carries dkey");
        let lkey = self.lkey.expect("master keyset always carries lkey");
        let wkey = self.wkey.expect("master keyset always carries wkey");
        let tkey = self.tkey.expect("master keyset always carries tkey");
        let vkey = self.vkey.expect("master keyset always carries vkey");
        let nkey = self.nkey.expect("master keyset always carries nkey");

        // Unused slots are filled with random bytes (never left zero) so a
        // key file's byte pattern alone never reveals which role it holds.
        let mut keys = [0u8; KEYS_LEN];
        rand::rng().fill_bytes(&mut keys);
        let put = |keys: &mut [u8; KEYS_LEN], index: usize, key: &[u8; 32]| {
            keys[index * 32..index * 32 + 32].copy_from_slice(key);
        };
        match role {
            Role::Master => unreachable!(),
            Role::WriteOnly => {
                put(&mut keys, slot::AKEY, &akey);
                put(&mut keys, slot::WKEY, &wkey);
                put(&mut keys, slot::TKEY, &tkey);
                put(&mut keys, slot::VKEY, &vkey);
            }
            Role::ReadWrite => {
                put(&mut keys, slot::AKEY, &akey);
                put(&mut keys, slot::DKEY, &dkey);
                put(&mut keys, slot::LKEY, &lkey);
                put(&mut keys, slot::VKEY, &vkey);
            }
            Role::LogOnly => {
                put(&mut keys, slot::AKEY, &akey);
                put(&mut keys, slot::LKEY, &lkey);
                put(&mut keys, slot::VKEY, &vkey);
            }
        }

        let mut rng = rand::rng();

        let mut skey = [0u8; 32];
        rng.fill_bytes(&mut skey);
        let pkey = signing_public_key(&skey);
        put(&mut keys, slot::SKEY, &skey);

        let mut kid = [0u8; 16];
        rng.fill_bytes(&mut kid);

        let signing = SigningKey::from_bytes(&nkey);

        let mut badge = [0u8; BADGE_LEN];
        badge[0..16].copy_from_slice(&kid);
        badge[16] = role as i8 as u8;
        badge[17..49].copy_from_slice(&pkey);
        let badge_sig = signing.sign(&badge[..49]);
        badge[49..113].copy_from_slice(&badge_sig.to_bytes());

        let mut data = Vec::with_capacity(KEY_DATA_LEN);
        data.extend_from_slice(KEYFILE_PREFIX);
        data.extend_from_slice(&badge);
        data.extend_from_slice(&keys);
        let full_sig = signing.sign(&data);
        data.extend_from_slice(&full_sig.to_bytes());
        debug_assert_eq!(data.len(), KEY_DATA_LEN);

        let decoded = decode_key_data(&data, &vkey)?;
        Ok((data, decoded))
    }
}

/// Keyed BLAKE2b derivation matching libsodium's
/// `crypto_kdf_blake2b_derive_from_key`: the 8-byte context is placed in the
/// low half of the 16-byte personalization field, the subkey id (as a
/// little-endian u64) in the high half, and the salt is left zero.
fn derive_subkey(master_key: &[u8; MASTER_KEY_LEN], subkey: Subkey) -> [u8; 32] {
    let mut personal = [0u8; 16];
    personal[..8].copy_from_slice(DERIVATION_CONTEXT);
    personal[8..].copy_from_slice(&(subkey as u64).to_le_bytes());

    let hash = blake2b_simd::Params::new()
        .hash_length(32)
        .key(master_key)
        .salt(&[0u8; 16])
        .personal(&personal)
        .to_state()
        .finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}

/// Derives an Ed25519 public key from a 32-byte seed, the way a signing
/// keypair's public half is derived from its secret seed everywhere in this
/// crate (`akey` from `ckey`, `vkey` from `nkey`, `pkey` from `skey`).
fn signing_public_key(seed: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(seed).verifying_key().to_bytes()
}

/// Derives a Curve25519 base-point public key from a scalar (`wkey` from
/// `dkey`, `tkey` from `lkey`): the X25519 half of a sealed-box keypair.
fn x25519_public_key(scalar: &[u8; 32]) -> [u8; 32] {
    let secret = crypto_box::SecretKey::from(*scalar);
    *secret.public_key().as_bytes()
}

/// Decodes and authenticates a raw (non-PEM) key file body, narrowing the
/// result to whatever access mode its badge's role grants.
pub fn decode_key_data(data: &[u8], vkey: &[u8; 32]) -> RekkordResult<Keyset> {
    if data.len() != KEY_DATA_LEN {
        return Err(RekkordError::Other(anyhow::anyhow!(
            "malformed key file: unexpected length {}",
            data.len()
        )));
    }
    if &data[0..5] != KEYFILE_PREFIX {
        return Err(RekkordError::Other(anyhow::anyhow!(
            "invalid key file prefix"
        )));
    }

    let verifier = VerifyingKey::from_bytes(vkey)
        .map_err(|_| RekkordError::Other(anyhow::anyhow!("invalid verify key")))?;

    let badge = &data[5..5 + BADGE_LEN];
    let badge_sig = Signature::from_bytes(
        badge[49..113]
            .try_into()
            .expect("badge signature slice is 64 bytes"),
    );
    verifier
        .verify_strict(&badge[..49], &badge_sig)
        .map_err(|_| RekkordError::KeyfileInvalid)?;

    let full_sig = Signature::from_bytes(
        data[5 + BADGE_LEN + KEYS_LEN..]
            .try_into()
            .expect("key file signature slice is 64 bytes"),
    );
    verifier
        .verify_strict(&data[..5 + BADGE_LEN + KEYS_LEN], &full_sig)
        .map_err(|_| RekkordError::KeyfileInvalid)?;

    let role_byte = badge[16] as i8;
    let role = Role::from_i8(role_byte)
        .filter(|role| *role != Role::Master)
        .ok_or_else(|| RekkordError::Other(anyhow::anyhow!("invalid key type {role_byte}")))?;

    let mut kid = [0u8; 16];
    kid.copy_from_slice(&badge[0..16]);

    let keys_region = &data[5 + BADGE_LEN..5 + BADGE_LEN + KEYS_LEN];
    let slot_at = |index: usize| -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&keys_region[index * 32..index * 32 + 32]);
        out
    };

    let mut ckey = Some(slot_at(slot::CKEY));
    let akey = Some(slot_at(slot::AKEY));
    let mut dkey = Some(slot_at(slot::DKEY));
    let mut wkey = Some(slot_at(slot::WKEY));
    let mut lkey = Some(slot_at(slot::LKEY));
    let mut tkey = Some(slot_at(slot::TKEY));
    let vkey_field = Some(slot_at(slot::VKEY));
    let skey = Some(slot_at(slot::SKEY));

    let modes = match role {
        Role::Master => unreachable!("filtered out above"),
        Role::WriteOnly => {
            ckey = None;
            dkey = None;
            lkey = None;
            AccessMode::Write as u32
        }
        Role::ReadWrite => {
            ckey = None;
            wkey = Some(x25519_public_key(&dkey.expect("ReadWrite key file carries dkey")));
            tkey = Some(x25519_public_key(&lkey.expect("ReadWrite key file carries lkey")));
            AccessMode::Read as u32 | AccessMode::Write as u32 | AccessMode::Log as u32
        }
        Role::LogOnly => {
            ckey = None;
            dkey = None;
            wkey = None;
            tkey = Some(x25519_public_key(&lkey.expect("LogOnly key file carries lkey")));
            AccessMode::Log as u32
        }
    };

    let pkey = Some(signing_public_key(
        &skey.expect("every key file carries skey"),
    ));

    let mut badge_arr = [0u8; BADGE_LEN];
    badge_arr.copy_from_slice(badge);

    Ok(Keyset {
        kid,
        role,
        modes,
        ckey,
        akey,
        dkey,
        wkey,
        lkey,
        tkey,
        nkey: None,
        vkey: vkey_field,
        skey,
        pkey,
        badge: badge_arr,
    })
}

/// Verifies a standalone Badge (as embedded in a tag) against `vkey`,
/// returning the `pkey` it certifies. The same 49-byte-prefix/64-byte-suffix
/// signature scheme used inside `KeyData`.
pub fn verify_badge(badge: &[u8; BADGE_LEN], vkey: &[u8; 32]) -> RekkordResult<[u8; 32]> {
    let verifier = VerifyingKey::from_bytes(vkey).map_err(|_| RekkordError::Other(anyhow::anyhow!("invalid verify key")))?;
    let sig = Signature::from_bytes(badge[49..113].try_into().expect("badge signature slice is 64 bytes"));
    verifier.verify_strict(&badge[..49], &sig).map_err(|_| RekkordError::KeyfileInvalid)?;

    let mut pkey = [0u8; 32];
    pkey.copy_from_slice(&badge[17..49]);
    Ok(pkey)
}

fn encode_pem(raw: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw);

    let mut out = String::with_capacity(encoded.len() + encoded.len() / PEM_LINE_LEN + 32);
    out.push_str(PEM_BEGIN);
    out.push('\n');
    for chunk in encoded.as_bytes().chunks(PEM_LINE_LEN) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ASCII"));
        out.push('\n');
    }
    out.push_str(PEM_END);
    out.push('\n');
    out
}

fn decode_pem(pem: &str) -> RekkordResult<Vec<u8>> {
    let after_begin = pem
        .find(PEM_BEGIN)
        .map(|i| &pem[i + PEM_BEGIN.len()..])
        .ok_or_else(|| RekkordError::Other(anyhow::anyhow!("cannot find a rekkord key in this file")))?;
    let body = after_begin
        .find(PEM_END)
        .map(|i| after_begin[..i].trim())
        .ok_or_else(|| RekkordError::Other(anyhow::anyhow!("cannot find a rekkord key in this file")))?;

    if body.len() > PEM_LIMIT {
        return Err(RekkordError::Other(anyhow::anyhow!(
            "excessive base64 key size"
        )));
    }

    let stripped: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(stripped)
        .map_err(|_| RekkordError::Other(anyhow::anyhow!("failed to decode base64 key")))
}

/// Writes a raw key file body to `path` as PEM, restricting its permissions
/// to owner read/write on Unix.
pub fn write_key_file(path: &std::path::Path, raw: &[u8]) -> RekkordResult<()> {
    std::fs::write(path, encode_pem(raw))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn read_key_file_raw(path: &std::path::Path) -> RekkordResult<Vec<u8>> {
    let text = std::fs::read_to_string(path)?;
    decode_pem(&text)
}

/// Loads a keyset from a key file: either a bare 32-byte master key, or a
/// signed, role-narrowed key file (which requires the repository's neutral
/// verify key to authenticate).
pub fn load_keyset(path: &std::path::Path, vkey: Option<&[u8; 32]>) -> RekkordResult<Keyset> {
    let raw = read_key_file_raw(path)?;

    match raw.len() {
        MASTER_KEY_LEN => {
            let mut master = [0u8; MASTER_KEY_LEN];
            master.copy_from_slice(&raw);
            Ok(Keyset::from_master_key(&master))
        }
        KEY_DATA_LEN => {
            let vkey = vkey.ok_or_else(|| {
                RekkordError::Other(anyhow::anyhow!(
                    "a verify key is required to decode a derived key file"
                ))
            })?;
            decode_key_data(&raw, vkey)
        }
        other => Err(RekkordError::Other(anyhow::anyhow!(
            "malformed key file: unexpected size {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> Keyset {
        let mut mkey = [0u8; MASTER_KEY_LEN];
        rand::rng().fill_bytes(&mut mkey);
        Keyset::from_master_key(&mkey)
    }

    #[test]
    fn master_keyset_grants_every_mode() {
        let keys = master();
        assert!(keys.has_mode(AccessMode::Config));
        assert!(keys.has_mode(AccessMode::Read));
        assert!(keys.has_mode(AccessMode::Write));
        assert!(keys.has_mode(AccessMode::Log));
        assert!(keys.ckey.is_some());
        assert!(keys.nkey.is_some());
    }

    #[test]
    fn write_only_export_hides_config_and_read_keys() {
        let master = master();
        let (_, decoded) = master.export_key_file(Role::WriteOnly).unwrap();

        assert_eq!(decoded.role(), Role::WriteOnly);
        assert!(decoded.has_mode(AccessMode::Write));
        assert!(!decoded.has_mode(AccessMode::Read));
        assert!(decoded.ckey.is_none());
        assert!(decoded.dkey.is_none());
        assert!(decoded.wkey.is_some());
        assert_eq!(decoded.wkey, master.wkey);
    }

    #[test]
    fn read_write_export_recomputes_wkey_and_tkey() {
        let master = master();
        let (_, decoded) = master.export_key_file(Role::ReadWrite).unwrap();

        assert_eq!(decoded.role(), Role::ReadWrite);
        assert!(decoded.has_mode(AccessMode::Read));
        assert!(decoded.has_mode(AccessMode::Write));
        assert!(decoded.has_mode(AccessMode::Log));
        assert!(decoded.ckey.is_none());
        assert_eq!(decoded.wkey, master.wkey);
        assert_eq!(decoded.tkey, master.tkey);
    }

    #[test]
    fn log_only_export_keeps_only_log_key() {
        let master = master();
        let (_, decoded) = master.export_key_file(Role::LogOnly).unwrap();

        assert_eq!(decoded.role(), Role::LogOnly);
        assert!(decoded.has_mode(AccessMode::Log));
        assert!(!decoded.has_mode(AccessMode::Write));
        assert!(decoded.dkey.is_none());
        assert!(decoded.wkey.is_none());
        assert_eq!(decoded.tkey, master.tkey);
    }

    #[test]
    fn pem_round_trips_raw_bytes() {
        let master = master();
        let (raw, _) = master.export_key_file(Role::LogOnly).unwrap();

        let pem = encode_pem(&raw);
        assert!(pem.starts_with(PEM_BEGIN));
        let decoded = decode_pem(&pem).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn tampered_key_file_fails_authentication() {
        let master = master();
        let (mut raw, _) = master.export_key_file(Role::ReadWrite).unwrap();
        raw[200] ^= 0xff;

        let vkey = master.vkey.unwrap();
        let err = decode_key_data(&raw, &vkey).unwrap_err();
        assert!(matches!(err, RekkordError::KeyfileInvalid));
    }

    #[test]
    fn only_master_can_export() {
        let master = master();
        let (_, derived) = master.export_key_file(Role::WriteOnly).unwrap();
        assert!(derived.export_key_file(Role::ReadWrite).is_err());
    }
}
