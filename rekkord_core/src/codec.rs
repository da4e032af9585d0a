//! The blob codec: authenticated encryption, LZ4 compression, and
//! size-hiding padding.
//!
//! No off-the-shelf crate implements libsodium's
//! `crypto_secretstream_xchacha20poly1305` construction, so it is
//! hand-rolled here on top of `chacha20poly1305`'s `XChaCha20Poly1305`
//! (already a direct dependency): a 24-byte random stream header seeds a
//! counter-nonce, and each segment's plaintext carries one trailing tag
//! byte (`0x00` = message, `0x01` = final) that is authenticated as part of
//! the segment and stripped after decryption. A reader keeps pulling
//! segments until it sees the final tag; anything after that is padding.

use chacha20poly1305::{
    AeadCore, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, OsRng},
};
use zeroize::Zeroize;

use crate::error::{RekkordError, RekkordResult};
use crate::oid::Oid;
use crate::wire::{BLOB_SPLIT, BLOB_VERSION, SEGMENT_OVERHEAD, BlobType, hash_blob};

const EKEY_LEN: usize = 80;
const STREAM_HEADER_LEN: usize = 24;
const INTRO_LEN: usize = 2 + EKEY_LEN + STREAM_HEADER_LEN;
const SEALED_KEY_LEN: usize = EKEY_LEN; // crypto_box_seal(32-byte key) = 32 (key) + 16 (mac) + 32 (ephemeral pk) = 80

const TAG_MESSAGE: u8 = 0;
const TAG_FINAL: u8 = 1;

/// A freshly decrypted and decompressed blob.
pub struct DecodedBlob {
    pub blob_type: BlobType,
    pub plaintext: Vec<u8>,
}

/// Encrypts, compresses and pads `plaintext` for `blob_type`, producing the
/// full on-wire blob (intro + ciphertext segments) and the [`Oid`] it will
/// be stored under.
///
/// `wkey` is the repository's data sealed-box public key; `salt` is the
/// per-repository hash salt for this blob's catalog (see
/// [`crate::repository::Repository::make_salt`]).
pub fn encode_blob(
    blob_type: BlobType,
    plaintext: &[u8],
    wkey: &[u8; 32],
    hash_salt: &[u8; 32],
    compression_level: i32,
) -> RekkordResult<(Vec<u8>, Oid)> {
    let hash = hash_blob(blob_type as i8, plaintext, hash_salt);
    let catalog = crate::oid::Catalog::from_char(if blob_type.is_directory_like() || blob_type.is_snapshot_like() {
        'M'
    } else {
        'R'
    })
    .expect("both catalog chars are valid");
    let oid = Oid::new(catalog, hash);

    let mut key = XChaCha20Poly1305::generate_key(&mut OsRng);
    let cipher = XChaCha20Poly1305::new(&key);

    let mut stream_header = [0u8; STREAM_HEADER_LEN];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut stream_header);

    let sealed_key = seal_to(key.as_slice(), wkey);

    let mut out = Vec::with_capacity(INTRO_LEN + plaintext.len() + 64);
    out.push(BLOB_VERSION);
    out.push(blob_type as i8 as u8);
    let mut ekey_field = [0u8; EKEY_LEN];
    ekey_field[..SEALED_KEY_LEN].copy_from_slice(&sealed_key);
    out.extend_from_slice(&ekey_field);
    out.extend_from_slice(&stream_header);

    let compressed = lz4_flex::compress_prepend_size(plaintext);
    let _ = compression_level; // lz4_flex's block API has no tunable level knob to forward.

    let padded_len = padme_padded_len(compressed.len() as u64) as usize;
    let padding_len = padded_len - compressed.len();

    let mut counter: u32 = 0;
    let mut offset = 0usize;
    while offset < compressed.len() {
        let end = (offset + BLOB_SPLIT).min(compressed.len());
        let is_last_real = end == compressed.len();
        let tag = if is_last_real && padding_len == 0 { TAG_FINAL } else { TAG_MESSAGE };
        let segment = encrypt_segment(&cipher, &stream_header, counter, &compressed[offset..end], tag);
        out.extend_from_slice(&segment);
        counter += 1;
        offset = end;
    }

    let mut remaining_padding = padding_len;
    while remaining_padding > 0 {
        let chunk_len = remaining_padding.min(BLOB_SPLIT);
        remaining_padding -= chunk_len;
        let tag = if remaining_padding == 0 { TAG_FINAL } else { TAG_MESSAGE };
        let zeros = vec![0u8; chunk_len];
        let segment = encrypt_segment(&cipher, &stream_header, counter, &zeros, tag);
        out.extend_from_slice(&segment);
        counter += 1;
    }

    key.zeroize();

    Ok((out, oid))
}

/// Reverses [`encode_blob`]: unseals the per-blob key with `dkey`, pulls
/// segments until `TAG_FINAL`, decompresses, and returns the plaintext.
/// Padding segments that follow `TAG_FINAL` are never consumed.
pub fn decode_blob(oid: &Oid, raw: &[u8], dkey: &[u8; 32], wkey: &[u8; 32]) -> RekkordResult<DecodedBlob> {
    if raw.len() < INTRO_LEN {
        return Err(RekkordError::MalformedBlob {
            oid: *oid,
            reason: "blob shorter than intro".into(),
        });
    }

    let version = raw[0];
    if version != BLOB_VERSION {
        return Err(RekkordError::UnexpectedVersion {
            oid: *oid,
            found: version,
            expected: BLOB_VERSION,
        });
    }
    let blob_type = BlobType::from_i8(raw[1] as i8).ok_or_else(|| RekkordError::MalformedBlob {
        oid: *oid,
        reason: format!("unknown blob type code {}", raw[1]),
    })?;

    let ekey_field = &raw[2..2 + EKEY_LEN];
    let opened = unseal_from(ekey_field, dkey, wkey).map_err(|_| RekkordError::AuthenticationFailed { oid: *oid })?;
    if opened.len() != 32 {
        return Err(RekkordError::AuthenticationFailed { oid: *oid });
    }
    let mut key = chacha20poly1305::Key::default();
    key.copy_from_slice(&opened);
    let cipher = XChaCha20Poly1305::new((&key).into());

    let stream_header: [u8; STREAM_HEADER_LEN] =
        raw[2 + EKEY_LEN..INTRO_LEN].try_into().expect("sliced to STREAM_HEADER_LEN");

    let mut compressed = Vec::new();
    let mut counter: u32 = 0;
    let mut offset = INTRO_LEN;
    let mut saw_final = false;

    while offset < raw.len() {
        let end = (offset + BLOB_SPLIT + SEGMENT_OVERHEAD).min(raw.len());
        if end - offset < SEGMENT_OVERHEAD {
            break;
        }
        let segment = &raw[offset..end];
        let (plain, tag) = decrypt_segment(&cipher, &stream_header, counter, segment)
            .map_err(|_| RekkordError::AuthenticationFailed { oid: *oid })?;
        counter += 1;
        offset = end;

        if !saw_final {
            compressed.extend_from_slice(&plain);
        }
        if tag == TAG_FINAL {
            saw_final = true;
        }
    }

    key.zeroize();

    if !saw_final {
        return Err(RekkordError::Truncated { oid: *oid });
    }

    let plaintext = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| RekkordError::MalformedBlob {
        oid: *oid,
        reason: format!("lz4 decompression failed: {e}"),
    })?;

    Ok(DecodedBlob { blob_type, plaintext })
}

/// Anonymous sealed-box encryption to a Curve25519 public key. Shared by the
/// blob codec (sealing a per-blob symmetric key to `wkey`) and the
/// repository's config/tag encryption, which seal to `wkey`/`tkey` the
/// same way.
pub(crate) fn seal_to(plaintext: &[u8], recipient_key: &[u8; 32]) -> Vec<u8> {
    let recipient = crypto_box::PublicKey::from(*recipient_key);
    crypto_box::seal(&mut OsRng, &recipient, plaintext).expect("sealing cannot fail")
}

pub(crate) fn unseal_from(sealed: &[u8], secret_key: &[u8; 32], public_key: &[u8; 32]) -> RekkordResult<Vec<u8>> {
    let secret = crypto_box::SecretKey::from(*secret_key);
    let public = crypto_box::PublicKey::from(*public_key);
    crypto_box::seal_open(&secret, &public, sealed)
        .map_err(|_| RekkordError::Other(anyhow::anyhow!("sealed-box open failed")))
}

/// Derives the per-segment nonce by XORing a big-endian counter into the
/// last 4 bytes of the 24-byte stream header, mirroring
/// `crypto_secretstream`'s internal counter-nonce scheme closely enough to
/// keep every segment's nonce unique and deterministic from `(header,
/// counter)` alone.
fn segment_nonce(stream_header: &[u8; STREAM_HEADER_LEN], counter: u32) -> XNonce {
    let mut nonce = *stream_header;
    let counter_bytes = counter.to_be_bytes();
    for i in 0..4 {
        nonce[STREAM_HEADER_LEN - 4 + i] ^= counter_bytes[i];
    }
    XNonce::clone_from_slice(&nonce)
}

fn encrypt_segment(
    cipher: &XChaCha20Poly1305,
    stream_header: &[u8; STREAM_HEADER_LEN],
    counter: u32,
    plaintext: &[u8],
    tag: u8,
) -> Vec<u8> {
    let nonce = segment_nonce(stream_header, counter);
    let mut buf = Vec::with_capacity(plaintext.len() + 1);
    buf.extend_from_slice(plaintext);
    buf.push(tag);
    cipher.encrypt(&nonce, buf.as_slice()).expect("segment encryption cannot fail")
}

fn decrypt_segment(
    cipher: &XChaCha20Poly1305,
    stream_header: &[u8; STREAM_HEADER_LEN],
    counter: u32,
    segment: &[u8],
) -> RekkordResult<(Vec<u8>, u8)> {
    let nonce = segment_nonce(stream_header, counter);
    let mut plain = cipher
        .decrypt(&nonce, segment)
        .map_err(|_| RekkordError::Other(anyhow::anyhow!("segment authentication failed")))?;
    let tag = plain.pop().ok_or_else(|| RekkordError::Other(anyhow::anyhow!("empty segment")))?;
    Ok((plain, tag))
}

/// Padmé: for payload length `L > 0`, pads to a bucket of relative width
/// `1/2^S`, leaking only `O(log log L)` bits of the true size.
pub fn padme_padded_len(len: u64) -> u64 {
    if len == 0 {
        return 0;
    }
    let e = 63 - len.leading_zeros() as u64;
    let s = 63 - e.leading_zeros() as u64 + 1;
    let shift = e.saturating_sub(s);
    let mask = (1u64 << shift) - 1;
    (len + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let mut dkey = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut dkey);
        let wkey = *crypto_box::SecretKey::from(dkey).public_key().as_bytes();
        (dkey, wkey)
    }

    #[test]
    fn padme_never_shrinks() {
        for len in [1u64, 2, 31, 32, 33, 32 * 1024 - 1, 32 * 1024, 32 * 1024 + 1, 1024 * 1024] {
            assert!(padme_padded_len(len) >= len);
        }
    }

    #[test]
    fn padme_buckets_equal_sizes_equally() {
        // Two lengths close together in the same bucket must pad to the same length.
        let a = padme_padded_len(1_000_000);
        let b = padme_padded_len(1_000_001);
        assert_eq!(a, b);
    }

    #[test]
    fn round_trip_every_length() {
        let (dkey, wkey) = keypair();
        for len in [0usize, 1, 31, 32, 33, 32 * 1024 - 1, 32 * 1024, 32 * 1024 + 1, 1024 * 1024] {
            let plaintext = vec![0xAB; len];
            let salt = [7u8; 32];
            let (encoded, oid) = encode_blob(BlobType::Chunk, &plaintext, &wkey, &salt, 0).unwrap();
            assert!(encoded.len() >= plaintext.len());
            let decoded = decode_blob(&oid, &encoded, &dkey, &wkey).unwrap();
            assert_eq!(decoded.plaintext, plaintext);
            assert_eq!(decoded.blob_type, BlobType::Chunk);
        }
    }

    #[test]
    fn type_binding_changes_hash() {
        let (_dkey, wkey) = keypair();
        let salt = [3u8; 32];
        let plaintext = b"identical payload";
        let (_enc1, oid1) = encode_blob(BlobType::Chunk, plaintext, &wkey, &salt, 0).unwrap();
        let (_enc2, oid2) = encode_blob(BlobType::File, plaintext, &wkey, &salt, 0).unwrap();
        assert_ne!(oid1.hash, oid2.hash);
    }

    #[test]
    fn oid_is_stable_across_rehash() {
        let salt = [9u8; 32];
        let plaintext = b"stable";
        let direct = hash_blob(BlobType::File as i8, plaintext, &salt);
        let (_dkey, wkey) = keypair();
        let (_encoded, oid) = encode_blob(BlobType::File, plaintext, &wkey, &salt, 0).unwrap();
        assert_eq!(oid.hash, direct);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (dkey, wkey) = keypair();
        let salt = [1u8; 32];
        let (mut encoded, oid) = encode_blob(BlobType::Chunk, b"hello world", &wkey, &salt, 0).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let err = decode_blob(&oid, &encoded, &dkey, &wkey).unwrap_err();
        assert!(matches!(err, RekkordError::AuthenticationFailed { .. }));
    }
}
