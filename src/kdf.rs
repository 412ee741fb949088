//! KDF (v1)
//!
//! slot key  = HKDF-SHA256(kem_ss, info = PROTOCOL_ID || "|slot|" || ct_hash)
//! mac key   = HKDF-SHA256(x25519_dh, info = PROTOCOL_ID || "|mac|" || header_hash || slot_index)
//! chunk auth digest = SHA-256(header_hash || index || final || chunk_ct)

extern crate alloc;
use alloc::vec::Vec;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sha3::{Digest, Sha3_256};

use crate::error::{DecryptionError, EncodingError};
use crate::wire::{AUTHENTICATOR_BYTES, HASH_BYTES, PROTOCOL_ID};

type HmacSha256 = Hmac<Sha256>;

pub fn ct_hash(kem_ct: &[u8]) -> [u8; 32] {
    let h = Sha3_256::digest(kem_ct);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h);
    out
}

pub fn header_hash(header: &[u8]) -> [u8; HASH_BYTES] {
    let h = Sha256::digest(header);
    let mut out = [0u8; HASH_BYTES];
    out.copy_from_slice(&h);
    out
}

fn expand(ikm: &[u8], label: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], EncodingError> {
    let mut info = Vec::with_capacity(PROTOCOL_ID.len() + label.len() + 64);
    info.extend_from_slice(PROTOCOL_ID);
    info.extend_from_slice(label);
    for p in parts {
        info.extend_from_slice(p);
    }

    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut out = [0u8; 32];
    hk.expand(&info, &mut out).map_err(|_| EncodingError)?;
    Ok(out)
}

/// Key wrapping the payload key inside one recipient slot.
pub fn slot_key(shared_secret: &[u8], ct_hash: &[u8; 32]) -> Result<[u8; 32], EncodingError> {
    expand(shared_secret, b"|slot|", &[ct_hash])
}

/// Per-slot sender authentication key.
pub fn mac_key(dh: &[u8; 32], header_hash: &[u8; HASH_BYTES], slot_index: u32) -> Result<[u8; 32], EncodingError> {
    expand(dh, b"|mac|", &[header_hash, &slot_index.to_be_bytes()])
}

pub fn chunk_digest(header_hash: &[u8; HASH_BYTES], index: u64, is_final: bool, ciphertext: &[u8]) -> [u8; HASH_BYTES] {
    let mut h = Sha256::new();
    h.update(header_hash);
    h.update(index.to_be_bytes());
    h.update([is_final as u8]);
    h.update(ciphertext);
    let mut out = [0u8; HASH_BYTES];
    out.copy_from_slice(&h.finalize());
    out
}

pub fn authenticate(mac_key: &[u8; 32], digest: &[u8; HASH_BYTES]) -> Result<[u8; AUTHENTICATOR_BYTES], EncodingError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| EncodingError)?;
    mac.update(digest);
    let mut out = [0u8; AUTHENTICATOR_BYTES];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time check of one chunk authenticator.
pub fn verify_authenticator(mac_key: &[u8; 32], digest: &[u8; HASH_BYTES], tag: &[u8]) -> Result<(), DecryptionError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| DecryptionError)?;
    mac.update(digest);
    mac.verify_slice(tag).map_err(|_| DecryptionError)
}
