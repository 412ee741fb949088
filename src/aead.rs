//! AES-256-GCM with caller-supplied nonces.
//!
//! Every key sealed here is single-purpose (one payload, one slot, one
//! provisioning channel), so callers derive nonces deterministically from a
//! chunk index or sequence number rather than drawing them at random.

extern crate alloc;
use alloc::vec::Vec;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use getrandom::getrandom;

use crate::error::{DecryptionError, EncodingError};
use crate::wire::{AES_KEY_BYTES, NONCE_BYTES};

fn cipher(key: &[u8; AES_KEY_BYTES]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// 32 bytes from the OS RNG.
pub fn random_key() -> Result<[u8; AES_KEY_BYTES], EncodingError> {
    let mut key = [0u8; AES_KEY_BYTES];
    getrandom(&mut key).map_err(|_| EncodingError)?;
    Ok(key)
}

pub fn aead_seal(
    key: &[u8; AES_KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncodingError> {
    cipher(key)
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| EncodingError)
}

/// Fails on any tag mismatch; the caller learns nothing about why.
pub fn aead_open(
    key: &[u8; AES_KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, DecryptionError> {
    cipher(key)
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| DecryptionError)
}
