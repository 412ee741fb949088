//! Device keys: X25519 paired with ML-KEM-768.
//!
//! Every device holds one hybrid keypair. Recipient slots encapsulate to both
//! halves and concatenate the two secrets, so a slot stays sealed while either
//! primitive holds. The X25519 half doubles as the sender-authentication key.
//!
//! ```text
//! PublicKey      x25519_pk[32]  || mlkem_ek[1184]   1216
//! SecretKey      x25519_sk[32]  || mlkem_dk[2400]   2432
//! ciphertext     x25519_epk[32] || mlkem_ct[1088]   1120
//! shared secret  x25519_dh[32]  || mlkem_ss[32]       64
//! kid            SHA3-256("sigil-kid-v1" || PublicKey)
//! ```

extern crate alloc;
use alloc::vec::Vec;

use core::fmt;

use ml_kem::{
    kem::{Decapsulate, Encapsulate},
    Ciphertext, EncodedSizeUser, KemCore, MlKem768, MlKem768Params,
};
use rand_core::OsRng;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{DecryptionError, EncodingError};
use crate::wire::{
    KEM_CIPHERTEXT_BYTES, KEM_PUBLIC_KEY_BYTES, KEM_SECRET_KEY_BYTES, KID_BYTES, MLKEM_PUBLIC_KEY_BYTES,
    MLKEM_SECRET_KEY_BYTES, SHARED_SECRET_BYTES, X25519_KEY_BYTES,
};

type EncapKey = ml_kem::kem::EncapsulationKey<MlKem768Params>;
type DecapKey = ml_kem::kem::DecapsulationKey<MlKem768Params>;

/// Both halves of a slot's shared secret.
pub type SharedSecret = Zeroizing<[u8; 2 * SHARED_SECRET_BYTES]>;

/// Split `bytes` into a 32-byte X25519 half and a fixed-size ML-KEM half.
fn split_halves<const N: usize>(bytes: &[u8]) -> Result<([u8; X25519_KEY_BYTES], [u8; N]), DecryptionError> {
    if bytes.len() != X25519_KEY_BYTES + N {
        return Err(DecryptionError);
    }
    let (x, m) = bytes.split_at(X25519_KEY_BYTES);
    Ok((
        x.try_into().map_err(|_| DecryptionError)?,
        m.try_into().map_err(|_| DecryptionError)?,
    ))
}

fn combine(x25519: &[u8; 32], mlkem: &[u8]) -> SharedSecret {
    let mut ss = Zeroizing::new([0u8; 2 * SHARED_SECRET_BYTES]);
    ss[..SHARED_SECRET_BYTES].copy_from_slice(x25519);
    ss[SHARED_SECRET_BYTES..].copy_from_slice(mlkem);
    ss
}

// ---------------------------------------------------------------------------
// Key identifier
// ---------------------------------------------------------------------------

const KID_DOMAIN: &[u8] = b"sigil-kid-v1";

/// Stable identifier of a hybrid public key, written into recipient slots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kid([u8; KID_BYTES]);

impl Kid {
    pub fn of(pk: &PublicKey) -> Self {
        let mut h = Sha3_256::new();
        h.update(KID_DOMAIN);
        h.update(pk.to_bytes());
        let mut out = [0u8; KID_BYTES];
        out.copy_from_slice(&h.finalize());
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; KID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecryptionError> {
        let arr: [u8; KID_BYTES] = bytes.try_into().map_err(|_| DecryptionError)?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, DecryptionError> {
        let raw = hex::decode(s).map_err(|_| DecryptionError)?;
        Self::from_slice(&raw)
    }

    pub fn as_bytes(&self) -> &[u8; KID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time comparison, used while matching slots to local keys.
    pub fn ct_eq(&self, other: &Kid) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A device's public encryption key.
#[derive(Clone)]
pub struct PublicKey {
    x25519: X25519PublicKey,
    mlkem: EncapKey,
}

impl PublicKey {
    pub fn to_bytes(&self) -> [u8; KEM_PUBLIC_KEY_BYTES] {
        let mut out = [0u8; KEM_PUBLIC_KEY_BYTES];
        let (x, m) = out.split_at_mut(X25519_KEY_BYTES);
        x.copy_from_slice(self.x25519.as_bytes());
        m.copy_from_slice(self.mlkem.as_bytes().as_slice());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecryptionError> {
        let (x, m) = split_halves::<MLKEM_PUBLIC_KEY_BYTES>(bytes)?;
        Ok(Self {
            x25519: X25519PublicKey::from(x),
            mlkem: EncapKey::from_bytes(&m.into()),
        })
    }

    pub fn kid(&self) -> Kid {
        Kid::of(self)
    }

    pub(crate) fn x25519(&self) -> &X25519PublicKey {
        &self.x25519
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes()[..] == other.to_bytes()[..]
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.kid()).finish()
    }
}

/// A device's private key. Never leaves the device except through
/// `to_bytes` for local storage.
pub struct SecretKey {
    x25519: StaticSecret,
    mlkem: DecapKey,
}

impl SecretKey {
    pub fn to_bytes(&self) -> [u8; KEM_SECRET_KEY_BYTES] {
        let mut out = [0u8; KEM_SECRET_KEY_BYTES];
        let (x, m) = out.split_at_mut(X25519_KEY_BYTES);
        x.copy_from_slice(&self.x25519.to_bytes());
        m.copy_from_slice(self.mlkem.as_bytes().as_slice());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecryptionError> {
        let (x, m) = split_halves::<MLKEM_SECRET_KEY_BYTES>(bytes)?;
        let x = Zeroizing::new(x);
        let m = Zeroizing::new(m);
        Ok(Self {
            x25519: StaticSecret::from(*x),
            mlkem: DecapKey::from_bytes(&(*m).into()),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            x25519: X25519PublicKey::from(&self.x25519),
            mlkem: self.mlkem.encapsulation_key().clone(),
        }
    }

    pub(crate) fn x25519(&self) -> &StaticSecret {
        &self.x25519
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&self.public_key().kid()).finish()
    }
}

// ---------------------------------------------------------------------------
// KEM
// ---------------------------------------------------------------------------

pub trait KemProvider {
    fn keygen() -> (PublicKey, SecretKey);
    /// `(shared_secret, ciphertext)` for one recipient slot.
    fn encapsulate(pk: &PublicKey) -> Result<(SharedSecret, Vec<u8>), EncodingError>;
    fn decapsulate(sk: &SecretKey, ct: &[u8]) -> Result<SharedSecret, DecryptionError>;
}

pub struct HybridX25519MlKem768Provider;

impl KemProvider for HybridX25519MlKem768Provider {
    fn keygen() -> (PublicKey, SecretKey) {
        let x25519 = StaticSecret::random_from_rng(OsRng);
        let (mlkem_dk, mlkem_ek) = MlKem768::generate(&mut OsRng);
        let public = PublicKey {
            x25519: X25519PublicKey::from(&x25519),
            mlkem: mlkem_ek,
        };
        (public, SecretKey { x25519, mlkem: mlkem_dk })
    }

    fn encapsulate(pk: &PublicKey) -> Result<(SharedSecret, Vec<u8>), EncodingError> {
        let eph = EphemeralSecret::random_from_rng(OsRng);
        let eph_pk = X25519PublicKey::from(&eph);
        let dh = eph.diffie_hellman(&pk.x25519);
        let (mlkem_ct, mlkem_ss) = pk.mlkem.encapsulate(&mut OsRng).map_err(|_| EncodingError)?;

        let mut ct = Vec::with_capacity(KEM_CIPHERTEXT_BYTES);
        ct.extend_from_slice(eph_pk.as_bytes());
        ct.extend_from_slice(mlkem_ct.as_slice());
        Ok((combine(dh.as_bytes(), mlkem_ss.as_slice()), ct))
    }

    fn decapsulate(sk: &SecretKey, ct: &[u8]) -> Result<SharedSecret, DecryptionError> {
        if ct.len() != KEM_CIPHERTEXT_BYTES {
            return Err(DecryptionError);
        }
        let (eph, mlkem_ct) = ct.split_at(X25519_KEY_BYTES);
        let eph: [u8; X25519_KEY_BYTES] = eph.try_into().map_err(|_| DecryptionError)?;
        let mlkem_ct = Ciphertext::<MlKem768>::try_from(mlkem_ct).map_err(|_| DecryptionError)?;

        let dh = sk.x25519.diffie_hellman(&X25519PublicKey::from(eph));
        let mlkem_ss = sk.mlkem.decapsulate(&mlkem_ct).map_err(|_| DecryptionError)?;
        Ok(combine(dh.as_bytes(), mlkem_ss.as_slice()))
    }
}

/// Fresh hybrid device keypair.
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    HybridX25519MlKem768Provider::keygen()
}
