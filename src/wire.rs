//! Wire format (v1, streaming multi-recipient)
//!
//! Header:
//!   magic[3] = "SGL" || version[1] || mode[1] || suite_kem[1] || suite_aead[1]
//!   || flags[1] || body_len[4]
//!   body = sender_ct_len[2] || sender_ct || slot_count[2] || slot*
//!   slot = marker[1] || kid[32]? || kem_ct[1120] || wrapped_key[48]
//!
//! Chunks (after the header, at least one, last one flagged final):
//!   final[1] || ct_len[4] || ct || authenticator[32] * slot_count
//!
//! kem_ct = x25519_ephemeral_pk[32] || mlkem768_ciphertext[1088]

extern crate alloc;
use alloc::vec::Vec;

use crate::error::{CryptoFormat, EncodingError, EnvelopeError};
use crate::kem::Kid;

/// Protocol identifier for KDF domain separation
pub const PROTOCOL_ID: &[u8] = b"sigil-env-v1";

pub const MAGIC: &[u8; 3] = b"SGL";

/// Version byte for v1
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Message modes. Only `MODE_ENCRYPT` is handled here; the signing modes are
/// recognised so they can be rejected by name.
pub const MODE_ENCRYPT: u8 = 0x00;
pub const MODE_ATTACHED_SIGN: u8 = 0x01;
pub const MODE_DETACHED_SIGN: u8 = 0x02;

/// Suite identifiers (on-wire)
pub const SUITE_KEM_HYBRID_X25519_MLKEM768: u8 = 0xA3;
pub const SUITE_AEAD_AES256GCM: u8 = 0xB1;

pub const FLAGS_V1: u8 = 0x00;

/// Slot markers
pub const SLOT_ANONYMOUS: u8 = 0x00;
pub const SLOT_KID: u8 = 0x01;

/// Sender field kinds (inside the encrypted sender field)
pub const SENDER_KEY: u8 = 0x00;
pub const SENDER_ANONYMOUS: u8 = 0x01;

// ---------------------------------------------------------------------------
// Component sizes
// ---------------------------------------------------------------------------

/// X25519 public key / ephemeral key size
pub const X25519_KEY_BYTES: usize = 32;

/// ML-KEM-768 component sizes
pub const MLKEM_CIPHERTEXT_BYTES: usize = 1088;
pub const MLKEM_PUBLIC_KEY_BYTES: usize = 1184;
pub const MLKEM_SECRET_KEY_BYTES: usize = 2400;

/// Hybrid KEM ciphertext: x25519_ephemeral_pk[32] || mlkem_ct[1088]
pub const KEM_CIPHERTEXT_BYTES: usize = X25519_KEY_BYTES + MLKEM_CIPHERTEXT_BYTES; // 1120

/// Hybrid public key: x25519_pk[32] || mlkem_ek[1184]
pub const KEM_PUBLIC_KEY_BYTES: usize = X25519_KEY_BYTES + MLKEM_PUBLIC_KEY_BYTES; // 1216

/// Hybrid secret key: x25519_sk[32] || mlkem_dk[2400]
pub const KEM_SECRET_KEY_BYTES: usize = X25519_KEY_BYTES + MLKEM_SECRET_KEY_BYTES; // 2432

/// Per-KEM shared secret size (each produces 32 bytes)
pub const SHARED_SECRET_BYTES: usize = 32;

pub const NONCE_BYTES: usize = 12;
pub const AEAD_TAG_BYTES: usize = 16;
pub const AES_KEY_BYTES: usize = 32;

pub const KID_BYTES: usize = 32;
pub const HASH_BYTES: usize = 32;
pub const AUTHENTICATOR_BYTES: usize = 32;

/// Payload key sealed under the slot key.
pub const WRAPPED_KEY_BYTES: usize = AES_KEY_BYTES + AEAD_TAG_BYTES; // 48

/// Fixed prefix: magic + version + mode + suites + flags + body_len(u32)
pub const PREFIX_BYTES: usize = 3 + 1 + 1 + 1 + 1 + 1 + 4; // 12

/// Sender field plaintexts: kind + hybrid key, or kind + throwaway x25519 key.
pub const SENDER_FIELD_KEY_BYTES: usize = 1 + KEM_PUBLIC_KEY_BYTES;
pub const SENDER_FIELD_ANON_BYTES: usize = 1 + X25519_KEY_BYTES;

pub const MAX_RECIPIENTS: usize = u16::MAX as usize;
pub const MAX_CHUNK_BYTES: usize = 1 << 20;
pub const DEFAULT_CHUNK_BYTES: usize = 1 << 16;

const MAX_SLOT_BYTES: usize = 1 + KID_BYTES + KEM_CIPHERTEXT_BYTES + WRAPPED_KEY_BYTES;
const MAX_SENDER_CT_BYTES: usize = SENDER_FIELD_KEY_BYTES + AEAD_TAG_BYTES;

/// Upper bound on a well-formed header body.
pub const MAX_HEADER_BODY_BYTES: usize = 2 + MAX_SENDER_CT_BYTES + 2 + MAX_RECIPIENTS * MAX_SLOT_BYTES;

/// Nonce for the sender field. Chunk nonces never collide with it because
/// their first four bytes are zero.
pub const SENDER_NONCE: [u8; NONCE_BYTES] = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0];

/// Slot keys are single-use, so the wrap nonce is fixed.
pub const SLOT_NONCE: [u8; NONCE_BYTES] = [0u8; NONCE_BYTES];

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// One recipient slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientSlot {
    /// `None` is the anonymous marker.
    pub kid: Option<Kid>,
    pub kem_ciphertext: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

impl RecipientSlot {
    /// Bytes identifying the slot; bound into the payload key wrap.
    pub fn id_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + KID_BYTES);
        match &self.kid {
            Some(kid) => {
                out.push(SLOT_KID);
                out.extend_from_slice(kid.as_bytes());
            }
            None => out.push(SLOT_ANONYMOUS),
        }
        out
    }
}

/// Parsed envelope header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub mode: u8,
    pub suite_kem: u8,
    pub suite_aead: u8,
    pub flags: u8,
    pub sender_ciphertext: Vec<u8>,
    pub slots: Vec<RecipientSlot>,
}

impl Header {
    pub fn new(sender_ciphertext: Vec<u8>, slots: Vec<RecipientSlot>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            mode: MODE_ENCRYPT,
            suite_kem: SUITE_KEM_HYBRID_X25519_MLKEM768,
            suite_aead: SUITE_AEAD_AES256GCM,
            flags: FLAGS_V1,
            sender_ciphertext,
            slots,
        }
    }
}

pub fn encode_header(header: &Header) -> Result<Vec<u8>, EncodingError> {
    if header.slots.is_empty() || header.slots.len() > MAX_RECIPIENTS {
        return Err(EncodingError);
    }
    if header.sender_ciphertext.len() > MAX_SENDER_CT_BYTES {
        return Err(EncodingError);
    }

    let mut body = Vec::with_capacity(4 + header.sender_ciphertext.len() + header.slots.len() * MAX_SLOT_BYTES);
    body.extend_from_slice(&(header.sender_ciphertext.len() as u16).to_be_bytes());
    body.extend_from_slice(&header.sender_ciphertext);
    body.extend_from_slice(&(header.slots.len() as u16).to_be_bytes());
    for slot in &header.slots {
        if slot.kem_ciphertext.len() != KEM_CIPHERTEXT_BYTES || slot.wrapped_key.len() != WRAPPED_KEY_BYTES {
            return Err(EncodingError);
        }
        body.extend_from_slice(&slot.id_bytes());
        body.extend_from_slice(&slot.kem_ciphertext);
        body.extend_from_slice(&slot.wrapped_key);
    }

    let mut out = Vec::with_capacity(PREFIX_BYTES + body.len());
    out.extend_from_slice(MAGIC);
    out.push(header.version);
    out.push(header.mode);
    out.push(header.suite_kem);
    out.push(header.suite_aead);
    out.push(header.flags);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Fields of the fixed prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prefix {
    pub version: u8,
    pub mode: u8,
    pub suite_kem: u8,
    pub suite_aead: u8,
    pub flags: u8,
    pub body_len: usize,
}

pub fn decode_prefix(data: &[u8; PREFIX_BYTES]) -> Result<Prefix, EnvelopeError> {
    if &data[..3] != MAGIC {
        return Err(EnvelopeError::Malformed("bad magic"));
    }
    let prefix = Prefix {
        version: data[3],
        mode: data[4],
        suite_kem: data[5],
        suite_aead: data[6],
        flags: data[7],
        body_len: u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize,
    };

    if prefix.version != PROTOCOL_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(prefix.version));
    }
    if prefix.suite_kem != SUITE_KEM_HYBRID_X25519_MLKEM768 || prefix.suite_aead != SUITE_AEAD_AES256GCM {
        return Err(EnvelopeError::UnsupportedSuite {
            kem: prefix.suite_kem,
            aead: prefix.suite_aead,
        });
    }
    if prefix.flags != FLAGS_V1 {
        return Err(EnvelopeError::Malformed("unknown flags"));
    }
    if prefix.body_len > MAX_HEADER_BODY_BYTES {
        return Err(EnvelopeError::Malformed("header too large"));
    }
    Ok(prefix)
}

/// Bounds-checked cursor over a header body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos.checked_add(n).ok_or(EnvelopeError::Truncated)?;
        if end > self.data.len() {
            return Err(EnvelopeError::Truncated);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EnvelopeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

/// `decode_prefix`, refusing any mode but encryption.
pub fn decode_encrypted_prefix(data: &[u8; PREFIX_BYTES]) -> Result<Prefix, EnvelopeError> {
    let prefix = decode_prefix(data)?;
    if prefix.mode != MODE_ENCRYPT {
        return Err(EnvelopeError::Malformed("not an encrypted message"));
    }
    Ok(prefix)
}

pub fn decode_body(prefix: Prefix, body: &[u8]) -> Result<Header, EnvelopeError> {
    let mut cur = Cursor { data: body, pos: 0 };

    let sender_len = cur.u16()? as usize;
    if sender_len > MAX_SENDER_CT_BYTES {
        return Err(EnvelopeError::Malformed("sender field too large"));
    }
    let sender_ciphertext = cur.take(sender_len)?.to_vec();

    let slot_count = cur.u16()? as usize;
    if slot_count == 0 {
        return Err(EnvelopeError::NoRecipients);
    }

    let mut slots = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        let kid = match cur.u8()? {
            SLOT_ANONYMOUS => None,
            SLOT_KID => Some(Kid::from_slice(cur.take(KID_BYTES)?)?),
            _ => return Err(EnvelopeError::Malformed("unknown slot marker")),
        };
        let kem_ciphertext = cur.take(KEM_CIPHERTEXT_BYTES)?.to_vec();
        let wrapped_key = cur.take(WRAPPED_KEY_BYTES)?.to_vec();
        slots.push(RecipientSlot {
            kid,
            kem_ciphertext,
            wrapped_key,
        });
    }

    if cur.pos != body.len() {
        return Err(EnvelopeError::Malformed("trailing bytes in header"));
    }

    Ok(Header {
        version: prefix.version,
        mode: prefix.mode,
        suite_kem: prefix.suite_kem,
        suite_aead: prefix.suite_aead,
        flags: prefix.flags,
        sender_ciphertext,
        slots,
    })
}

/// Decode a complete header from the start of `data`.
///
/// Returns the header and the number of bytes it occupied.
pub fn decode_header(data: &[u8]) -> Result<(Header, usize), EnvelopeError> {
    let prefix_bytes: &[u8; PREFIX_BYTES] = data
        .get(..PREFIX_BYTES)
        .and_then(|b| b.try_into().ok())
        .ok_or(EnvelopeError::Truncated)?;
    let prefix = decode_encrypted_prefix(prefix_bytes)?;
    let end = PREFIX_BYTES + prefix.body_len;
    let body = data.get(PREFIX_BYTES..end).ok_or(EnvelopeError::Truncated)?;
    Ok((decode_body(prefix, body)?, end))
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

pub fn chunk_nonce(index: u64) -> [u8; NONCE_BYTES] {
    let mut n = [0u8; NONCE_BYTES];
    n[4..].copy_from_slice(&index.to_be_bytes());
    n
}

/// header_hash || index || final
pub fn chunk_aad(header_hash: &[u8; HASH_BYTES], index: u64, is_final: bool) -> [u8; HASH_BYTES + 9] {
    let mut aad = [0u8; HASH_BYTES + 9];
    aad[..HASH_BYTES].copy_from_slice(header_hash);
    aad[HASH_BYTES..HASH_BYTES + 8].copy_from_slice(&index.to_be_bytes());
    aad[HASH_BYTES + 8] = is_final as u8;
    aad
}

pub fn encode_chunk(is_final: bool, ciphertext: &[u8], authenticators: &[[u8; AUTHENTICATOR_BYTES]]) -> Result<Vec<u8>, EncodingError> {
    if ciphertext.len() < AEAD_TAG_BYTES || ciphertext.len() > MAX_CHUNK_BYTES + AEAD_TAG_BYTES {
        return Err(EncodingError);
    }
    let mut out = Vec::with_capacity(5 + ciphertext.len() + authenticators.len() * AUTHENTICATOR_BYTES);
    out.push(is_final as u8);
    out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(ciphertext);
    for auth in authenticators {
        out.extend_from_slice(auth);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Format detection
// ---------------------------------------------------------------------------

pub const ARMOR_ENCRYPTED_HEADER: &str = "BEGIN SIGIL ENCRYPTED MESSAGE.";
pub const ARMOR_ENCRYPTED_FOOTER: &str = "END SIGIL ENCRYPTED MESSAGE.";
pub const ARMOR_SIGNED_HEADER: &str = "BEGIN SIGIL SIGNED MESSAGE.";
pub const ARMOR_DETACHED_HEADER: &str = "BEGIN SIGIL DETACHED SIGNATURE.";
const PGP_ARMOR_PREFIX: &str = "-----BEGIN PGP ";

/// How many leading bytes `detect_format` wants to see.
pub const DETECT_PREFIX_BYTES: usize = 64;

/// What a message is, and whether it is armored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Detected {
    pub format: CryptoFormat,
    pub armored: bool,
}

/// Classify a message from its first bytes.
pub fn detect_format(prefix: &[u8]) -> Detected {
    let start = prefix
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(prefix.len());
    let text = &prefix[start..];

    let armored = |format| Detected { format, armored: true };
    if text.starts_with(ARMOR_ENCRYPTED_HEADER.as_bytes()) {
        return armored(CryptoFormat::SigilEncrypted);
    }
    if text.starts_with(ARMOR_SIGNED_HEADER.as_bytes()) || text.starts_with(ARMOR_DETACHED_HEADER.as_bytes()) {
        return armored(CryptoFormat::SigilSigned);
    }
    if text.starts_with(PGP_ARMOR_PREFIX.as_bytes()) {
        return armored(CryptoFormat::Pgp);
    }

    let binary = |format| Detected { format, armored: false };
    if prefix.len() > 4 && &prefix[..3] == MAGIC {
        return match prefix[4] {
            MODE_ENCRYPT => binary(CryptoFormat::SigilEncrypted),
            MODE_ATTACHED_SIGN | MODE_DETACHED_SIGN => binary(CryptoFormat::SigilSigned),
            _ => binary(CryptoFormat::Unknown),
        };
    }
    // OpenPGP packet tags always have the top bit set.
    match prefix.first() {
        Some(b) if b & 0x80 != 0 => binary(CryptoFormat::Pgp),
        _ => binary(CryptoFormat::Unknown),
    }
}
