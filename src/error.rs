//! Error types for the envelope.
//!
//! Cryptographic failures stay opaque (`DecryptionError`, `EncodingError`) so a
//! tampered slot, a wrong key and a bad chunk authenticator all look the same.
//! Structural problems the caller must act on get their own `EnvelopeError` variant.

use core::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptionError;

impl fmt::Display for DecryptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decryption failed")
    }
}

impl std::error::Error for DecryptionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingError;

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encoding error")
    }
}

impl std::error::Error for EncodingError {}

/// Normalize encode errors into decrypt errors (oracle discipline).
impl From<EncodingError> for DecryptionError {
    fn from(_: EncodingError) -> Self {
        DecryptionError
    }
}

// ---------------------------------------------------------------------------
// Message formats
// ---------------------------------------------------------------------------

/// The kind of message a byte stream appears to hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CryptoFormat {
    /// Native encrypted envelope (armored or binary).
    SigilEncrypted,
    /// Native signed-message block. Never decryptable.
    SigilSigned,
    /// OpenPGP, armored or binary packets.
    Pgp,
    /// Nothing recognisable.
    Unknown,
}

impl fmt::Display for CryptoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoFormat::SigilEncrypted => write!(f, "sigil-encrypted"),
            CryptoFormat::SigilSigned => write!(f, "sigil-signed"),
            CryptoFormat::Pgp => write!(f, "pgp"),
            CryptoFormat::Unknown => write!(f, "unknown"),
        }
    }
}

/// Input was well-formed for some format, just not the one the operation needs.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("wrong crypto message format for {operation}: wanted {wanted}, received {received}")]
pub struct FormatMismatch {
    pub wanted: CryptoFormat,
    pub received: CryptoFormat,
    pub operation: String,
}

impl FormatMismatch {
    pub fn new(wanted: CryptoFormat, received: CryptoFormat, operation: impl Into<String>) -> Self {
        Self {
            wanted,
            received,
            operation: operation.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    FormatMismatch(#[from] FormatMismatch),

    #[error("unsupported envelope version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unsupported suite: kem {kem:#04x}, aead {aead:#04x}")]
    UnsupportedSuite { kem: u8, aead: u8 },

    #[error("malformed envelope: {0}")]
    Malformed(&'static str),

    #[error("malformed armor: {0}")]
    Armor(&'static str),

    #[error("envelope has no recipients")]
    NoRecipients,

    #[error("too many recipients: {0}")]
    TooManyRecipients(usize),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(usize),

    #[error("no candidate key opens any recipient slot")]
    NoMatchingKey,

    #[error("envelope truncated")]
    Truncated,

    #[error("trailing data after final chunk")]
    TrailingData,

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvelopeError {
    /// The format mismatch carried by this error, if that is what it is.
    pub fn format_mismatch(&self) -> Option<&FormatMismatch> {
        match self {
            EnvelopeError::FormatMismatch(m) => Some(m),
            _ => None,
        }
    }
}
