//! Error types for registry, trust, encrypt/decrypt and provisioning.

use sigil_envelope::{EnvelopeError, FormatMismatch};
use thiserror::Error;

use crate::engine::MessageInfo;
use crate::trust::SenderClassification;
use crate::types::{DeviceId, Username};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("user not found: {0}")]
    UserNotFound(Username),

    #[error("user already exists: {0}")]
    UserExists(Username),

    #[error("device {device} not found for {username}")]
    DeviceNotFound { username: Username, device: DeviceId },

    #[error("signer {0} is not an active device")]
    SignerNotActive(DeviceId),

    #[error("attestation signature invalid")]
    BadAttestation,

    #[error("key {0} is already registered")]
    DuplicateDevice(String),

    #[error("key {0} was revoked and cannot be re-activated")]
    DeviceRevoked(String),

    #[error("signup needs at least one device")]
    NoDevices,

    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Trust
// ---------------------------------------------------------------------------

/// A proof check that could not complete (network, service outage).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("could not verify {service} proof for {handle}: {reason}")]
pub struct VerificationFailure {
    pub service: String,
    pub handle: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Encrypt / decrypt
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("recipient {0} has no active devices")]
    UnknownRecipient(Username),

    #[error("no recipients to encrypt for")]
    NoRecipients,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error(transparent)]
    FormatMismatch(FormatMismatch),

    #[error("no local key can decrypt this message ({} of your devices addressed)", info.devices.len())]
    NoDecryptionKey { info: MessageInfo },

    #[error("sender rejected by policy: {classification}")]
    PolicyRejected { classification: SenderClassification },

    #[error(transparent)]
    Verification(#[from] VerificationFailure),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Envelope(EnvelopeError),
}

impl From<FormatMismatch> for DecryptError {
    fn from(m: FormatMismatch) -> Self {
        DecryptError::FormatMismatch(m)
    }
}

/// Format mismatches keep their own variant; everything else is an envelope error.
impl From<EnvelopeError> for DecryptError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::FormatMismatch(m) => DecryptError::FormatMismatch(m),
            other => DecryptError::Envelope(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProvisioningFailed {
    #[error("provisioning timed out")]
    Timeout,

    #[error("provisioning secret mismatch")]
    SecretMismatch,

    #[error("provisioning transport error: {0}")]
    Transport(String),

    #[error("device activation rejected: {0}")]
    Activation(#[from] RegistryError),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
