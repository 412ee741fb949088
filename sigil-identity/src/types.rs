//! Core types: Username, DeviceId, DeviceType, Device, UserRecord, DeviceAttestation.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sigil_envelope::{Kid, PublicKey};
use std::fmt;

use crate::error::RegistryError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique device identifier (hex-encoded random bytes).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand_core::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Create from a specific string (for testing/deterministic use).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    /// Paper key: never online, only used to recover.
    Backup,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Desktop => write!(f, "desktop"),
            DeviceType::Mobile => write!(f, "mobile"),
            DeviceType::Backup => write!(f, "backup"),
        }
    }
}

/// Public record of one device. Keys are hex so the record stores as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub device_type: DeviceType,
    /// Hybrid encryption public key.
    pub encryption_key: String,
    /// `Kid` of `encryption_key`.
    pub kid: String,
    /// Ed25519 verifying key, used to check attestations this device signs.
    pub signing_key: String,
    pub added_at: DateTime<Utc>,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        device_type: DeviceType,
        encryption_key: &PublicKey,
        signing_key: &VerifyingKey,
    ) -> Self {
        Self {
            id: DeviceId::generate(),
            name: name.into(),
            device_type,
            encryption_key: hex::encode(encryption_key.to_bytes()),
            kid: encryption_key.kid().to_hex(),
            signing_key: hex::encode(signing_key.to_bytes()),
            added_at: Utc::now(),
        }
    }

    pub fn public_key(&self) -> Result<PublicKey, RegistryError> {
        let raw = hex::decode(&self.encryption_key).map_err(|_| RegistryError::InvalidKey("encryption key hex"))?;
        PublicKey::from_bytes(&raw).map_err(|_| RegistryError::InvalidKey("encryption key"))
    }

    pub fn kid(&self) -> Result<Kid, RegistryError> {
        Kid::from_hex(&self.kid).map_err(|_| RegistryError::InvalidKey("kid"))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, RegistryError> {
        let raw: [u8; 32] = hex::decode(&self.signing_key)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(RegistryError::InvalidKey("signing key hex"))?;
        VerifyingKey::from_bytes(&raw).map_err(|_| RegistryError::InvalidKey("signing key"))
    }

    /// The stored kid must be the kid of the stored key.
    pub fn check_consistent(&self) -> Result<Kid, RegistryError> {
        let kid = self.kid()?;
        if self.public_key()?.kid() != kid {
            return Err(RegistryError::InvalidKey("kid does not match encryption key"));
        }
        self.verifying_key()?;
        Ok(kid)
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: Username,
    /// Active devices in provisioning order.
    pub devices: Vec<Device>,
    /// Revoked devices, kept so old senders still resolve.
    #[serde(default)]
    pub revoked: Vec<Device>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn active_device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| &d.id == id)
    }
}

// ---------------------------------------------------------------------------
// Attestation
// ---------------------------------------------------------------------------

const ATTESTATION_DOMAIN: &[u8] = b"sigil-attest-v1";

/// An existing device vouching for a new one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttestation {
    pub username: Username,
    pub device: Device,
    pub signer: DeviceId,
    /// Hex Ed25519 signature over `signing_payload`.
    pub signature: String,
}

impl DeviceAttestation {
    pub fn sign(username: Username, device: Device, signer: DeviceId, key: &SigningKey) -> Self {
        let payload = Self::signing_payload(&username, &device, &signer);
        let signature = hex::encode(key.sign(&payload).to_bytes());
        Self {
            username,
            device,
            signer,
            signature,
        }
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), RegistryError> {
        let raw: [u8; 64] = hex::decode(&self.signature)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(RegistryError::BadAttestation)?;
        let sig = Signature::from_bytes(&raw);
        let payload = Self::signing_payload(&self.username, &self.device, &self.signer);
        key.verify(&payload, &sig).map_err(|_| RegistryError::BadAttestation)
    }

    /// Length-prefixed fields, so no two attestations share a payload.
    fn signing_payload(username: &Username, device: &Device, signer: &DeviceId) -> Vec<u8> {
        let device_type = device.device_type.to_string();
        let fields: [&[u8]; 7] = [
            username.as_str().as_bytes(),
            device.id.as_str().as_bytes(),
            device.name.as_bytes(),
            device_type.as_bytes(),
            device.encryption_key.as_bytes(),
            device.signing_key.as_bytes(),
            signer.as_str().as_bytes(),
        ];
        let mut out = Vec::with_capacity(ATTESTATION_DOMAIN.len() + fields.iter().map(|f| f.len() + 4).sum::<usize>());
        out.extend_from_slice(ATTESTATION_DOMAIN);
        for field in fields {
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field);
        }
        out
    }
}
