//! Local device keys and the authenticated session that holds them.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use ed25519_dalek::SigningKey;
use rand_core::RngCore;
use sigil_envelope::wire::KEM_SECRET_KEY_BYTES;
use sigil_envelope::{generate_keypair, Kid, PublicKey, SecretKey};
use tracing::info;
use zeroize::Zeroizing;

use crate::error::RegistryError;
use crate::registry::DeviceRegistry;
use crate::types::{Device, DeviceId, DeviceType, Username};

const SIGNING_SEED_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Local key
// ---------------------------------------------------------------------------

/// A device's public record together with its private keys.
pub struct LocalKey {
    pub device: Device,
    secret: SecretKey,
    signing: SigningKey,
}

impl LocalKey {
    /// Fresh encryption and signing keys for a new device.
    pub fn generate(name: impl Into<String>, device_type: DeviceType) -> Self {
        let (pk, secret) = generate_keypair();
        let mut seed = Zeroizing::new([0u8; SIGNING_SEED_BYTES]);
        rand_core::OsRng.fill_bytes(&mut seed[..]);
        let signing = SigningKey::from_bytes(&seed);
        let device = Device::new(name, device_type, &pk, &signing.verifying_key());
        Self { device, secret, signing }
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn kid(&self) -> Kid {
        self.public_key().kid()
    }

    /// kem_secret[2432] || ed25519_seed[32]
    pub fn export_secret(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(KEM_SECRET_KEY_BYTES + SIGNING_SEED_BYTES));
        out.extend_from_slice(Zeroizing::new(self.secret.to_bytes()).as_slice());
        out.extend_from_slice(&self.signing.to_bytes());
        out
    }

    /// Rebuild from `export_secret` output; the keys must match `device`.
    pub fn import(device: Device, bytes: &[u8]) -> Result<Self, RegistryError> {
        if bytes.len() != KEM_SECRET_KEY_BYTES + SIGNING_SEED_BYTES {
            return Err(RegistryError::InvalidKey("secret length"));
        }
        let secret = SecretKey::from_bytes(&bytes[..KEM_SECRET_KEY_BYTES])
            .map_err(|_| RegistryError::InvalidKey("encryption secret"))?;
        let seed: [u8; SIGNING_SEED_BYTES] = bytes[KEM_SECRET_KEY_BYTES..]
            .try_into()
            .map_err(|_| RegistryError::InvalidKey("signing seed"))?;
        let signing = SigningKey::from_bytes(&seed);

        if secret.public_key() != device.public_key()? || signing.verifying_key() != device.verifying_key()? {
            return Err(RegistryError::InvalidKey("secret does not match device"));
        }
        Ok(Self { device, secret, signing })
    }
}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKey").field("device", &self.device).finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Secret retrieval
// ---------------------------------------------------------------------------

/// Where stored device secrets come from (keychain, passphrase prompt, ...).
pub trait SecretSource: Send + Sync {
    fn device_secret(&self, username: &Username, device: &DeviceId) -> Result<Option<Zeroizing<Vec<u8>>>, RegistryError>;
}

#[derive(Default)]
pub struct InMemorySecretSource {
    secrets: RwLock<HashMap<(Username, DeviceId), Zeroizing<Vec<u8>>>>,
}

impl InMemorySecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, username: &Username, key: &LocalKey) {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((username.clone(), key.device.id.clone()), key.export_secret());
    }
}

impl SecretSource for InMemorySecretSource {
    fn device_secret(&self, username: &Username, device: &DeviceId) -> Result<Option<Zeroizing<Vec<u8>>>, RegistryError> {
        let secrets = self.secrets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(secrets.get(&(username.clone(), device.clone())).cloned())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An authenticated user on this device.
///
/// `keys[0]` is the device the session runs on. Further keys (an unlocked
/// paper key, say) are only used as extra decryption candidates.
pub struct Session {
    username: Username,
    keys: Vec<LocalKey>,
    token: String,
}

impl Session {
    pub fn new(username: Username, current: LocalKey, token: impl Into<String>) -> Self {
        Self {
            username,
            keys: vec![current],
            token: token.into(),
        }
    }

    /// Register a new user with one device plus a backup key.
    ///
    /// The backup key is returned to the caller to be written down; the
    /// session only keeps the device key.
    pub fn signup(
        registry: &DeviceRegistry,
        username: Username,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Result<(Session, LocalKey), RegistryError> {
        let device = LocalKey::generate(device_name, device_type);
        let backup = LocalKey::generate("paper key", DeviceType::Backup);
        registry.signup(&username, vec![device.device.clone(), backup.device.clone()])?;
        info!(user = %username, device = %device.device.id, "signed up");
        Ok((Session::new(username, device, new_token()), backup))
    }

    /// Restore a session for an active device from stored secrets.
    pub fn unlock(
        registry: &DeviceRegistry,
        username: Username,
        device: &DeviceId,
        source: &dyn SecretSource,
    ) -> Result<Session, RegistryError> {
        let record = registry
            .user(&username)?
            .ok_or_else(|| RegistryError::UserNotFound(username.clone()))?;
        let not_found = || RegistryError::DeviceNotFound {
            username: username.clone(),
            device: device.clone(),
        };
        let public = record.active_device(device).cloned().ok_or_else(not_found)?;
        let secret = source.device_secret(&username, device)?.ok_or_else(not_found)?;
        let key = LocalKey::import(public, &secret)?;
        Ok(Session::new(username, key, new_token()))
    }

    pub fn username(&self) -> &Username {
        &self.username
    }

    pub fn current(&self) -> &LocalKey {
        &self.keys[0]
    }

    pub fn keys(&self) -> &[LocalKey] {
        &self.keys
    }

    /// Add another decryption candidate, e.g. an unlocked paper key.
    pub fn add_key(&mut self, key: LocalKey) {
        self.keys.push(key);
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

pub(crate) fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand_core::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_import_roundtrip() {
        let key = LocalKey::generate("laptop", DeviceType::Desktop);
        let restored = LocalKey::import(key.device.clone(), &key.export_secret()).unwrap();
        assert_eq!(restored.kid(), key.kid());
        assert_eq!(restored.device, key.device);
    }

    #[test]
    fn import_rejects_foreign_secret() {
        let a = LocalKey::generate("a", DeviceType::Desktop);
        let b = LocalKey::generate("b", DeviceType::Desktop);
        assert!(LocalKey::import(a.device.clone(), &b.export_secret()).is_err());
    }

    #[test]
    fn unlock_from_secret_source() {
        let registry = DeviceRegistry::in_memory();
        let alice = Username::new("alice");
        let (session, _backup) = Session::signup(&registry, alice.clone(), "laptop", DeviceType::Desktop).unwrap();

        let source = InMemorySecretSource::new();
        source.store(&alice, session.current());
        let device = session.current().device.id.clone();
        let again = Session::unlock(&registry, alice.clone(), &device, &source).unwrap();
        assert_eq!(again.current().kid(), session.current().kid());
        assert_ne!(again.token(), session.token());

        registry.revoke_device(&alice, &device).unwrap();
        assert!(Session::unlock(&registry, alice, &device, &source).is_err());
    }
}
