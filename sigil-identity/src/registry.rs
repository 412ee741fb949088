//! Device registry: which devices each user has, and which of them may decrypt.
//!
//! ```text
//! signup / activate_device ──→ ACTIVE ──→ revoke_device ──→ REVOKED (terminal)
//! ```
//!
//! Revoked devices stay in the user's record so that old messages still
//! resolve to a sender, but they never come back as recipients.

use crate::audit::{AuditAction, AuditEvent, AuditSink, TracingAuditSink};
use crate::error::RegistryError;
use crate::storage::{InMemoryStore, RegistryStore};
use crate::types::{Device, DeviceAttestation, DeviceId, UserRecord, Username};

use chrono::Utc;
use sigil_envelope::Kid;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Who holds a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyOwner {
    pub username: Username,
    pub device: DeviceId,
    pub revoked: bool,
}

pub struct DeviceRegistry {
    store: Arc<dyn RegistryStore>,
    audit: Arc<dyn AuditSink>,
    /// kid → owner, over every device ever registered.
    index: RwLock<HashMap<Kid, KeyOwner>>,
    user_locks: Mutex<HashMap<Username, Arc<Mutex<()>>>>,
}

fn poisoned<T>(_: T) -> RegistryError {
    RegistryError::Storage("lock poisoned".into())
}

impl DeviceRegistry {
    /// Open a registry over `store`, indexing every key it already holds.
    pub fn open(store: Arc<dyn RegistryStore>, audit: Arc<dyn AuditSink>) -> Result<Self, RegistryError> {
        let mut index = HashMap::new();
        for record in store.list()? {
            index_record(&mut index, &record)?;
        }
        debug!(keys = index.len(), "registry opened");
        Ok(Self {
            store,
            audit,
            index: RwLock::new(index),
            user_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Empty in-memory registry that audits to `tracing`.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            audit: Arc::new(TracingAuditSink),
            index: RwLock::new(HashMap::new()),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    fn user_lock(&self, username: &Username) -> Result<Arc<Mutex<()>>, RegistryError> {
        let mut locks = self.user_locks.lock().map_err(poisoned)?;
        Ok(locks.entry(username.clone()).or_default().clone())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn user(&self, username: &Username) -> Result<Option<UserRecord>, RegistryError> {
        self.store.get(username)
    }

    /// Active devices in provisioning order. Unknown users have none.
    pub fn active_devices(&self, username: &Username) -> Result<Vec<Device>, RegistryError> {
        Ok(self.store.get(username)?.map(|r| r.devices).unwrap_or_default())
    }

    /// Resolve a key to its owner, including revoked devices.
    pub fn owner_of_kid(&self, kid: &Kid) -> Result<Option<KeyOwner>, RegistryError> {
        let index = self.index.read().map_err(poisoned)?;
        Ok(index.get(kid).cloned())
    }

    /// Look up a device of `username` by key, active or revoked.
    pub fn device_by_kid(&self, username: &Username, kid: &Kid) -> Result<Option<Device>, RegistryError> {
        let Some(record) = self.store.get(username)? else {
            return Ok(None);
        };
        let hex = kid.to_hex();
        Ok(record
            .devices
            .into_iter()
            .chain(record.revoked)
            .find(|d| d.kid == hex))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Create a user with its initial devices. No attestation is needed.
    pub fn signup(&self, username: &Username, devices: Vec<Device>) -> Result<UserRecord, RegistryError> {
        if devices.is_empty() {
            return Err(RegistryError::NoDevices);
        }
        let lock = self.user_lock(username)?;
        let _guard = lock.lock().map_err(poisoned)?;

        if self.store.get(username)?.is_some() {
            return Err(RegistryError::UserExists(username.clone()));
        }
        let mut seen = HashSet::new();
        let mut claims = Vec::with_capacity(devices.len());
        for device in &devices {
            let kid = device.check_consistent()?;
            if !seen.insert(kid) {
                return Err(RegistryError::DuplicateDevice(device.kid.clone()));
            }
            claims.push((kid, device));
        }
        self.reserve_kids(username, &claims)?;
        let kids: Vec<Kid> = claims.iter().map(|(kid, _)| *kid).collect();

        let now = Utc::now();
        let record = UserRecord {
            username: username.clone(),
            devices,
            revoked: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.put(&record) {
            self.release_kids(&kids);
            return Err(e);
        }

        info!(user = %username, devices = record.devices.len(), "user registered");
        self.audit.record(AuditEvent::new(
            username,
            AuditAction::UserRegistered {
                device_count: record.devices.len(),
            },
        ));
        Ok(record)
    }

    /// Add an attested device to its user's active set.
    ///
    /// The signer must be one of the user's active devices. A key is accepted
    /// at most once: re-activating an active key is `DuplicateDevice`, and a
    /// revoked key is `DeviceRevoked` forever.
    pub fn activate_device(&self, attestation: &DeviceAttestation) -> Result<Device, RegistryError> {
        let username = &attestation.username;
        let result = self.try_activate(attestation);
        match &result {
            Ok(device) => {
                info!(user = %username, device = %device.id, kind = %device.device_type, "device activated");
                self.audit.record(
                    AuditEvent::new(
                        username,
                        AuditAction::DeviceActivated {
                            device: device.id.clone(),
                            device_type: device.device_type,
                            signer: attestation.signer.clone(),
                        },
                    )
                    .by(attestation.signer.as_str()),
                );
            }
            Err(e) => {
                warn!(user = %username, device = %attestation.device.id, error = %e, "activation rejected");
                self.audit.record(
                    AuditEvent::new(
                        username,
                        AuditAction::ActivationRejected {
                            device: attestation.device.id.clone(),
                        },
                    )
                    .by(attestation.signer.as_str())
                    .refused(e.to_string()),
                );
            }
        }
        result
    }

    fn try_activate(&self, attestation: &DeviceAttestation) -> Result<Device, RegistryError> {
        let username = &attestation.username;
        let lock = self.user_lock(username)?;
        let _guard = lock.lock().map_err(poisoned)?;

        let mut record = self
            .store
            .get(username)?
            .ok_or_else(|| RegistryError::UserNotFound(username.clone()))?;
        let signer = record
            .active_device(&attestation.signer)
            .ok_or_else(|| RegistryError::SignerNotActive(attestation.signer.clone()))?;
        attestation.verify(&signer.verifying_key()?)?;

        let device = attestation.device.clone();
        let kid = device.check_consistent()?;
        if record.devices.iter().any(|d| d.id == device.id) {
            return Err(RegistryError::DuplicateDevice(device.kid));
        }
        self.reserve_kids(username, &[(kid, &device)])?;

        record.devices.push(device.clone());
        record.updated_at = Utc::now();
        if let Err(e) = self.store.put(&record) {
            self.release_kids(&[kid]);
            return Err(e);
        }
        Ok(device)
    }

    /// Claim keys for `username` in the index, or fail if any is held by
    /// anyone, active or revoked. Check and claim happen under one write lock
    /// so two users can never register the same key.
    fn reserve_kids(&self, username: &Username, claims: &[(Kid, &Device)]) -> Result<(), RegistryError> {
        let mut index = self.index.write().map_err(poisoned)?;
        for (kid, device) in claims {
            if let Some(owner) = index.get(kid) {
                return Err(if owner.revoked {
                    RegistryError::DeviceRevoked(device.kid.clone())
                } else {
                    RegistryError::DuplicateDevice(device.kid.clone())
                });
            }
        }
        for (kid, device) in claims {
            index.insert(
                *kid,
                KeyOwner {
                    username: username.clone(),
                    device: device.id.clone(),
                    revoked: false,
                },
            );
        }
        Ok(())
    }

    /// Undo `reserve_kids` after a failed store write.
    fn release_kids(&self, kids: &[Kid]) {
        match self.index.write() {
            Ok(mut index) => {
                for kid in kids {
                    index.remove(kid);
                }
            }
            Err(_) => warn!(keys = kids.len(), "index poisoned, reservation not released"),
        }
    }

    /// Revoke a device. Returns `false` if it was already revoked.
    pub fn revoke_device(&self, username: &Username, device: &DeviceId) -> Result<bool, RegistryError> {
        let lock = self.user_lock(username)?;
        let _guard = lock.lock().map_err(poisoned)?;

        let mut record = self
            .store
            .get(username)?
            .ok_or_else(|| RegistryError::UserNotFound(username.clone()))?;
        if record.revoked.iter().any(|d| &d.id == device) {
            debug!(user = %username, device = %device, "already revoked");
            return Ok(false);
        }
        let pos = record
            .devices
            .iter()
            .position(|d| &d.id == device)
            .ok_or_else(|| RegistryError::DeviceNotFound {
                username: username.clone(),
                device: device.clone(),
            })?;

        let removed = record.devices.remove(pos);
        let kid = removed.kid()?;
        record.revoked.push(removed);
        record.updated_at = Utc::now();
        self.store.put(&record)?;

        if let Some(owner) = self.index.write().map_err(poisoned)?.get_mut(&kid) {
            owner.revoked = true;
        }
        info!(user = %username, device = %device, "device revoked");
        self.audit.record(AuditEvent::new(
            username,
            AuditAction::DeviceRevoked { device: device.clone() },
        ));
        Ok(true)
    }
}

fn index_record(index: &mut HashMap<Kid, KeyOwner>, record: &UserRecord) -> Result<(), RegistryError> {
    let active = record.devices.iter().map(|d| (d, false));
    let revoked = record.revoked.iter().map(|d| (d, true));
    for (device, revoked) in active.chain(revoked) {
        index.insert(
            device.kid()?,
            KeyOwner {
                username: record.username.clone(),
                device: device.id.clone(),
                revoked,
            },
        );
    }
    Ok(())
}
