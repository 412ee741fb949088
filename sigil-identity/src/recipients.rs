//! Usernames → device keys.

use std::collections::HashSet;

use sigil_envelope::{Kid, PublicKey};
use tracing::debug;

use crate::error::EncryptError;
use crate::registry::DeviceRegistry;
use crate::types::{DeviceId, DeviceType, Username};

/// One device key to address.
#[derive(Clone, Debug)]
pub struct ResolvedRecipient {
    pub username: Username,
    pub device: DeviceId,
    pub device_type: DeviceType,
    pub key: PublicKey,
    pub kid: Kid,
}

pub struct RecipientKeyResolver<'r> {
    registry: &'r DeviceRegistry,
}

impl<'r> RecipientKeyResolver<'r> {
    pub fn new(registry: &'r DeviceRegistry) -> Self {
        Self { registry }
    }

    /// Every active device of every user in `usernames`, then the sender's own
    /// active devices unless `suppress_self`. Keys are deduplicated, first
    /// occurrence wins, so the order is stable.
    ///
    /// Fails with `UnknownRecipient` before anything else if a requested user
    /// has no active device.
    pub fn resolve(
        &self,
        usernames: &[Username],
        sender: &Username,
        suppress_self: bool,
    ) -> Result<Vec<ResolvedRecipient>, EncryptError> {
        let mut targets: Vec<&Username> = usernames.iter().collect();
        if !suppress_self {
            targets.push(sender);
        }

        let mut per_user = Vec::with_capacity(targets.len());
        for username in targets {
            let devices = self.registry.active_devices(username)?;
            if devices.is_empty() {
                return Err(EncryptError::UnknownRecipient(username.clone()));
            }
            per_user.push((username, devices));
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (username, devices) in per_user {
            for device in devices {
                let key = device.public_key()?;
                let kid = key.kid();
                if !seen.insert(kid) {
                    continue;
                }
                out.push(ResolvedRecipient {
                    username: username.clone(),
                    device: device.id,
                    device_type: device.device_type,
                    key,
                    kid,
                });
            }
        }

        if out.is_empty() {
            return Err(EncryptError::NoRecipients);
        }
        debug!(users = usernames.len(), keys = out.len(), suppress_self, "recipients resolved");
        Ok(out)
    }
}
