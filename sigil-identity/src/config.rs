//! Engine configuration.
//!
//! ```json
//! { "chunk_size": 65536, "armor": true, "provisioning_timeout_secs": 60 }
//! ```
//!
//! Missing fields take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sigil_envelope::wire::{DEFAULT_CHUNK_BYTES, MAX_CHUNK_BYTES};

use crate::error::ConfigError;

const DEFAULT_PROVISIONING_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RENDEZVOUS_CAPACITY: usize = 4;
const DEFAULT_TRUST_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Plaintext bytes per envelope chunk.
    pub chunk_size: usize,
    /// Armor envelopes unless the caller asks for binary.
    pub armor: bool,
    /// Deadline for either provisioning party.
    pub provisioning_timeout_secs: u64,
    /// Frames buffered per rendezvous direction.
    pub rendezvous_capacity: usize,
    /// How long cached proof results count as fresh.
    pub trust_cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_BYTES,
            armor: true,
            provisioning_timeout_secs: DEFAULT_PROVISIONING_TIMEOUT_SECS,
            rendezvous_capacity: DEFAULT_RENDEZVOUS_CAPACITY,
            trust_cache_ttl_secs: DEFAULT_TRUST_CACHE_TTL_SECS,
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "chunk_size",
                reason: format!("must be between 1 and {}", MAX_CHUNK_BYTES),
            });
        }
        if self.provisioning_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "provisioning_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.rendezvous_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rendezvous_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn trust_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.trust_cache_ttl_secs.min(i64::MAX as u64 / 1000) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "chunk_size": 1024, "armor": false }"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert!(!config.armor);
        assert_eq!(config.provisioning_timeout_secs, DEFAULT_PROVISIONING_TIMEOUT_SECS);
    }

    #[test]
    fn rejects_oversized_chunks() {
        let config = EngineConfig {
            chunk_size: MAX_CHUNK_BYTES + 1,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { field: "chunk_size", .. })));
    }

    #[test]
    fn rejects_zero_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "provisioning_timeout_secs": 0 }"#).unwrap();
        assert!(EngineConfig::from_json_file(&path).is_err());
    }
}
