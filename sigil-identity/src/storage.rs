//! Storage backends for user device records.

use crate::error::RegistryError;
use crate::types::{UserRecord, Username};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Persistent home of `UserRecord`s.
///
/// Writers are serialized per user by the registry, so a backend only has to
/// make a single `put` atomic.
pub trait RegistryStore: Send + Sync {
    fn get(&self, username: &Username) -> Result<Option<UserRecord>, RegistryError>;
    fn put(&self, record: &UserRecord) -> Result<(), RegistryError>;
    fn list(&self) -> Result<Vec<UserRecord>, RegistryError>;
}

fn poisoned<T>(_: T) -> RegistryError {
    RegistryError::Storage("lock poisoned".into())
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory storage (for testing and ephemeral use).
pub struct InMemoryStore {
    users: RwLock<HashMap<Username, UserRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryStore for InMemoryStore {
    fn get(&self, username: &Username) -> Result<Option<UserRecord>, RegistryError> {
        let users = self.users.read().map_err(poisoned)?;
        Ok(users.get(username).cloned())
    }

    fn put(&self, record: &UserRecord) -> Result<(), RegistryError> {
        let mut users = self.users.write().map_err(poisoned)?;
        users.insert(record.username.clone(), record.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<UserRecord>, RegistryError> {
        let users = self.users.read().map_err(poisoned)?;
        Ok(users.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// File-based storage (one JSON file per user).
///
/// ```text
/// users/
///   {hex(username)}.json
/// ```
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| RegistryError::Storage(format!("create dir: {}", e)))?;
        Ok(Self { dir })
    }

    // Hex keeps arbitrary usernames out of path syntax.
    fn user_path(&self, username: &Username) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(username.as_str())))
    }

    fn read_user_file(&self, path: &Path) -> Result<UserRecord, RegistryError> {
        let data = std::fs::read_to_string(path).map_err(|e| RegistryError::Storage(format!("read: {}", e)))?;
        serde_json::from_str(&data).map_err(|e| RegistryError::Storage(format!("parse: {}", e)))
    }
}

impl RegistryStore for FileStore {
    fn get(&self, username: &Username) -> Result<Option<UserRecord>, RegistryError> {
        let path = self.user_path(username);
        if !path.exists() {
            return Ok(None);
        }
        self.read_user_file(&path).map(Some)
    }

    fn put(&self, record: &UserRecord) -> Result<(), RegistryError> {
        let path = self.user_path(&record.username);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| RegistryError::Storage(format!("serialize: {}", e)))?;
        // Atomic write: write to temp, then rename
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &json).map_err(|e| RegistryError::Storage(format!("write: {}", e)))?;
        std::fs::rename(&tmp, &path).map_err(|e| RegistryError::Storage(format!("rename: {}", e)))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<UserRecord>, RegistryError> {
        let mut users = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RegistryError::Storage(format!("readdir: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::Storage(format!("entry: {}", e)))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                users.push(self.read_user_file(&path)?);
            }
        }
        Ok(users)
    }
}
