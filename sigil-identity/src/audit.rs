//! Audit trail for registry writes and trust refreshes.
//!
//! Events are plain data; where they end up is the [`AuditSink`]'s business.
//! Sinks never fail the operation being audited: a sink that cannot write
//! logs a warning and drops the event.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, DeviceType, Username};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditAction {
    UserRegistered { device_count: usize },
    DeviceActivated { device: DeviceId, device_type: DeviceType, signer: DeviceId },
    ActivationRejected { device: DeviceId },
    DeviceRevoked { device: DeviceId },
    TrackingRefreshed { trackee: Username, broken: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Refused { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    /// The user whose records were read or written.
    pub username: Username,
    pub action: AuditAction,
    /// Device or user that caused the event, when it was not the subject.
    pub by: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl AuditEvent {
    pub fn new(username: &Username, action: AuditAction) -> Self {
        Self {
            at: Utc::now(),
            username: username.clone(),
            action,
            by: None,
            outcome: Outcome::Applied,
        }
    }

    pub fn by(mut self, who: impl Into<String>) -> Self {
        self.by = Some(who.into());
        self
    }

    pub fn refused(mut self, reason: impl Into<String>) -> Self {
        self.outcome = Outcome::Refused { reason: reason.into() };
        self
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Applied
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits each event as an `info` (or `warn`, when refused) tracing record.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match &event.outcome {
            Outcome::Applied => tracing::info!(
                target: "sigil::audit",
                user = %event.username,
                action = ?event.action,
                by = ?event.by,
                "applied"
            ),
            Outcome::Refused { reason } => tracing::warn!(
                target: "sigil::audit",
                user = %event.username,
                action = ?event.action,
                by = ?event.by,
                reason = %reason,
                "refused"
            ),
        }
    }
}

/// Keeps every event; mostly useful in tests.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn events_for(&self, username: &Username) -> Vec<AuditEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().filter(|e| &e.username == username).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Appends one JSON object per line.
pub struct FileAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAuditSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unserializable audit event");
                return;
            }
        };
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(&line) {
            tracing::warn!(path = %self.path.display(), error = %e, "audit append failed");
        }
    }
}
