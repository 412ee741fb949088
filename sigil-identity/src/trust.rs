//! Sender trust: classify a decrypted sender key against the recipient's
//! tracking statements.
//!
//! Rules, first match wins:
//!
//! 1. anonymous sender field → `Anonymous`
//! 2. key not in the registry → `NotTracked`
//! 3. recipient holds no statement for the owner → `NotTracked`
//! 4. all tracked proofs hold → `TrackingOk`, otherwise `TrackingBroke`
//!
//! Step 4 reads the statement's cached results unless they are stale or the
//! caller forces a live check. A live check never holds the statement lock
//! while the verifier runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sigil_envelope::SenderField;
use tracing::{debug, warn};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{DecryptError, VerificationFailure};
use crate::registry::DeviceRegistry;
use crate::types::{DeviceId, Username};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderClassification {
    Anonymous,
    NotTracked,
    TrackingOk,
    TrackingBroke,
}

impl fmt::Display for SenderClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderClassification::Anonymous => write!(f, "anonymous"),
            SenderClassification::NotTracked => write!(f, "not tracked"),
            SenderClassification::TrackingOk => write!(f, "tracking ok"),
            SenderClassification::TrackingBroke => write!(f, "tracking broke"),
        }
    }
}

// ---------------------------------------------------------------------------
// Proofs and statements
// ---------------------------------------------------------------------------

/// A claim that an account on some service belongs to a user.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityProof {
    pub service: String,
    pub handle: String,
}

impl IdentityProof {
    pub fn new(service: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handle: handle.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofState {
    Ok,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackedProof {
    pub proof: IdentityProof,
    pub last_state: ProofState,
    pub last_checked: DateTime<Utc>,
}

/// The tracker's record of what it verified about the trackee.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackingStatement {
    pub tracker: Username,
    pub trackee: Username,
    pub proofs: Vec<TrackedProof>,
    pub created_at: DateTime<Utc>,
    /// When the whole statement was last checked live.
    pub last_verified: DateTime<Utc>,
}

impl TrackingStatement {
    /// A statement is made right after the tracker saw every proof pass.
    pub fn new(tracker: Username, trackee: Username, proofs: Vec<IdentityProof>) -> Self {
        let now = Utc::now();
        Self {
            tracker,
            trackee,
            proofs: proofs
                .into_iter()
                .map(|proof| TrackedProof {
                    proof,
                    last_state: ProofState::Ok,
                    last_checked: now,
                })
                .collect(),
            created_at: now,
            last_verified: now,
        }
    }

    /// Verdict from cached results.
    pub fn verdict(&self) -> SenderClassification {
        if self.proofs.iter().all(|p| p.last_state == ProofState::Ok) {
            SenderClassification::TrackingOk
        } else {
            SenderClassification::TrackingBroke
        }
    }

    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_verified < ttl
    }

    fn apply(&mut self, results: &[(IdentityProof, ProofState)], now: DateTime<Utc>) {
        for (proof, state) in results {
            if let Some(tracked) = self.proofs.iter_mut().find(|t| &t.proof == proof) {
                tracked.last_state = *state;
                tracked.last_checked = now;
            }
        }
        self.last_verified = now;
    }
}

/// Statements by (tracker, trackee). Each statement has its own lock.
#[derive(Default)]
pub struct TrackingStore {
    statements: RwLock<HashMap<(Username, Username), Arc<Mutex<TrackingStatement>>>>,
}

impl TrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, statement: TrackingStatement) {
        let key = (statement.tracker.clone(), statement.trackee.clone());
        self.statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(Mutex::new(statement)));
    }

    pub fn untrack(&self, tracker: &Username, trackee: &Username) -> bool {
        self.statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(tracker.clone(), trackee.clone()))
            .is_some()
    }

    fn entry(&self, tracker: &Username, trackee: &Username) -> Option<Arc<Mutex<TrackingStatement>>> {
        self.statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(tracker.clone(), trackee.clone()))
            .cloned()
    }

    /// Copy of the current statement.
    pub fn snapshot(&self, tracker: &Username, trackee: &Username) -> Option<TrackingStatement> {
        self.entry(tracker, trackee)
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Network collaborator that re-checks a proof. Blocking.
pub trait ProofVerifier: Send + Sync {
    fn check(&self, owner: &Username, proof: &IdentityProof) -> Result<ProofState, VerificationFailure>;
}

/// Proofs held in memory; anything not set reads as `Failed`.
#[derive(Default)]
pub struct InMemoryProofVerifier {
    live: RwLock<HashMap<(Username, IdentityProof), ProofState>>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryProofVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_proof(&self, owner: &Username, proof: IdentityProof) {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((owner.clone(), proof), ProofState::Ok);
    }

    pub fn remove_proof(&self, owner: &Username, proof: &IdentityProof) {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(owner.clone(), proof.clone()));
    }

    /// Simulate the service being down.
    pub fn set_unreachable(&self, down: bool) {
        self.unreachable.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProofVerifier for InMemoryProofVerifier {
    fn check(&self, owner: &Username, proof: &IdentityProof) -> Result<ProofState, VerificationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(VerificationFailure {
                service: proof.service.clone(),
                handle: proof.handle.clone(),
                reason: "service unreachable".into(),
            });
        }
        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        Ok(live
            .get(&(owner.clone(), proof.clone()))
            .copied()
            .unwrap_or(ProofState::Failed))
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Classification plus whatever identity it resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustOutcome {
    pub classification: SenderClassification,
    pub username: Option<Username>,
    pub device: Option<DeviceId>,
}

impl TrustOutcome {
    fn unresolved(classification: SenderClassification) -> Self {
        Self {
            classification,
            username: None,
            device: None,
        }
    }
}

pub struct SenderTrustResolver<'a> {
    registry: &'a DeviceRegistry,
    tracking: &'a TrackingStore,
    verifier: &'a dyn ProofVerifier,
    cache_ttl: Duration,
    audit: Option<&'a dyn AuditSink>,
}

impl<'a> SenderTrustResolver<'a> {
    pub fn new(
        registry: &'a DeviceRegistry,
        tracking: &'a TrackingStore,
        verifier: &'a dyn ProofVerifier,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            tracking,
            verifier,
            cache_ttl,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: &'a dyn AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn classify(
        &self,
        sender: &SenderField,
        recipient: &Username,
        force_remote_check: bool,
    ) -> Result<TrustOutcome, DecryptError> {
        let Some(key) = sender.key() else {
            return Ok(TrustOutcome::unresolved(SenderClassification::Anonymous));
        };
        let Some(owner) = self.registry.owner_of_kid(&key.kid())? else {
            return Ok(TrustOutcome::unresolved(SenderClassification::NotTracked));
        };
        let resolved = |classification| TrustOutcome {
            classification,
            username: Some(owner.username.clone()),
            device: Some(owner.device.clone()),
        };

        let Some(entry) = self.tracking.entry(recipient, &owner.username) else {
            return Ok(resolved(SenderClassification::NotTracked));
        };

        let now = Utc::now();
        let (proofs, cached, fresh) = {
            let statement = entry.lock().unwrap_or_else(PoisonError::into_inner);
            let proofs: Vec<IdentityProof> = statement.proofs.iter().map(|p| p.proof.clone()).collect();
            (proofs, statement.verdict(), statement.is_fresh(self.cache_ttl, now))
        };

        if fresh && !force_remote_check {
            debug!(trackee = %owner.username, verdict = %cached, "cached tracking verdict");
            return Ok(resolved(cached));
        }

        let results = match self.check_all(&owner.username, &proofs) {
            Ok(results) => results,
            Err(failure) if !force_remote_check => {
                warn!(trackee = %owner.username, error = %failure, "live proof check failed, using cached verdict");
                return Ok(resolved(cached));
            }
            Err(failure) => return Err(failure.into()),
        };

        let verdict = {
            let mut statement = entry.lock().unwrap_or_else(PoisonError::into_inner);
            statement.apply(&results, Utc::now());
            statement.verdict()
        };
        debug!(trackee = %owner.username, verdict = %verdict, forced = force_remote_check, "live tracking verdict");
        if let Some(audit) = self.audit {
            audit.record(
                AuditEvent::new(
                    recipient,
                    AuditAction::TrackingRefreshed {
                        trackee: owner.username.clone(),
                        broken: verdict == SenderClassification::TrackingBroke,
                    },
                )
                .by(recipient.as_str()),
            );
        }
        Ok(resolved(verdict))
    }

    fn check_all(
        &self,
        owner: &Username,
        proofs: &[IdentityProof],
    ) -> Result<Vec<(IdentityProof, ProofState)>, VerificationFailure> {
        proofs
            .iter()
            .map(|p| self.verifier.check(owner, p).map(|state| (p.clone(), state)))
            .collect()
    }
}
