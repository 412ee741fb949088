//! # Sigil Identity
//!
//! Multi-device users on top of `sigil-envelope`.
//!
//! Each user owns several devices, each with its own encryption key. Messages
//! are addressed per device, the reader learns at decrypt time how far it
//! trusts the sender, and new devices join only when an existing device
//! vouches for them.
//!
//! ## Quick Start
//!
//! ```rust
//! use sigil_identity::*;
//!
//! let registry = DeviceRegistry::in_memory();
//! let (alice, _paper_key) = Session::signup(&registry, Username::new("alice"), "laptop", DeviceType::Desktop).unwrap();
//! let tracking = TrackingStore::new();
//! let verifier = InMemoryProofVerifier::new();
//! let config = EngineConfig::default();
//! let ctx = Context::new(&alice, &registry, &tracking, &verifier, &config);
//!
//! let mut envelope = Vec::new();
//! encrypt(&ctx, &b"note to self"[..], &mut envelope, &EncryptOptions::default()).unwrap();
//!
//! let mut plaintext = Vec::new();
//! let mut decryptor = Decryptor::new(ctx, DecryptOptions::default());
//! decryptor.run(&envelope[..], &mut plaintext, accept_all).unwrap();
//! assert_eq!(plaintext, b"note to self");
//! assert_eq!(decryptor.state(), DecryptState::PlaintextReady);
//! ```

#![deny(unsafe_code)]

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod provisioning;
pub mod recipients;
pub mod registry;
pub mod session;
pub mod storage;
pub mod trust;
pub mod types;

// Re-export main types for convenience
pub use audit::{AuditAction, AuditEvent, AuditSink, FileAuditSink, InMemoryAuditSink, Outcome, TracingAuditSink};
pub use config::EngineConfig;
pub use engine::{
    accept_all, decrypt, encrypt, reject_broken_tracking, Context, DecryptOptions, DecryptState, Decryptor,
    DeviceSummary, EncryptOptions, MessageInfo, SenderInfo,
};
pub use error::{ConfigError, DecryptError, EncryptError, ProvisioningFailed, RegistryError, VerificationFailure};
pub use provisioning::{rendezvous, Bootstrap, Frame, Provisionee, Provisioner, ProvisioningSecret, RendezvousEnd, SecretHandle};
pub use recipients::{RecipientKeyResolver, ResolvedRecipient};
pub use registry::{DeviceRegistry, KeyOwner};
pub use session::{InMemorySecretSource, LocalKey, SecretSource, Session};
pub use storage::{FileStore, InMemoryStore, RegistryStore};
pub use trust::{
    IdentityProof, InMemoryProofVerifier, ProofState, ProofVerifier, SenderClassification, SenderTrustResolver,
    TrackedProof, TrackingStatement, TrackingStore, TrustOutcome,
};
pub use types::{Device, DeviceAttestation, DeviceId, DeviceType, UserRecord, Username};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
