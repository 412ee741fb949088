//! Public encrypt/decrypt operations.
//!
//! Decryption runs a small state machine:
//!
//! ```text
//! Start → HeaderParsed ─┬→ FormatMismatch                       (error)
//!                       └→ RecipientSearch ─┬→ NoDecryptionKey   (error)
//!                                           └→ KeyFound → SenderClassified ─┬→ PolicyRejected (error)
//!                                                                           └→ PlaintextReady
//! ```
//!
//! The format tag is checked as part of reading the header, before any key
//! is loaded.

use std::io::{Read, Write};

use sigil_envelope::{seal, EnvelopeError, Kid, Opener, PublicKey, SealOptions, SecretKey, SenderField, SenderMode};
use tracing::{debug, info};

use crate::audit::AuditSink;
use crate::config::EngineConfig;
use crate::error::{DecryptError, EncryptError};
use crate::recipients::RecipientKeyResolver;
use crate::registry::DeviceRegistry;
use crate::session::Session;
use crate::trust::{ProofVerifier, SenderClassification, SenderTrustResolver, TrackingStore};
use crate::types::{DeviceId, DeviceType, Username};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything an operation needs, passed explicitly.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub session: &'a Session,
    pub registry: &'a DeviceRegistry,
    pub tracking: &'a TrackingStore,
    pub verifier: &'a dyn ProofVerifier,
    pub config: &'a EngineConfig,
    pub audit: Option<&'a dyn AuditSink>,
}

impl<'a> Context<'a> {
    pub fn new(
        session: &'a Session,
        registry: &'a DeviceRegistry,
        tracking: &'a TrackingStore,
        verifier: &'a dyn ProofVerifier,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            session,
            registry,
            tracking,
            verifier,
            config,
            audit: None,
        }
    }

    /// Record live trust refreshes to `audit`.
    pub fn with_audit(mut self, audit: &'a dyn AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }
}

// ---------------------------------------------------------------------------
// Encrypt
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptOptions {
    pub recipients: Vec<Username>,
    /// Leave the sender's own devices out of the recipient set.
    pub suppress_self_encryption: bool,
    /// Put the anonymous placeholder in the sender field.
    pub hide_sender: bool,
    /// Write the anonymous marker instead of key ids in every slot.
    pub hide_recipients: bool,
    /// Raw framing instead of armor.
    pub binary: bool,
}

/// Encrypt `source` for every active device of `opts.recipients` (and the
/// sender's own devices unless suppressed). Returns the plaintext length.
pub fn encrypt<R: Read, W: Write>(
    ctx: &Context<'_>,
    source: R,
    sink: W,
    opts: &EncryptOptions,
) -> Result<u64, EncryptError> {
    let recipients = RecipientKeyResolver::new(ctx.registry).resolve(
        &opts.recipients,
        ctx.session.username(),
        opts.suppress_self_encryption,
    )?;
    let keys: Vec<PublicKey> = recipients.iter().map(|r| r.key.clone()).collect();

    let current = ctx.session.current();
    let public = current.public_key();
    let sender = if opts.hide_sender {
        SenderMode::Anonymous
    } else {
        SenderMode::Identified {
            public: &public,
            secret: current.secret(),
        }
    };
    let seal_opts = SealOptions {
        hide_recipients: opts.hide_recipients,
        chunk_size: ctx.config.chunk_size,
        armor: ctx.config.armor && !opts.binary,
    };

    let written = seal(source, sink, &keys, sender, &seal_opts)?;
    info!(
        user = %ctx.session.username(),
        keys = keys.len(),
        hide_sender = opts.hide_sender,
        bytes = written,
        "message encrypted"
    );
    Ok(written)
}

// ---------------------------------------------------------------------------
// Decrypt
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecryptOptions {
    /// Re-verify the sender's proofs now instead of trusting the cache.
    pub force_remote_check: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecryptState {
    Start,
    HeaderParsed,
    FormatMismatch,
    RecipientSearch,
    NoDecryptionKey,
    KeyFound,
    SenderClassified,
    PolicyRejected,
    PlaintextReady,
    /// Stopped on an error none of the other terminals describe: a truncated
    /// or malformed envelope, a failed chunk, I/O, or the registry.
    Failed,
}

impl DecryptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DecryptState::FormatMismatch
                | DecryptState::NoDecryptionKey
                | DecryptState::PolicyRejected
                | DecryptState::PlaintextReady
                | DecryptState::Failed
        )
    }
}

/// One of the reader's devices the message was addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub encrypt_key: Kid,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageInfo {
    /// `None` until a slot has been opened.
    pub sender: Option<SenderField>,
    /// The reader's devices named in the header, minus the one that decrypted.
    pub devices: Vec<DeviceSummary>,
}

/// What the policy callback gets to see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderInfo {
    pub classification: SenderClassification,
    pub username: Option<Username>,
    pub device: Option<DeviceId>,
    /// `None` for hidden senders.
    pub kid: Option<Kid>,
}

/// Accept every sender.
pub fn accept_all(_: &SenderInfo) -> Result<(), DecryptError> {
    Ok(())
}

/// Refuse senders whose proofs used to hold and no longer do.
pub fn reject_broken_tracking(sender: &SenderInfo) -> Result<(), DecryptError> {
    match sender.classification {
        SenderClassification::TrackingBroke => Err(DecryptError::PolicyRejected {
            classification: sender.classification,
        }),
        _ => Ok(()),
    }
}

pub struct Decryptor<'a> {
    ctx: Context<'a>,
    opts: DecryptOptions,
    state: DecryptState,
    info: MessageInfo,
}

impl<'a> Decryptor<'a> {
    pub fn new(ctx: Context<'a>, opts: DecryptOptions) -> Self {
        Self {
            ctx,
            opts,
            state: DecryptState::Start,
            info: MessageInfo::default(),
        }
    }

    pub fn state(&self) -> DecryptState {
        self.state
    }

    /// Info gathered by the last run, whether it succeeded or not.
    pub fn message_info(&self) -> &MessageInfo {
        &self.info
    }

    fn enter(&mut self, state: DecryptState) {
        debug!(from = ?self.state, to = ?state, "decrypt state");
        self.state = state;
    }

    fn fail<E: From<DecryptError>>(&mut self, e: impl Into<DecryptError>) -> E {
        self.enter(DecryptState::Failed);
        E::from(e.into())
    }

    /// Decrypt `source` into `sink`.
    ///
    /// `policy` runs after the sender is classified and before any plaintext
    /// is written. Its error is returned exactly as produced; internal
    /// failures are converted with `E::from`.
    pub fn run<R, W, P, E>(&mut self, source: R, sink: W, policy: P) -> Result<MessageInfo, E>
    where
        R: Read,
        W: Write,
        P: FnOnce(&SenderInfo) -> Result<(), E>,
        E: From<DecryptError>,
    {
        self.state = DecryptState::Start;
        self.info = MessageInfo::default();

        let opener = match Opener::begin(source, "decrypt") {
            Ok(opener) => opener,
            Err(EnvelopeError::FormatMismatch(mismatch)) => {
                self.enter(DecryptState::HeaderParsed);
                self.enter(DecryptState::FormatMismatch);
                return Err(DecryptError::FormatMismatch(mismatch).into());
            }
            Err(e) => return Err(self.fail(e)),
        };
        self.enter(DecryptState::HeaderParsed);

        self.info.devices = match self.addressed_devices(&opener) {
            Ok(devices) => devices,
            Err(e) => return Err(self.fail(e)),
        };
        self.enter(DecryptState::RecipientSearch);

        let keys = self.ctx.session.keys();
        let candidates: Vec<&SecretKey> = keys.iter().map(|k| k.secret()).collect();
        let unlocked = match opener.unlock(&candidates) {
            Ok(unlocked) => unlocked,
            Err(EnvelopeError::NoMatchingKey) => {
                self.enter(DecryptState::NoDecryptionKey);
                return Err(DecryptError::NoDecryptionKey { info: self.info.clone() }.into());
            }
            Err(e) => return Err(self.fail(e)),
        };
        let opened_with = keys[unlocked.candidate_index].kid();
        self.info.devices.retain(|d| d.encrypt_key != opened_with);
        self.info.sender = Some(unlocked.sender.clone());
        self.enter(DecryptState::KeyFound);

        let mut resolver = SenderTrustResolver::new(
            self.ctx.registry,
            self.ctx.tracking,
            self.ctx.verifier,
            self.ctx.config.trust_cache_ttl(),
        );
        if let Some(audit) = self.ctx.audit {
            resolver = resolver.with_audit(audit);
        }
        let outcome = match resolver.classify(&unlocked.sender, self.ctx.session.username(), self.opts.force_remote_check) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(e)),
        };
        let sender = SenderInfo {
            classification: outcome.classification,
            username: outcome.username,
            device: outcome.device,
            kid: unlocked.sender.key().map(PublicKey::kid),
        };
        self.enter(DecryptState::SenderClassified);

        if let Err(e) = policy(&sender) {
            self.enter(DecryptState::PolicyRejected);
            return Err(e);
        }

        let written = match opener.stream(&unlocked, sink) {
            Ok(written) => written,
            Err(e) => return Err(self.fail(e)),
        };
        self.enter(DecryptState::PlaintextReady);
        info!(
            user = %self.ctx.session.username(),
            classification = %sender.classification,
            bytes = written,
            "message decrypted"
        );
        Ok(self.info.clone())
    }

    fn addressed_devices(&self, opener: &Opener<'_>) -> Result<Vec<DeviceSummary>, DecryptError> {
        let me = self.ctx.session.username();
        let mut out = Vec::new();
        for kid in opener.recipient_kids() {
            if let Some(device) = self.ctx.registry.device_by_kid(me, kid)? {
                out.push(DeviceSummary {
                    id: device.id,
                    device_type: device.device_type,
                    encrypt_key: *kid,
                });
            }
        }
        Ok(out)
    }
}

/// One-shot decrypt with the default error type.
pub fn decrypt<R: Read, W: Write>(
    ctx: Context<'_>,
    source: R,
    sink: W,
    opts: DecryptOptions,
    policy: impl FnOnce(&SenderInfo) -> Result<(), DecryptError>,
) -> Result<MessageInfo, DecryptError> {
    Decryptor::new(ctx, opts).run(source, sink, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::InMemoryProofVerifier;

    #[test]
    fn builtin_policies() {
        let mut sender = SenderInfo {
            classification: SenderClassification::TrackingOk,
            username: None,
            device: None,
            kid: None,
        };
        assert!(accept_all(&sender).is_ok());
        assert!(reject_broken_tracking(&sender).is_ok());
        sender.classification = SenderClassification::TrackingBroke;
        assert!(matches!(
            reject_broken_tracking(&sender),
            Err(DecryptError::PolicyRejected {
                classification: SenderClassification::TrackingBroke
            })
        ));
    }

    #[test]
    fn states_walk_to_plaintext() {
        let registry = DeviceRegistry::in_memory();
        let (session, _) = Session::signup(&registry, Username::new("ann"), "laptop", DeviceType::Desktop).unwrap();
        let tracking = TrackingStore::new();
        let verifier = InMemoryProofVerifier::new();
        let config = EngineConfig::default();
        let ctx = Context::new(&session, &registry, &tracking, &verifier, &config);

        let mut env = Vec::new();
        encrypt(&ctx, &b"hi"[..], &mut env, &EncryptOptions::default()).unwrap();

        let mut d = Decryptor::new(ctx, DecryptOptions::default());
        assert_eq!(d.state(), DecryptState::Start);
        let mut out = Vec::new();
        let info = d.run(&env[..], &mut out, accept_all).unwrap();
        assert_eq!(out, b"hi");
        assert_eq!(d.state(), DecryptState::PlaintextReady);
        assert!(d.state().is_terminal());
        // laptop opened it; the backup key is still listed
        assert_eq!(info.devices.len(), 1);
        assert_eq!(info.devices[0].device_type, DeviceType::Backup);
        assert_eq!(d.message_info(), &info);
    }

    #[test]
    fn garbage_is_a_format_mismatch() {
        let registry = DeviceRegistry::in_memory();
        let (session, _) = Session::signup(&registry, Username::new("ann"), "laptop", DeviceType::Desktop).unwrap();
        let tracking = TrackingStore::new();
        let verifier = InMemoryProofVerifier::new();
        let config = EngineConfig::default();
        let ctx = Context::new(&session, &registry, &tracking, &verifier, &config);

        let mut d = Decryptor::new(ctx, DecryptOptions::default());
        let err = d.run(&b"hello there"[..], Vec::new(), accept_all).unwrap_err();
        assert!(matches!(err, DecryptError::FormatMismatch(_)));
        assert_eq!(d.state(), DecryptState::FormatMismatch);
    }

    #[test]
    fn broken_envelopes_end_in_failed() {
        let registry = DeviceRegistry::in_memory();
        let (session, _) = Session::signup(&registry, Username::new("ann"), "laptop", DeviceType::Desktop).unwrap();
        let tracking = TrackingStore::new();
        let verifier = InMemoryProofVerifier::new();
        let config = EngineConfig::default();
        let ctx = Context::new(&session, &registry, &tracking, &verifier, &config);

        let opts = EncryptOptions {
            binary: true,
            ..EncryptOptions::default()
        };
        let mut envelope = Vec::new();
        encrypt(&ctx, &b"cut short"[..], &mut envelope, &opts).unwrap();

        // header cut off
        let mut d = Decryptor::new(ctx, DecryptOptions::default());
        let err = d.run(&envelope[..20], Vec::new(), accept_all).unwrap_err();
        assert!(!matches!(err, DecryptError::FormatMismatch(_) | DecryptError::NoDecryptionKey { .. }));
        assert_eq!(d.state(), DecryptState::Failed);
        assert!(d.state().is_terminal());

        // last chunk cut off
        let mut d = Decryptor::new(ctx, DecryptOptions::default());
        assert!(d.run(&envelope[..envelope.len() - 4], Vec::new(), accept_all).is_err());
        assert_eq!(d.state(), DecryptState::Failed);
    }
}
