//! Device provisioning: an existing device (provisioner) vouches for a new
//! one (provisionee) after both prove knowledge of the same one-time secret.
//!
//! ```text
//! provisionee                              provisioner
//!     │── Hello{device} ─────────────────────→│  opens with a known secret
//!     │←──────── Activation{attestation, ..} ─│  or Reject on mismatch
//!  activate_device
//!     │── Done{device} ──────────────────────→│
//! ```
//!
//! Every frame after the first is sealed under a key derived from the secret,
//! so the secret is the only authenticator. Both sides stop at a shared
//! deadline; the provisionee's key reaches the registry only through its one
//! `activate_device` call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sigil_envelope::{aead_open, aead_seal};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::EngineConfig;
use crate::error::ProvisioningFailed;
use crate::registry::DeviceRegistry;
use crate::session::{new_token, LocalKey, Session};
use crate::types::{Device, DeviceAttestation, DeviceId, DeviceType, Username};

const CHANNEL_INFO: &[u8] = b"sigil-provision-v1|channel";
const FRAME_AAD: &[u8] = b"sigil-provision-v1";
const SECRET_BYTES: usize = 32;

const TO_PROVISIONER: u8 = 1;
const TO_PROVISIONEE: u8 = 2;

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// One-time pairing secret, shown on one device and typed into the other.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProvisioningSecret([u8; SECRET_BYTES]);

impl ProvisioningSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_BYTES];
        rand_core::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SECRET_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = Zeroizing::new(hex::decode(s.trim()).ok()?);
        let bytes: [u8; SECRET_BYTES] = raw.as_slice().try_into().ok()?;
        Some(Self(bytes))
    }

    fn channel_key(&self) -> Result<Zeroizing<[u8; 32]>, ProvisioningFailed> {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(CHANNEL_INFO, okm.as_mut_slice())
            .map_err(|_| ProvisioningFailed::Transport("channel key derivation".into()))?;
        Ok(okm)
    }
}

impl fmt::Debug for ProvisioningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProvisioningSecret(..)")
    }
}

// ---------------------------------------------------------------------------
// Frames and the secret-keyed channel
// ---------------------------------------------------------------------------

/// What travels over the rendezvous.
#[derive(Debug)]
pub enum Frame {
    Sealed { seq: u64, body: Vec<u8> },
    /// Plaintext: the provisioner could not open the hello with any secret.
    Reject,
}

/// Session material the provisionee needs to start as a logged-in device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bootstrap {
    pub username: Username,
    pub session_token: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ProvisionMessage {
    Hello { device: Device },
    Activation { attestation: DeviceAttestation, bootstrap: Bootstrap },
    Done { device: DeviceId },
}

struct Channel {
    key: Zeroizing<[u8; 32]>,
    send_dir: u8,
    recv_dir: u8,
    next_send: u64,
    next_recv: u64,
}

impl Channel {
    fn new(secret: &ProvisioningSecret, send_dir: u8, recv_dir: u8) -> Result<Self, ProvisioningFailed> {
        Ok(Self {
            key: secret.channel_key()?,
            send_dir,
            recv_dir,
            next_send: 0,
            next_recv: 0,
        })
    }

    fn nonce(direction: u8, seq: u64) -> [u8; 12] {
        let mut n = [0u8; 12];
        n[0] = direction;
        n[4..].copy_from_slice(&seq.to_be_bytes());
        n
    }

    fn seal(&mut self, msg: &ProvisionMessage) -> Result<Frame, ProvisioningFailed> {
        let body = Zeroizing::new(serde_json::to_vec(msg).map_err(|e| ProvisioningFailed::Transport(e.to_string()))?);
        let seq = self.next_send;
        let sealed = aead_seal(&self.key, &Self::nonce(self.send_dir, seq), &body, FRAME_AAD)
            .map_err(|_| ProvisioningFailed::Transport("frame seal failed".into()))?;
        self.next_send += 1;
        Ok(Frame::Sealed { seq, body: sealed })
    }

    /// `None` if the frame is out of order or was sealed under another secret.
    fn open(&mut self, seq: u64, body: &[u8]) -> Option<ProvisionMessage> {
        if seq != self.next_recv {
            return None;
        }
        let plain = Zeroizing::new(aead_open(&self.key, &Self::nonce(self.recv_dir, seq), body, FRAME_AAD).ok()?);
        let msg = serde_json::from_slice(&plain).ok()?;
        self.next_recv += 1;
        Some(msg)
    }
}

// ---------------------------------------------------------------------------
// Rendezvous
// ---------------------------------------------------------------------------

/// One side of a rendezvous.
pub struct RendezvousEnd {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl RendezvousEnd {
    pub fn new(tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Frame>) -> Self {
        Self { tx, rx }
    }

    async fn send(&self, frame: Frame) -> Result<(), ProvisioningFailed> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ProvisioningFailed::Transport("rendezvous closed".into()))
    }
}

/// In-process rendezvous: two bounded channels, one per direction.
pub fn rendezvous(capacity: usize) -> (RendezvousEnd, RendezvousEnd) {
    let capacity = capacity.max(1);
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (RendezvousEnd::new(a_tx, a_rx), RendezvousEnd::new(b_tx, b_rx))
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// Hands secrets to a provisioner that may already be waiting.
#[derive(Clone)]
pub struct SecretHandle {
    tx: mpsc::Sender<ProvisioningSecret>,
}

impl SecretHandle {
    /// Never blocks; fails if the provisioner is gone or its queue is full.
    pub fn add_secret(&self, secret: ProvisioningSecret) -> Result<(), ProvisioningFailed> {
        self.tx.try_send(secret).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProvisioningFailed::Transport("secret queue full".into()),
            mpsc::error::TrySendError::Closed(_) => ProvisioningFailed::Transport("provisioner finished".into()),
        })
    }
}

pub struct Provisioner {
    registry: Arc<DeviceRegistry>,
    session: Arc<Session>,
    own_secret: Option<ProvisioningSecret>,
    secrets_tx: mpsc::Sender<ProvisioningSecret>,
    secrets_rx: mpsc::Receiver<ProvisioningSecret>,
    timeout: Duration,
}

impl Provisioner {
    /// `own_secret` is the secret this device displays, if any. More can be
    /// supplied later through `secret_handle`.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        session: Arc<Session>,
        own_secret: Option<ProvisioningSecret>,
        config: &EngineConfig,
    ) -> Self {
        let (secrets_tx, secrets_rx) = mpsc::channel(config.rendezvous_capacity.max(1));
        Self {
            registry,
            session,
            own_secret,
            secrets_tx,
            secrets_rx,
            timeout: config.provisioning_timeout(),
        }
    }

    pub fn secret_handle(&self) -> SecretHandle {
        SecretHandle {
            tx: self.secrets_tx.clone(),
        }
    }

    /// Wait for a provisionee, attest its device and hand it a session.
    ///
    /// A hello that only fails the provisioner's own secret is held until a
    /// secret arrives through the handle. Once a handle secret is known, a
    /// hello it does not open is rejected, and so is a held hello when the
    /// deadline passes.
    ///
    /// Once the activation is out, the registry has the last word: if the
    /// provisionee's `Done` never arrives in time, the device counts as
    /// provisioned exactly when it is active in the registry.
    pub async fn run(self, mut end: RendezvousEnd) -> Result<Device, ProvisioningFailed> {
        let Provisioner {
            registry,
            session,
            own_secret,
            secrets_tx: _secrets_tx,
            mut secrets_rx,
            timeout,
        } = self;
        let deadline = sleep_until(Instant::now() + timeout);
        tokio::pin!(deadline);

        let mut secrets: Vec<ProvisioningSecret> = own_secret.into_iter().collect();
        let mut pending: Option<(u64, Vec<u8>)> = None;
        let mut supplied = false;
        debug!(user = %session.username(), known_secrets = secrets.len(), "provisioner waiting");

        let (mut channel, device) = loop {
            tokio::select! {
                frame = end.rx.recv() => match frame {
                    None => return Err(ProvisioningFailed::Transport("rendezvous closed".into())),
                    Some(Frame::Reject) => return Err(ProvisioningFailed::SecretMismatch),
                    Some(Frame::Sealed { seq, body }) => {
                        if let Some(found) = open_hello(&secrets, seq, &body)? {
                            break found;
                        }
                        if supplied {
                            warn!(user = %session.username(), "provisioning secret mismatch");
                            let _ = end.send(Frame::Reject).await;
                            return Err(ProvisioningFailed::SecretMismatch);
                        }
                        debug!("hello does not match a known secret yet");
                        pending = Some((seq, body));
                    }
                },
                Some(secret) = secrets_rx.recv() => {
                    debug!("provisioning secret supplied");
                    supplied = true;
                    secrets.push(secret);
                    if let Some((seq, body)) = &pending {
                        match open_hello(&secrets[secrets.len() - 1..], *seq, body)? {
                            Some(found) => break found,
                            None => {
                                warn!(user = %session.username(), "provisioning secret mismatch");
                                let _ = end.send(Frame::Reject).await;
                                return Err(ProvisioningFailed::SecretMismatch);
                            }
                        }
                    }
                }
                _ = &mut deadline => {
                    if pending.is_none() {
                        return Err(ProvisioningFailed::Timeout);
                    }
                    warn!(user = %session.username(), "no secret opened the held hello");
                    // best effort; the provisionee also has a deadline
                    let _ = end.tx.try_send(Frame::Reject);
                    return Err(ProvisioningFailed::SecretMismatch);
                }
            }
        };

        let signer = session.current();
        let attestation = DeviceAttestation::sign(
            session.username().clone(),
            device.clone(),
            signer.device.id.clone(),
            signer.signing_key(),
        );
        let bootstrap = Bootstrap {
            username: session.username().clone(),
            session_token: new_token(),
            issued_at: Utc::now(),
        };
        let activation = channel.seal(&ProvisionMessage::Activation { attestation, bootstrap })?;
        end.send(activation).await?;
        info!(user = %session.username(), device = %device.id, kind = %device.device_type, "device attested");

        loop {
            tokio::select! {
                frame = end.rx.recv() => match frame {
                    None => {
                        let gone = ProvisioningFailed::Transport("provisionee went away".into());
                        return settle(&registry, session.username(), device, gone);
                    }
                    Some(Frame::Reject) => return Err(ProvisioningFailed::SecretMismatch),
                    Some(Frame::Sealed { seq, body }) => match channel.open(seq, &body) {
                        Some(ProvisionMessage::Done { device: id }) if id == device.id => {
                            info!(user = %session.username(), device = %device.id, "provisioning complete");
                            return Ok(device);
                        }
                        _ => return Err(ProvisioningFailed::Transport("unexpected frame".into())),
                    },
                },
                _ = &mut deadline => return settle(&registry, session.username(), device, ProvisioningFailed::Timeout),
            }
        }
    }
}

/// Decide the outcome without a `Done`: succeed only if the device is active.
fn settle(
    registry: &DeviceRegistry,
    username: &Username,
    device: Device,
    otherwise: ProvisioningFailed,
) -> Result<Device, ProvisioningFailed> {
    let active = registry
        .active_devices(username)?
        .into_iter()
        .find(|d| d.id == device.id && d.kid == device.kid);
    match active {
        Some(device) => {
            info!(user = %username, device = %device.id, "provisioning complete without confirmation");
            Ok(device)
        }
        None => Err(otherwise),
    }
}

/// Try each secret against a hello frame.
fn open_hello(
    secrets: &[ProvisioningSecret],
    seq: u64,
    body: &[u8],
) -> Result<Option<(Channel, Device)>, ProvisioningFailed> {
    for secret in secrets {
        let mut channel = Channel::new(secret, TO_PROVISIONEE, TO_PROVISIONER)?;
        match channel.open(seq, body) {
            Some(ProvisionMessage::Hello { device }) => return Ok(Some((channel, device))),
            Some(_) => return Err(ProvisioningFailed::Transport("expected hello".into())),
            None => continue,
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Provisionee
// ---------------------------------------------------------------------------

pub struct Provisionee {
    registry: Arc<DeviceRegistry>,
    key: LocalKey,
    secret: ProvisioningSecret,
    timeout: Duration,
}

impl Provisionee {
    /// Generates the new device's keys up front.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        secret: ProvisioningSecret,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            key: LocalKey::generate(device_name, device_type),
            secret,
            timeout: config.provisioning_timeout(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.key.device
    }

    /// Present the device, wait for the attestation, activate, and return the
    /// new session.
    pub async fn run(self, mut end: RendezvousEnd) -> Result<Session, ProvisioningFailed> {
        let deadline = Instant::now() + self.timeout;
        let mut channel = Channel::new(&self.secret, TO_PROVISIONER, TO_PROVISIONEE)?;

        let hello = channel.seal(&ProvisionMessage::Hello {
            device: self.key.device.clone(),
        })?;
        timeout_at(deadline, end.send(hello))
            .await
            .map_err(|_| ProvisioningFailed::Timeout)??;
        debug!(device = %self.key.device.id, "hello sent");

        let (attestation, bootstrap) = match timeout_at(deadline, end.rx.recv()).await {
            // a reject may have landed on the same tick as the deadline
            Err(_) => match end.rx.try_recv() {
                Ok(Frame::Reject) => return Err(ProvisioningFailed::SecretMismatch),
                _ => return Err(ProvisioningFailed::Timeout),
            },
            Ok(None) => return Err(ProvisioningFailed::Transport("rendezvous closed".into())),
            Ok(Some(Frame::Reject)) => return Err(ProvisioningFailed::SecretMismatch),
            Ok(Some(Frame::Sealed { seq, body })) => match channel.open(seq, &body) {
                Some(ProvisionMessage::Activation { attestation, bootstrap }) => (attestation, bootstrap),
                Some(_) => return Err(ProvisioningFailed::Transport("unexpected frame".into())),
                None => return Err(ProvisioningFailed::SecretMismatch),
            },
        };
        if attestation.device != self.key.device || attestation.username != bootstrap.username {
            return Err(ProvisioningFailed::Transport("attestation is for another device".into()));
        }

        // past the deadline the provisioner may already have settled as failed
        if Instant::now() >= deadline {
            return Err(ProvisioningFailed::Timeout);
        }
        let device = self.registry.activate_device(&attestation)?;

        // The device is active from here on; the provisioner reads the
        // registry if the confirmation is lost or late.
        match channel.seal(&ProvisionMessage::Done { device: device.id.clone() }) {
            Ok(done) => match timeout_at(deadline, end.send(done)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(device = %device.id, error = %e, "could not confirm activation"),
                Err(_) => warn!(device = %device.id, "confirmation timed out"),
            },
            Err(e) => warn!(device = %device.id, error = %e, "could not confirm activation"),
        }
        info!(user = %bootstrap.username, device = %device.id, "device provisioned");
        Ok(Session::new(bootstrap.username, self.key, bootstrap.session_token))
    }
}
