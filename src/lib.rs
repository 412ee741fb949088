//! # Sigil envelope
//!
//! Streaming multi-recipient encryption for per-device keys.
//!
//! ## Quick Start
//!
//! ```rust
//! use sigil_envelope::{generate_keypair, seal, Opener, SealOptions, SenderMode};
//!
//! let (alice_pk, alice_sk) = generate_keypair();
//! let (bob_pk, bob_sk) = generate_keypair();
//!
//! let mut envelope = Vec::new();
//! let sender = SenderMode::Identified { public: &alice_pk, secret: &alice_sk };
//! seal(&b"secret"[..], &mut envelope, &[bob_pk, alice_pk.clone()], sender, &SealOptions::default()).unwrap();
//!
//! let opener = Opener::begin(&envelope[..], "decrypt").unwrap();
//! let unlocked = opener.unlock(&[&bob_sk]).unwrap();
//! assert_eq!(unlocked.sender.key(), Some(&alice_pk));
//!
//! let mut plaintext = Vec::new();
//! opener.stream(&unlocked, &mut plaintext).unwrap();
//! assert_eq!(plaintext, b"secret");
//! ```
//!
//! ## Properties
//!
//! - **Hybrid KEM per slot**: X25519 + ML-KEM-768, secure if either holds
//! - **Bounded memory**: plaintext is processed one chunk at a time
//! - **Sender authentication**: every chunk carries a per-recipient HMAC
//! - **Hidden senders**: a throwaway key replaces the sender key
//! - **Foreign formats**: PGP and signed messages are detected and refused by name
//!
//! Device registries, trust and provisioning live in `sigil-identity`.

#![deny(unsafe_code)]

extern crate alloc;

mod aead;
mod armor;
mod envelope;
mod error;
mod kdf;
mod kem;

#[doc(hidden)]
pub mod wire;

pub use aead::{aead_open, aead_seal, random_key};
pub use armor::{ArmorReader, ArmorWriter};
pub use envelope::{seal, Opener, SealOptions, SenderField, SenderMode, Unlocked};
pub use error::{CryptoFormat, DecryptionError, EncodingError, EnvelopeError, FormatMismatch};
pub use kem::{generate_keypair, HybridX25519MlKem768Provider, KemProvider, Kid, PublicKey, SecretKey, SharedSecret};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
