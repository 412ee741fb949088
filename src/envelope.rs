//! Streaming multi-recipient envelope.
//!
//! `seal` encapsulates a fresh payload key to every recipient device key,
//! encrypts the sender field under it and streams the plaintext as
//! AES-256-GCM chunks. Each chunk carries one HMAC per recipient slot, keyed
//! from a DH between the sender's (or a throwaway) X25519 key and that
//! recipient's key, so a chunk only verifies for a recipient if the sender
//! really produced it.
//!
//! `Opener` runs the other direction in three steps: `begin` (format check
//! and header parse, no key material), `unlock` (trial decryption of the
//! slots) and `stream` (chunk verification and output).

use std::io::{self, Cursor, Read, Write};

use rand_core::OsRng;
use tracing::{debug, trace};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::aead::{aead_open, aead_seal, random_key};
use crate::armor::{ArmorReader, ArmorWriter};
use crate::error::{CryptoFormat, DecryptionError, EncodingError, EnvelopeError, FormatMismatch};
use crate::kdf;
use crate::kem::{HybridX25519MlKem768Provider, KemProvider, Kid, PublicKey, SecretKey};
use crate::wire::{
    self, Header, RecipientSlot, AEAD_TAG_BYTES, AUTHENTICATOR_BYTES, DEFAULT_CHUNK_BYTES,
    DETECT_PREFIX_BYTES, HASH_BYTES, MAX_CHUNK_BYTES, MAX_RECIPIENTS, PREFIX_BYTES, PROTOCOL_ID,
    SENDER_ANONYMOUS, SENDER_FIELD_ANON_BYTES, SENDER_FIELD_KEY_BYTES, SENDER_KEY, SENDER_NONCE,
    SLOT_NONCE, X25519_KEY_BYTES,
};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealOptions {
    /// Write the anonymous marker instead of key identifiers.
    pub hide_recipients: bool,
    /// Plaintext bytes per chunk.
    pub chunk_size: usize,
    /// ASCII-armor the output.
    pub armor: bool,
}

impl Default for SealOptions {
    fn default() -> Self {
        Self {
            hide_recipients: false,
            chunk_size: DEFAULT_CHUNK_BYTES,
            armor: true,
        }
    }
}

/// Who the envelope claims to be from.
pub enum SenderMode<'k> {
    Identified { public: &'k PublicKey, secret: &'k SecretKey },
    /// Hidden sender: a throwaway key takes the place of the real one.
    Anonymous,
}

/// Decrypted sender field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SenderField {
    Key(PublicKey),
    /// Placeholder carrying only the throwaway X25519 key.
    Anonymous,
}

impl SenderField {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, SenderField::Anonymous)
    }

    pub fn key(&self) -> Option<&PublicKey> {
        match self {
            SenderField::Key(pk) => Some(pk),
            SenderField::Anonymous => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Seal
// ---------------------------------------------------------------------------

/// Encrypt `source` to every key in `recipients`, writing the envelope to `sink`.
///
/// Returns the number of plaintext bytes consumed.
pub fn seal<R: Read, W: Write>(
    mut source: R,
    sink: W,
    recipients: &[PublicKey],
    sender: SenderMode<'_>,
    opts: &SealOptions,
) -> Result<u64, EnvelopeError> {
    if recipients.is_empty() {
        return Err(EnvelopeError::NoRecipients);
    }
    if recipients.len() > MAX_RECIPIENTS {
        return Err(EnvelopeError::TooManyRecipients(recipients.len()));
    }
    if opts.chunk_size == 0 || opts.chunk_size > MAX_CHUNK_BYTES {
        return Err(EnvelopeError::InvalidChunkSize(opts.chunk_size));
    }

    let payload_key = Zeroizing::new(random_key()?);

    let (auth_secret, mut sender_field) = match sender {
        SenderMode::Identified { public, secret } => {
            let mut field = Vec::with_capacity(SENDER_FIELD_KEY_BYTES);
            field.push(SENDER_KEY);
            field.extend_from_slice(&public.to_bytes());
            (secret.x25519().clone(), field)
        }
        SenderMode::Anonymous => {
            let throwaway = StaticSecret::random_from_rng(OsRng);
            let mut field = Vec::with_capacity(SENDER_FIELD_ANON_BYTES);
            field.push(SENDER_ANONYMOUS);
            field.extend_from_slice(X25519PublicKey::from(&throwaway).as_bytes());
            (throwaway, field)
        }
    };
    let sender_ciphertext = aead_seal(&payload_key, &SENDER_NONCE, &sender_field, PROTOCOL_ID)?;
    sender_field.clear();

    let mut slots = Vec::with_capacity(recipients.len());
    for pk in recipients {
        let (ss, kem_ct) = HybridX25519MlKem768Provider::encapsulate(pk)?;
        let slot_key = Zeroizing::new(kdf::slot_key(ss.as_slice(), &kdf::ct_hash(&kem_ct))?);
        let mut slot = RecipientSlot {
            kid: (!opts.hide_recipients).then(|| pk.kid()),
            kem_ciphertext: kem_ct,
            wrapped_key: Vec::new(),
        };
        slot.wrapped_key = aead_seal(&slot_key, &SLOT_NONCE, payload_key.as_slice(), &slot.id_bytes())?;
        slots.push(slot);
    }

    let header_bytes = wire::encode_header(&Header::new(sender_ciphertext, slots))?;
    let header_hash = kdf::header_hash(&header_bytes);

    let mut mac_keys = Vec::with_capacity(recipients.len());
    for (i, pk) in recipients.iter().enumerate() {
        let dh = auth_secret.diffie_hellman(pk.x25519());
        mac_keys.push(Zeroizing::new(kdf::mac_key(dh.as_bytes(), &header_hash, i as u32)?));
    }

    debug!(
        recipients = recipients.len(),
        hidden_recipients = opts.hide_recipients,
        armor = opts.armor,
        "sealing envelope"
    );

    if opts.armor {
        let mut out = ArmorWriter::new(sink);
        let n = write_body(&mut source, &mut out, &header_bytes, &header_hash, &payload_key, &mac_keys, opts.chunk_size)?;
        out.finish()?;
        Ok(n)
    } else {
        let mut out = sink;
        let n = write_body(&mut source, &mut out, &header_bytes, &header_hash, &payload_key, &mac_keys, opts.chunk_size)?;
        out.flush()?;
        Ok(n)
    }
}

fn write_body<R: Read, W: Write>(
    source: &mut R,
    out: &mut W,
    header_bytes: &[u8],
    header_hash: &[u8; HASH_BYTES],
    payload_key: &[u8; 32],
    mac_keys: &[Zeroizing<[u8; 32]>],
    chunk_size: usize,
) -> Result<u64, EnvelopeError> {
    out.write_all(header_bytes)?;

    let mut total = 0u64;
    let mut index = 0u64;
    let mut current = Zeroizing::new(read_up_to(source, chunk_size)?);
    loop {
        // One chunk of read-ahead tells us whether `current` is the last.
        let next = if current.len() == chunk_size {
            Zeroizing::new(read_up_to(source, chunk_size)?)
        } else {
            Zeroizing::new(Vec::new())
        };
        let is_final = next.is_empty();

        let aad = wire::chunk_aad(header_hash, index, is_final);
        let ct = aead_seal(payload_key, &wire::chunk_nonce(index), &current, &aad)?;
        let digest = kdf::chunk_digest(header_hash, index, is_final, &ct);
        let auths = mac_keys
            .iter()
            .map(|k| kdf::authenticate(k, &digest))
            .collect::<Result<Vec<_>, EncodingError>>()?;
        out.write_all(&wire::encode_chunk(is_final, &ct, &auths)?)?;
        trace!(index, is_final, len = current.len(), "chunk sealed");

        total += current.len() as u64;
        if is_final {
            return Ok(total);
        }
        current = next;
        index += 1;
    }
}

/// Read until `limit` bytes or end of input.
fn read_up_to<R: Read>(source: &mut R, limit: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit);
    source.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

/// Result of a successful slot match.
pub struct Unlocked {
    /// Index of the slot that opened.
    pub slot_index: usize,
    /// Index into the candidate list of the key that opened it.
    pub candidate_index: usize,
    pub sender: SenderField,
    payload_key: Zeroizing<[u8; 32]>,
    mac_key: Zeroizing<[u8; 32]>,
}

impl core::fmt::Debug for Unlocked {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Unlocked")
            .field("slot_index", &self.slot_index)
            .field("candidate_index", &self.candidate_index)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

pub struct Opener<'a> {
    source: Box<dyn Read + 'a>,
    header: Header,
    header_hash: [u8; HASH_BYTES],
    armored: bool,
}

impl<'a> Opener<'a> {
    /// Detect the format and parse the header. No key material is touched.
    ///
    /// `operation` names the caller's operation in a format mismatch.
    pub fn begin<R: Read + 'a>(mut source: R, operation: &str) -> Result<Self, EnvelopeError> {
        let mut peek = Vec::with_capacity(DETECT_PREFIX_BYTES);
        (&mut source)
            .take(DETECT_PREFIX_BYTES as u64)
            .read_to_end(&mut peek)?;
        let detected = wire::detect_format(&peek);
        if detected.format != CryptoFormat::SigilEncrypted {
            debug!(received = %detected.format, operation, "format mismatch");
            return Err(FormatMismatch::new(CryptoFormat::SigilEncrypted, detected.format, operation).into());
        }

        let rejoined = Cursor::new(peek).chain(source);
        let mut source: Box<dyn Read + 'a> = if detected.armored {
            Box::new(ArmorReader::new(rejoined).map_err(|_| EnvelopeError::Armor("bad header"))?)
        } else {
            Box::new(rejoined)
        };

        let mut prefix_bytes = [0u8; PREFIX_BYTES];
        read_exact_or_truncated(&mut source, &mut prefix_bytes)?;
        let prefix = wire::decode_encrypted_prefix(&prefix_bytes)?;
        // grows with what actually arrives, not with what the prefix claims
        let mut body = Vec::new();
        (&mut source).take(prefix.body_len as u64).read_to_end(&mut body)?;
        if body.len() != prefix.body_len {
            return Err(EnvelopeError::Truncated);
        }
        let header = wire::decode_body(prefix, &body)?;

        let mut full = Vec::with_capacity(PREFIX_BYTES + body.len());
        full.extend_from_slice(&prefix_bytes);
        full.extend_from_slice(&body);
        let header_hash = kdf::header_hash(&full);

        debug!(slots = header.slots.len(), armored = detected.armored, "header parsed");
        Ok(Self {
            source,
            header,
            header_hash,
            armored: detected.armored,
        })
    }

    pub fn slots(&self) -> &[RecipientSlot] {
        &self.header.slots
    }

    /// Key identifiers the header addresses. Anonymous slots are skipped.
    pub fn recipient_kids(&self) -> impl Iterator<Item = &Kid> + '_ {
        self.header.slots.iter().filter_map(|s| s.kid.as_ref())
    }

    pub fn is_armored(&self) -> bool {
        self.armored
    }

    /// Try every candidate key against every slot, slots in order.
    ///
    /// Slots carrying a key identifier are only tried with the matching
    /// candidate; anonymous slots are tried with all of them.
    pub fn unlock(&self, candidates: &[&SecretKey]) -> Result<Unlocked, EnvelopeError> {
        let kids: Vec<Kid> = candidates.iter().map(|sk| sk.public_key().kid()).collect();

        for (slot_index, slot) in self.header.slots.iter().enumerate() {
            for (candidate_index, sk) in candidates.iter().enumerate() {
                if let Some(kid) = &slot.kid {
                    if !kid.ct_eq(&kids[candidate_index]) {
                        continue;
                    }
                }
                let Some(payload_key) = open_slot(slot, sk) else {
                    continue;
                };
                let (sender, sender_x25519) = self.open_sender(&payload_key)?;
                let dh = sk.x25519().diffie_hellman(&sender_x25519);
                let mac_key = Zeroizing::new(kdf::mac_key(dh.as_bytes(), &self.header_hash, slot_index as u32)?);
                debug!(slot_index, candidate_index, anonymous_sender = sender.is_anonymous(), "slot opened");
                return Ok(Unlocked {
                    slot_index,
                    candidate_index,
                    sender,
                    payload_key,
                    mac_key,
                });
            }
        }
        Err(EnvelopeError::NoMatchingKey)
    }

    fn open_sender(&self, payload_key: &[u8; 32]) -> Result<(SenderField, X25519PublicKey), EnvelopeError> {
        let field = Zeroizing::new(aead_open(payload_key, &SENDER_NONCE, &self.header.sender_ciphertext, PROTOCOL_ID)?);
        match (field.first().copied(), field.len()) {
            (Some(SENDER_KEY), SENDER_FIELD_KEY_BYTES) => {
                let pk = PublicKey::from_bytes(&field[1..])?;
                let x = *pk.x25519();
                Ok((SenderField::Key(pk), x))
            }
            (Some(SENDER_ANONYMOUS), SENDER_FIELD_ANON_BYTES) => {
                let raw: [u8; X25519_KEY_BYTES] = field[1..].try_into().map_err(|_| DecryptionError)?;
                Ok((SenderField::Anonymous, X25519PublicKey::from(raw)))
            }
            _ => Err(EnvelopeError::Malformed("bad sender field")),
        }
    }

    /// Verify and decrypt every chunk into `sink`. Returns plaintext length.
    pub fn stream<W: Write>(mut self, unlocked: &Unlocked, mut sink: W) -> Result<u64, EnvelopeError> {
        let slot_count = self.header.slots.len();
        let mut total = 0u64;
        let mut index = 0u64;
        loop {
            let mut flag = [0u8; 1];
            read_exact_or_truncated(&mut self.source, &mut flag)?;
            let is_final = match flag[0] {
                0 => false,
                1 => true,
                _ => return Err(EnvelopeError::Malformed("bad chunk flag")),
            };
            let mut len = [0u8; 4];
            read_exact_or_truncated(&mut self.source, &mut len)?;
            let ct_len = u32::from_be_bytes(len) as usize;
            if !(AEAD_TAG_BYTES..=MAX_CHUNK_BYTES + AEAD_TAG_BYTES).contains(&ct_len) {
                return Err(EnvelopeError::Malformed("bad chunk length"));
            }
            let mut ct = vec![0u8; ct_len];
            read_exact_or_truncated(&mut self.source, &mut ct)?;
            let mut auths = vec![0u8; slot_count * AUTHENTICATOR_BYTES];
            read_exact_or_truncated(&mut self.source, &mut auths)?;

            let at = unlocked.slot_index * AUTHENTICATOR_BYTES;
            let digest = kdf::chunk_digest(&self.header_hash, index, is_final, &ct);
            kdf::verify_authenticator(&unlocked.mac_key, &digest, &auths[at..at + AUTHENTICATOR_BYTES])?;

            let aad = wire::chunk_aad(&self.header_hash, index, is_final);
            let pt = Zeroizing::new(aead_open(&unlocked.payload_key, &wire::chunk_nonce(index), &ct, &aad)?);
            sink.write_all(&pt)?;
            total += pt.len() as u64;
            trace!(index, is_final, len = pt.len(), "chunk opened");

            if is_final {
                break;
            }
            index += 1;
        }

        let mut extra = [0u8; 1];
        if self.source.read(&mut extra)? != 0 {
            return Err(EnvelopeError::TrailingData);
        }
        sink.flush()?;
        Ok(total)
    }
}

fn open_slot(slot: &RecipientSlot, sk: &SecretKey) -> Option<Zeroizing<[u8; 32]>> {
    // ML-KEM rejects implicitly: a wrong key yields a garbage secret and the
    // unwrap below fails, so every mismatch surfaces here as `None`.
    let ss = HybridX25519MlKem768Provider::decapsulate(sk, &slot.kem_ciphertext).ok()?;
    let slot_key = Zeroizing::new(kdf::slot_key(ss.as_slice(), &kdf::ct_hash(&slot.kem_ciphertext)).ok()?);
    let raw = Zeroizing::new(aead_open(&slot_key, &SLOT_NONCE, &slot.wrapped_key, &slot.id_bytes()).ok()?);
    let key: [u8; 32] = raw.as_slice().try_into().ok()?;
    Some(Zeroizing::new(key))
}

fn read_exact_or_truncated<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> Result<(), EnvelopeError> {
    source.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => EnvelopeError::Truncated,
        _ => EnvelopeError::Io(e),
    })
}
