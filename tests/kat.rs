//! Wire-structure tests (v1 streaming framing)

use sigil_envelope::wire::{
    self, AEAD_TAG_BYTES, AUTHENTICATOR_BYTES, FLAGS_V1, KEM_CIPHERTEXT_BYTES, KEM_PUBLIC_KEY_BYTES,
    KEM_SECRET_KEY_BYTES, MAGIC, MODE_ENCRYPT, NONCE_BYTES, PREFIX_BYTES, PROTOCOL_VERSION,
    SUITE_AEAD_AES256GCM, SUITE_KEM_HYBRID_X25519_MLKEM768, WRAPPED_KEY_BYTES,
};
use sigil_envelope::{generate_keypair, seal, EnvelopeError, SealOptions, SenderMode};

fn binary(chunk_size: usize) -> SealOptions {
    SealOptions {
        armor: false,
        chunk_size,
        ..SealOptions::default()
    }
}

#[test]
fn test_wire_constants() {
    assert_eq!(KEM_CIPHERTEXT_BYTES, 1120);
    assert_eq!(KEM_PUBLIC_KEY_BYTES, 1216);
    assert_eq!(KEM_SECRET_KEY_BYTES, 2432);
    assert_eq!(NONCE_BYTES, 12);
    assert_eq!(AEAD_TAG_BYTES, 16);
    assert_eq!(WRAPPED_KEY_BYTES, 48);
    assert_eq!(PREFIX_BYTES, 12);
}

#[test]
fn test_header_structure() {
    let (a, _) = generate_keypair();
    let (b, _) = generate_keypair();
    let mut env = Vec::new();
    seal(&b"test"[..], &mut env, &[a.clone(), b.clone()], SenderMode::Anonymous, &binary(64)).unwrap();

    assert_eq!(&env[..3], MAGIC);
    let (header, len) = wire::decode_header(&env).unwrap();
    assert_eq!(header.version, PROTOCOL_VERSION);
    assert_eq!(header.mode, MODE_ENCRYPT);
    assert_eq!(header.suite_kem, SUITE_KEM_HYBRID_X25519_MLKEM768);
    assert_eq!(header.suite_aead, SUITE_AEAD_AES256GCM);
    assert_eq!(header.flags, FLAGS_V1);
    assert_eq!(header.slots.len(), 2);
    assert_eq!(header.slots[0].kid, Some(a.kid()));
    assert_eq!(header.slots[1].kid, Some(b.kid()));
    for slot in &header.slots {
        assert_eq!(slot.kem_ciphertext.len(), KEM_CIPHERTEXT_BYTES);
        assert_eq!(slot.wrapped_key.len(), WRAPPED_KEY_BYTES);
    }

    // One final chunk: flag, length, ct, two authenticators.
    let chunk = &env[len..];
    assert_eq!(chunk[0], 1);
    assert_eq!(chunk.len(), 1 + 4 + 4 + AEAD_TAG_BYTES + 2 * AUTHENTICATOR_BYTES);
}

#[test]
fn test_empty_message_has_one_final_chunk() {
    let (pk, _) = generate_keypair();
    let mut env = Vec::new();
    seal(&b""[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    let (_, len) = wire::decode_header(&env).unwrap();
    assert_eq!(env.len() - len, 1 + 4 + AEAD_TAG_BYTES + AUTHENTICATOR_BYTES);
}

#[test]
fn test_header_reencodes_identically() {
    let (pk, _) = generate_keypair();
    let mut env = Vec::new();
    seal(&b"abc"[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    let (header, len) = wire::decode_header(&env).unwrap();
    assert_eq!(wire::encode_header(&header).unwrap(), &env[..len]);
}

#[test]
fn test_truncated_header() {
    let (pk, _) = generate_keypair();
    let mut env = Vec::new();
    seal(&b"abc"[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    for cut in [0, 5, PREFIX_BYTES, PREFIX_BYTES + 100] {
        assert!(matches!(wire::decode_header(&env[..cut]), Err(EnvelopeError::Truncated)));
    }
}

#[test]
fn test_unknown_slot_marker() {
    let (pk, _) = generate_keypair();
    let mut env = Vec::new();
    seal(&b"abc"[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    let marker_at = PREFIX_BYTES + 2 + 49 + 2;
    env[marker_at] = 0x07;
    assert!(matches!(wire::decode_header(&env), Err(EnvelopeError::Malformed(_))));
}
