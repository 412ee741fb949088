use proptest::prelude::*;

use sigil_envelope::wire::{self, PREFIX_BYTES, SUITE_KEM_HYBRID_X25519_MLKEM768};
use sigil_envelope::{
    generate_keypair, seal, CryptoFormat, EnvelopeError, Opener, PublicKey, SealOptions, SecretKey,
    SenderField, SenderMode,
};

fn setup() -> (PublicKey, SecretKey) {
    generate_keypair()
}

fn binary(chunk_size: usize) -> SealOptions {
    SealOptions {
        armor: false,
        chunk_size,
        ..SealOptions::default()
    }
}

fn open(envelope: &[u8], keys: &[&SecretKey]) -> Result<(Vec<u8>, SenderField), EnvelopeError> {
    let opener = Opener::begin(envelope, "decrypt")?;
    let unlocked = opener.unlock(keys)?;
    let mut out = Vec::new();
    opener.stream(&unlocked, &mut out)?;
    Ok((out, unlocked.sender))
}

#[test]
fn roundtrip_basic() {
    let (pk, sk) = setup();
    let mut env = Vec::new();
    let sender = SenderMode::Identified { public: &pk, secret: &sk };
    seal(&b"hello multi-device world"[..], &mut env, &[pk.clone()], sender, &SealOptions::default()).unwrap();

    let (pt, sender) = open(&env, &[&sk]).unwrap();
    assert_eq!(pt, b"hello multi-device world");
    assert_eq!(sender, SenderField::Key(pk));
}

#[test]
fn roundtrip_empty_plaintext() {
    let (pk, sk) = setup();
    let mut env = Vec::new();
    seal(&b""[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    let (pt, _) = open(&env, &[&sk]).unwrap();
    assert!(pt.is_empty());
}

#[test]
fn roundtrip_large_plaintext_many_chunks() {
    let (pk, sk) = setup();
    let plaintext = vec![0xABu8; 200_000];
    let mut env = Vec::new();
    seal(&plaintext[..], &mut env, &[pk], SenderMode::Anonymous, &binary(4096)).unwrap();
    let (pt, _) = open(&env, &[&sk]).unwrap();
    assert_eq!(pt, plaintext);
}

#[test]
fn every_recipient_can_open() {
    let keys: Vec<(PublicKey, SecretKey)> = (0..4).map(|_| setup()).collect();
    let pks: Vec<PublicKey> = keys.iter().map(|(pk, _)| pk.clone()).collect();
    let (spk, ssk) = setup();
    let mut env = Vec::new();
    let sender = SenderMode::Identified { public: &spk, secret: &ssk };
    seal(&b"to all"[..], &mut env, &pks, sender, &binary(8)).unwrap();

    for (_, sk) in &keys {
        let (pt, sender) = open(&env, &[sk]).unwrap();
        assert_eq!(pt, b"to all");
        assert_eq!(sender.key(), Some(&spk));
    }
}

#[test]
fn wrong_key_finds_no_slot() {
    let (pk, _sk) = setup();
    let (_, sk2) = setup();
    let mut env = Vec::new();
    seal(&b"data"[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    assert!(matches!(open(&env, &[&sk2]), Err(EnvelopeError::NoMatchingKey)));
}

#[test]
fn second_candidate_is_used() {
    let (pk, sk) = setup();
    let (_, other) = setup();
    let mut env = Vec::new();
    seal(&b"data"[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();

    let opener = Opener::begin(&env[..], "decrypt").unwrap();
    let unlocked = opener.unlock(&[&other, &sk]).unwrap();
    assert_eq!(unlocked.candidate_index, 1);
    assert_eq!(unlocked.slot_index, 0);
}

#[test]
fn hidden_sender_never_reveals_key() {
    let (pk, sk) = setup();
    let mut env = Vec::new();
    seal(&b"who?"[..], &mut env, &[pk.clone()], SenderMode::Anonymous, &binary(64)).unwrap();

    let (_, sender) = open(&env, &[&sk]).unwrap();
    assert_eq!(sender, SenderField::Anonymous);
    // Neither the key bytes nor a prefix of them appear anywhere.
    let needle = &pk.to_bytes()[..32];
    assert!(!env.windows(needle.len()).any(|w| w == needle));
}

#[test]
fn tampered_chunk_fails() {
    let (pk, sk) = setup();
    let mut env = Vec::new();
    seal(&b"payload bytes"[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    let (_, header_len) = wire::decode_header(&env).unwrap();
    env[header_len + 6] ^= 0x01;
    assert!(matches!(open(&env, &[&sk]), Err(EnvelopeError::Decryption(_))));
}

#[test]
fn tampered_slot_fails() {
    let (pk, sk) = setup();
    let mut env = Vec::new();
    seal(&b"payload"[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    // prefix, sender len, sender ct (anonymous: 33 + tag), slot count, marker, kid, then kem ct
    let kem_at = PREFIX_BYTES + 2 + 49 + 2 + 1 + 32;
    env[kem_at + 40] ^= 0x01;
    assert!(matches!(open(&env, &[&sk]), Err(EnvelopeError::NoMatchingKey)));
}

#[test]
fn reordered_chunks_fail() {
    let (pk, sk) = setup();
    let mut env = Vec::new();
    seal(&[5u8; 32][..], &mut env, &[pk], SenderMode::Anonymous, &binary(8)).unwrap();
    let (_, header_len) = wire::decode_header(&env).unwrap();
    let frame = 1 + 4 + 8 + 16 + 32;
    let (a, b) = (header_len, header_len + frame);
    let first: Vec<u8> = env[a..b].to_vec();
    let second: Vec<u8> = env[b..b + frame].to_vec();
    env[a..b].copy_from_slice(&second);
    env[b..b + frame].copy_from_slice(&first);
    assert!(open(&env, &[&sk]).is_err());
}

#[test]
fn recipient_cannot_forge_for_other_recipient() {
    // A recipient knows the payload key but not the other slot's MAC key, so
    // re-encrypting a chunk breaks the other recipient's authenticator.
    let (a_pk, a_sk) = setup();
    let (b_pk, b_sk) = setup();
    let (spk, ssk) = setup();
    let mut env = Vec::new();
    let sender = SenderMode::Identified { public: &spk, secret: &ssk };
    seal(&b"genuine"[..], &mut env, &[a_pk, b_pk], sender, &binary(64)).unwrap();
    let (_, header_len) = wire::decode_header(&env).unwrap();

    // flip one bit in slot 0's authenticator only
    let frame_ct = 1 + 4 + 7 + 16;
    env[header_len + frame_ct] ^= 0x01;

    assert!(open(&env, &[&a_sk]).is_err());
    assert_eq!(open(&env, &[&b_sk]).unwrap().0, b"genuine");
}

#[test]
fn armored_output_is_detected() {
    let (pk, sk) = setup();
    let mut env = Vec::new();
    seal(&b"armored"[..], &mut env, &[pk], SenderMode::Anonymous, &SealOptions::default()).unwrap();
    let text = String::from_utf8(env.clone()).unwrap();
    assert!(text.starts_with("BEGIN SIGIL ENCRYPTED MESSAGE."));
    assert!(text.trim_end().ends_with("END SIGIL ENCRYPTED MESSAGE."));
    assert_eq!(wire::detect_format(&env).format, CryptoFormat::SigilEncrypted);
    assert_eq!(open(&env, &[&sk]).unwrap().0, b"armored");
}

#[test]
fn pgp_input_is_format_mismatch() {
    let input = b"-----BEGIN PGP MESSAGE-----\n\nhQEMA...\n-----END PGP MESSAGE-----\n";
    let err = Opener::begin(&input[..], "decrypt").err().unwrap();
    let m = err.format_mismatch().unwrap();
    assert_eq!(m.wanted, CryptoFormat::SigilEncrypted);
    assert_eq!(m.received, CryptoFormat::Pgp);
    assert_eq!(m.operation, "decrypt");
}

#[test]
fn unsupported_suite_rejected() {
    let (pk, sk) = setup();
    let mut env = Vec::new();
    seal(&b"data"[..], &mut env, &[pk], SenderMode::Anonymous, &binary(64)).unwrap();
    assert_eq!(env[5], SUITE_KEM_HYBRID_X25519_MLKEM768);
    env[5] = 0xA2;
    let err = open(&env, &[&sk]).unwrap_err();
    assert!(matches!(err, EnvelopeError::UnsupportedSuite { kem: 0xA2, .. }));
}

#[test]
fn key_serialization_roundtrip() {
    let (pk, sk) = setup();
    let pk2 = PublicKey::from_bytes(&pk.to_bytes()).unwrap();
    let sk2 = SecretKey::from_bytes(&sk.to_bytes()).unwrap();

    let mut env = Vec::new();
    seal(&b"key serialization"[..], &mut env, &[pk2], SenderMode::Anonymous, &binary(64)).unwrap();
    assert_eq!(open(&env, &[&sk2]).unwrap().0, b"key serialization");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_bytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..3000), chunk in 1usize..700, armor in any::<bool>()) {
        let (pk, sk) = setup();
        let opts = SealOptions { armor, chunk_size: chunk, ..SealOptions::default() };
        let mut env = Vec::new();
        let sender = SenderMode::Identified { public: &pk, secret: &sk };
        let consumed = seal(&data[..], &mut env, &[pk.clone()], sender, &opts).unwrap();
        prop_assert_eq!(consumed as usize, data.len());
        let (pt, _) = open(&env, &[&sk]).unwrap();
        prop_assert_eq!(pt, data);
    }
}
