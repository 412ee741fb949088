use std::sync::Arc;
use std::time::Duration;

use sigil_identity::*;
use tokio::sync::mpsc;

fn setup() -> (Arc<DeviceRegistry>, Arc<InMemoryAuditSink>, Arc<Session>) {
    let audit = Arc::new(InMemoryAuditSink::new());
    let registry = Arc::new(DeviceRegistry::open(Arc::new(InMemoryStore::new()), audit.clone()).unwrap());
    let (session, _) = Session::signup(&registry, Username::new("alice"), "laptop", DeviceType::Desktop).unwrap();
    (registry, audit, Arc::new(session))
}

fn activations(audit: &InMemoryAuditSink) -> usize {
    audit
        .events()
        .iter()
        .filter(|e| e.succeeded() && matches!(e.action, AuditAction::DeviceActivated { .. }))
        .count()
}

#[tokio::test]
async fn provisioning_activates_device_once() {
    let (registry, audit, alice) = setup();
    let config = EngineConfig::default();
    let secret = ProvisioningSecret::generate();

    let (a, b) = rendezvous(config.rendezvous_capacity);
    let provisioner = Provisioner::new(registry.clone(), alice.clone(), Some(secret.clone()), &config);
    let provisionee = Provisionee::new(registry.clone(), "phone", DeviceType::Mobile, secret, &config);
    let proposed = provisionee.device().clone();

    let (attested, session) = tokio::join!(provisioner.run(a), provisionee.run(b));
    let attested = attested.unwrap();
    let session = session.unwrap();

    assert_eq!(attested, proposed);
    assert_eq!(session.current().device, proposed);
    assert_eq!(session.username(), alice.username());
    assert_ne!(session.token(), alice.token());

    let devices = registry.active_devices(alice.username()).unwrap();
    assert_eq!(devices.len(), 3);
    assert_eq!(devices.iter().filter(|d| d.id == proposed.id).count(), 1);
    assert_eq!(activations(&audit), 1);
}

#[tokio::test]
async fn secret_can_reach_a_waiting_provisioner() {
    let (registry, audit, alice) = setup();
    let config = EngineConfig::default();
    let secret = ProvisioningSecret::generate();

    let (a, b) = rendezvous(config.rendezvous_capacity);
    let provisioner = Provisioner::new(registry.clone(), alice.clone(), None, &config);
    let handle = provisioner.secret_handle();
    let provisionee = Provisionee::new(registry.clone(), "tablet", DeviceType::Mobile, secret.clone(), &config);

    let (attested, session, _) = tokio::join!(provisioner.run(a), provisionee.run(b), async {
        // let the hello land first
        tokio::task::yield_now().await;
        handle.add_secret(secret).unwrap();
    });
    assert!(attested.is_ok());
    assert!(session.is_ok());
    assert_eq!(activations(&audit), 1);
}

#[tokio::test]
async fn mismatched_secret_fails_both_sides() {
    let (registry, audit, alice) = setup();
    let config = EngineConfig::default();

    let (a, b) = rendezvous(config.rendezvous_capacity);
    let provisioner = Provisioner::new(registry.clone(), alice.clone(), None, &config);
    let handle = provisioner.secret_handle();
    let provisionee = Provisionee::new(
        registry.clone(),
        "phone",
        DeviceType::Mobile,
        ProvisioningSecret::generate(),
        &config,
    );

    let (attested, session, _) = tokio::join!(provisioner.run(a), provisionee.run(b), async {
        tokio::task::yield_now().await;
        handle.add_secret(ProvisioningSecret::generate()).unwrap();
    });
    assert!(matches!(attested, Err(ProvisioningFailed::SecretMismatch)));
    assert!(matches!(session, Err(ProvisioningFailed::SecretMismatch)));
    assert_eq!(registry.active_devices(alice.username()).unwrap().len(), 2);
    assert_eq!(activations(&audit), 0);
}

#[tokio::test(start_paused = true)]
async fn held_hello_is_rejected_at_deadline() {
    let (registry, _, alice) = setup();
    let config = EngineConfig {
        provisioning_timeout_secs: 5,
        ..EngineConfig::default()
    };
    let patient = EngineConfig {
        provisioning_timeout_secs: 10,
        ..EngineConfig::default()
    };

    let (a, b) = rendezvous(config.rendezvous_capacity);
    let provisioner = Provisioner::new(registry.clone(), alice.clone(), Some(ProvisioningSecret::generate()), &config);
    let provisionee = Provisionee::new(
        registry.clone(),
        "phone",
        DeviceType::Mobile,
        ProvisioningSecret::generate(),
        &patient,
    );

    let started = tokio::time::Instant::now();
    let (attested, session) = tokio::join!(provisioner.run(a), provisionee.run(b));
    assert!(matches!(attested, Err(ProvisioningFailed::SecretMismatch)));
    // told why, rather than waiting out its own deadline
    assert!(matches!(session, Err(ProvisioningFailed::SecretMismatch)));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(registry.active_devices(alice.username()).unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn late_confirmation_still_counts_once_active() {
    let (registry, audit, alice) = setup();
    let config = EngineConfig {
        provisioning_timeout_secs: 5,
        ..EngineConfig::default()
    };
    let secret = ProvisioningSecret::generate();

    // provisioner <-> relay <-> provisionee, where the relay sits on Done
    let (to_provisioner, provisioner_rx) = mpsc::channel(4);
    let (provisioner_tx, mut from_provisioner) = mpsc::channel(4);
    let (to_provisionee, provisionee_rx) = mpsc::channel(4);
    let (provisionee_tx, mut from_provisionee) = mpsc::channel(4);
    let relay = async move {
        let hello = from_provisionee.recv().await.unwrap();
        to_provisioner.send(hello).await.unwrap();
        let activation = from_provisioner.recv().await.unwrap();
        to_provisionee.send(activation).await.unwrap();
        let done = from_provisionee.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let _ = to_provisioner.send(done).await;
    };

    let provisioner = Provisioner::new(registry.clone(), alice.clone(), Some(secret.clone()), &config);
    let provisionee = Provisionee::new(registry.clone(), "phone", DeviceType::Mobile, secret, &config);
    let proposed = provisionee.device().clone();

    let (attested, session, _) = tokio::join!(
        provisioner.run(RendezvousEnd::new(provisioner_tx, provisioner_rx)),
        provisionee.run(RendezvousEnd::new(provisionee_tx, provisionee_rx)),
        relay,
    );
    assert_eq!(attested.unwrap(), proposed);
    assert_eq!(session.unwrap().current().device, proposed);
    let devices = registry.active_devices(alice.username()).unwrap();
    assert_eq!(devices.iter().filter(|d| d.id == proposed.id).count(), 1);
    assert_eq!(activations(&audit), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_activation_is_a_timeout_for_both() {
    let (registry, _, alice) = setup();
    let config = EngineConfig {
        provisioning_timeout_secs: 5,
        ..EngineConfig::default()
    };
    let secret = ProvisioningSecret::generate();

    // the relay forwards the hello but swallows the activation
    let (to_provisioner, provisioner_rx) = mpsc::channel(4);
    let (provisioner_tx, mut from_provisioner) = mpsc::channel::<Frame>(4);
    let (to_provisionee, provisionee_rx) = mpsc::channel::<Frame>(4);
    let (provisionee_tx, mut from_provisionee) = mpsc::channel(4);
    let relay = async move {
        let hello = from_provisionee.recv().await.unwrap();
        to_provisioner.send(hello).await.unwrap();
        let _swallowed = from_provisioner.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(to_provisionee);
    };

    let provisioner = Provisioner::new(registry.clone(), alice.clone(), Some(secret.clone()), &config);
    let provisionee = Provisionee::new(registry.clone(), "phone", DeviceType::Mobile, secret, &config);
    let (attested, session, _) = tokio::join!(
        provisioner.run(RendezvousEnd::new(provisioner_tx, provisioner_rx)),
        provisionee.run(RendezvousEnd::new(provisionee_tx, provisionee_rx)),
        relay,
    );
    assert!(matches!(attested, Err(ProvisioningFailed::Timeout)));
    assert!(matches!(session, Err(ProvisioningFailed::Timeout)));
    assert_eq!(registry.active_devices(alice.username()).unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn lonely_parties_time_out() {
    let (registry, _, alice) = setup();
    let config = EngineConfig {
        provisioning_timeout_secs: 2,
        ..EngineConfig::default()
    };

    // keep the far ends open so nobody sees a closed channel
    let (a, _far_a) = rendezvous(1);
    let (b, _far_b) = rendezvous(1);
    let provisioner = Provisioner::new(registry.clone(), alice.clone(), Some(ProvisioningSecret::generate()), &config);
    let provisionee = Provisionee::new(
        registry.clone(),
        "phone",
        DeviceType::Mobile,
        ProvisioningSecret::generate(),
        &config,
    );

    let started = tokio::time::Instant::now();
    let (attested, session) = tokio::join!(provisioner.run(a), provisionee.run(b));
    assert!(matches!(attested, Err(ProvisioningFailed::Timeout)));
    assert!(matches!(session, Err(ProvisioningFailed::Timeout)));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(registry.active_devices(alice.username()).unwrap().len(), 2);
}

#[tokio::test]
async fn closed_rendezvous_is_a_transport_error() {
    let (registry, _, alice) = setup();
    let config = EngineConfig::default();
    let (a, b) = rendezvous(1);
    drop(b);
    let provisioner = Provisioner::new(registry.clone(), alice, Some(ProvisioningSecret::generate()), &config);
    assert!(matches!(provisioner.run(a).await, Err(ProvisioningFailed::Transport(_))));
}

#[tokio::test]
async fn revoked_signer_cannot_activate() {
    let (registry, _, alice) = setup();
    let config = EngineConfig::default();
    let secret = ProvisioningSecret::generate();
    registry
        .revoke_device(alice.username(), &alice.current().device.id)
        .unwrap();

    let (a, b) = rendezvous(config.rendezvous_capacity);
    let provisioner = Provisioner::new(registry.clone(), alice.clone(), Some(secret.clone()), &config);
    let provisionee = Provisionee::new(registry.clone(), "phone", DeviceType::Mobile, secret, &config);

    let (attested, session) = tokio::join!(provisioner.run(a), provisionee.run(b));
    assert!(matches!(
        session,
        Err(ProvisioningFailed::Activation(RegistryError::SignerNotActive(_)))
    ));
    assert!(matches!(attested, Err(ProvisioningFailed::Transport(_))));
    assert_eq!(registry.active_devices(alice.username()).unwrap().len(), 1);
}

/// A device provisioned after a message was sent cannot read it, and the
/// error says which of the user's devices could.
#[tokio::test]
async fn new_device_gets_diagnostics_for_old_message() {
    let (registry, _, alice) = setup();
    let config = EngineConfig::default();
    let tracking = TrackingStore::new();
    let verifier = InMemoryProofVerifier::new();

    let mut envelope = Vec::new();
    {
        let ctx = Context::new(&alice, &registry, &tracking, &verifier, &config);
        encrypt(&ctx, &b"before the phone existed"[..], &mut envelope, &EncryptOptions::default()).unwrap();
    }

    let secret = ProvisioningSecret::generate();
    let (a, b) = rendezvous(config.rendezvous_capacity);
    let provisioner = Provisioner::new(registry.clone(), alice.clone(), Some(secret.clone()), &config);
    let provisionee = Provisionee::new(registry.clone(), "phone", DeviceType::Mobile, secret, &config);
    let (attested, phone) = tokio::join!(provisioner.run(a), provisionee.run(b));
    attested.unwrap();
    let phone = phone.unwrap();

    let ctx = Context::new(&phone, &registry, &tracking, &verifier, &config);
    let mut decryptor = Decryptor::new(ctx, DecryptOptions::default());
    let info = match decryptor.run(&envelope[..], Vec::new(), accept_all) {
        Err(DecryptError::NoDecryptionKey { info }) => info,
        other => panic!("expected NoDecryptionKey, got {:?}", other),
    };
    assert_eq!(decryptor.state(), DecryptState::NoDecryptionKey);
    assert_eq!(info.sender, None);
    assert_eq!(info.devices.len(), 2);

    let desktop: Vec<_> = info.devices.iter().filter(|d| d.device_type == DeviceType::Desktop).collect();
    let backup: Vec<_> = info.devices.iter().filter(|d| d.device_type == DeviceType::Backup).collect();
    assert_eq!(desktop.len(), 1);
    assert_eq!(backup.len(), 1);
    assert_eq!(desktop[0].encrypt_key, alice.current().kid());
    assert_eq!(desktop[0].id, alice.current().device.id);

    // new messages reach the phone
    let mut fresh = Vec::new();
    encrypt(&ctx, &b"after"[..], &mut fresh, &EncryptOptions::default()).unwrap();
    let mut out = Vec::new();
    Decryptor::new(ctx, DecryptOptions::default())
        .run(&fresh[..], &mut out, accept_all)
        .unwrap();
    assert_eq!(out, b"after");
}
