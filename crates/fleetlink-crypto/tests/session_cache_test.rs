//! End-to-end behaviour of the session cache through [`CryptoManager`].
//!
//! Steady-state traffic must not cost RSA operations: these tests count them
//! through [`CryptoManager::stats`].

use std::{sync::Arc, time::Duration};

use fleetlink_crypto::{
    CryptoConfig, CryptoError, CryptoManager, InMemoryResolver, KeyMaterial, PublicKeyResolver,
    RateLimiter, RsaStatsSnapshot,
};
use fleetlink_harness::{SimEnv, test_key};
use fleetlink_proto::{Compression, Envelope, Message, MessageList, MessagePayload};

fn manager(key: KeyMaterial, trusted: &[&KeyMaterial]) -> CryptoManager<SimEnv> {
    let resolver = InMemoryResolver::new();
    for peer in trusted {
        resolver.add(peer.identity(), peer.public_key()).unwrap();
    }
    CryptoManager::new(SimEnv::new(), key, Arc::new(resolver), CryptoConfig::default())
}

fn log(source: &str, text: &str) -> MessageList {
    MessageList::single(Message {
        session_id: "F.1".to_string(),
        request_id: 1,
        source: source.to_string(),
        urgent: false,
        payload: MessagePayload::Log { level: "INFO".to_string(), message: text.to_string() },
    })
}

#[tokio::test]
async fn steady_state_costs_no_rsa() {
    let (a, b) = (test_key(0), test_key(1));
    let sender = manager(a.clone(), &[&b]);
    let receiver = manager(b.clone(), &[&a]);

    let first = sender.encrypt_messages(&[log(a.identity(), "one")], Compression::Zlib, b.identity()).unwrap();
    let second = sender.encrypt_messages(&[log(a.identity(), "two")], Compression::Zlib, b.identity()).unwrap();
    assert_ne!(first, second, "every envelope gets a fresh packet IV");
    assert_eq!(sender.stats(), RsaStatsSnapshot { sign: 1, encrypt: 1, ..Default::default() });

    let info = receiver.decrypt(&first).await.unwrap();
    assert!(info.authenticated);
    assert_eq!(info.source, a.identity());
    assert_eq!(info.messages().unwrap(), log(a.identity(), "one").messages);
    assert_eq!(receiver.stats(), RsaStatsSnapshot { decrypt: 1, verify: 1, ..Default::default() });

    let info = receiver.decrypt(&second).await.unwrap();
    assert!(info.authenticated);
    assert_eq!(info.messages().unwrap(), log(a.identity(), "two").messages);
    assert_eq!(receiver.stats().total(), 2, "cached session needs no RSA work");
}

#[tokio::test]
async fn replies_negotiate_their_own_session() {
    let (a, b) = (test_key(0), test_key(1));
    let endpoint = manager(a.clone(), &[&b]);
    let server = manager(b.clone(), &[&a]);

    let upload = endpoint.encrypt_messages(&[log(a.identity(), "up")], Compression::None, b.identity()).unwrap();
    server.decrypt(&upload).await.unwrap();

    let reply = server.encrypt_messages(&[log(b.identity(), "down")], Compression::None, a.identity()).unwrap();
    let info = endpoint.decrypt(&reply).await.unwrap();
    assert!(info.authenticated);
    assert_eq!(info.source, b.identity());
    assert_eq!(endpoint.cached_peers(), 1);
    assert_eq!(server.cached_peers(), 1);
}

#[tokio::test]
async fn unknown_source_is_promoted_after_registration() {
    let (a, b) = (test_key(0), test_key(1));
    let sender = manager(a.clone(), &[&b]);
    let receiver = manager(b, &[]);

    let first = sender.encrypt_messages(&[log(a.identity(), "one")], Compression::Zlib, receiver.identity()).unwrap();
    let second = sender.encrypt_messages(&[log(a.identity(), "two")], Compression::Zlib, receiver.identity()).unwrap();

    let info = receiver.decrypt(&first).await.unwrap();
    assert!(!info.authenticated);
    assert_eq!(info.source, a.identity());
    assert!(matches!(info.require_authenticated(), Err(CryptoError::NotTrusted(_))));
    // Messages are still readable, e.g. to find an enrolment request.
    assert_eq!(info.messages().unwrap().len(), 1);
    assert_eq!(receiver.stats(), RsaStatsSnapshot { decrypt: 1, ..Default::default() });

    receiver.register_peer_key(a.identity(), &a.public_key_pem().unwrap()).unwrap();

    let info = receiver.decrypt(&second).await.unwrap();
    assert!(info.authenticated);
    info.require_authenticated().unwrap();
    assert_eq!(
        receiver.stats(),
        RsaStatsSnapshot { decrypt: 1, verify: 1, ..Default::default() },
        "promotion reuses the decrypted key blob"
    );
}

#[tokio::test]
async fn wrong_known_key_is_tried_once_per_session() {
    let (a, b, c) = (test_key(0), test_key(1), test_key(2));
    let sender = manager(a.clone(), &[&b]);
    let resolver = InMemoryResolver::new();
    resolver.add(a.identity(), c.public_key()).unwrap();
    let receiver =
        CryptoManager::new(SimEnv::new(), b.clone(), Arc::new(resolver.clone()), CryptoConfig::default());

    for n in 0..5 {
        let envelope = sender
            .encrypt_messages(&[log(a.identity(), &format!("m{n}"))], Compression::Zlib, b.identity())
            .unwrap();
        let info = receiver.decrypt(&envelope).await.unwrap();
        assert!(!info.authenticated);
        assert_eq!(receiver.stats(), RsaStatsSnapshot { decrypt: 1, verify: 1, ..Default::default() });
    }

    // A corrected key gets its own single attempt.
    resolver.add(a.identity(), a.public_key()).unwrap();
    let envelope = sender.encrypt_messages(&[log(a.identity(), "fixed")], Compression::Zlib, b.identity()).unwrap();
    assert!(receiver.decrypt(&envelope).await.unwrap().authenticated);
    assert_eq!(receiver.stats(), RsaStatsSnapshot { decrypt: 1, verify: 2, ..Default::default() });
}

#[tokio::test]
async fn envelope_without_key_blob_is_empty() {
    let receiver = manager(test_key(1), &[]);
    let info = receiver.decrypt(&Envelope::default().to_bytes().unwrap()).await.unwrap();
    assert!(info.is_empty());
    assert!(!info.authenticated);
    assert_eq!(receiver.stats().total(), 0);
}

#[tokio::test]
async fn envelope_for_someone_else_is_rejected() {
    let (a, b, c) = (test_key(0), test_key(1), test_key(2));
    let sender = manager(a.clone(), &[&b]);
    let bystander = manager(c, &[&a]);

    let envelope = sender.encrypt_messages(&[log(a.identity(), "x")], Compression::None, b.identity()).unwrap();
    let err = bystander.decrypt(&envelope).await.unwrap_err();
    assert_eq!(err, CryptoError::KeyDecryption);
    assert!(err.is_fatal());
}

#[test]
fn enrolment_under_foreign_identity_is_refused() {
    let (a, b) = (test_key(0), test_key(1));
    let server = manager(test_key(2), &[]);

    let err = server.register_peer_key(b.identity(), &a.public_key_pem().unwrap()).unwrap_err();
    assert!(matches!(err, CryptoError::IdentityMismatch { .. }));
    assert!(err.is_trust());
}

#[test]
fn pinned_server_key_mismatch_is_not_installed() {
    let (server, impostor) = (test_key(1), test_key(2));
    let endpoint = manager(test_key(0), &[]);

    let err = endpoint
        .add_server_key(&impostor.public_key_pem().unwrap(), Some(server.identity()))
        .unwrap_err();
    assert!(matches!(err, CryptoError::IdentityMismatch { .. }));

    let err = endpoint.encrypt(Vec::new(), Compression::None, impostor.identity()).unwrap_err();
    assert_eq!(err, CryptoError::NoPublicKey(impostor.identity().to_string()));

    let identity = endpoint.add_server_key(&server.public_key_pem().unwrap(), Some(server.identity())).unwrap();
    assert_eq!(identity, server.identity());
    endpoint.encrypt(Vec::new(), Compression::None, server.identity()).unwrap();
}

#[test]
fn server_rekey_drops_cached_session() {
    let (old, new) = (test_key(1), test_key(2));
    let endpoint = manager(test_key(0), &[]);

    let old_id = endpoint.add_server_key(&old.public_key_pem().unwrap(), None).unwrap();
    endpoint.encrypt(Vec::new(), Compression::None, &old_id).unwrap();
    assert_eq!(endpoint.cached_peers(), 1);

    // Same key again changes nothing.
    endpoint.add_server_key(&old.public_key_pem().unwrap(), None).unwrap();
    assert_eq!(endpoint.cached_peers(), 1);

    endpoint.delete_subject(&old_id).unwrap();
    assert_eq!(endpoint.cached_peers(), 0);
    assert!(endpoint.encrypt(Vec::new(), Compression::None, &old_id).is_err());

    let new_id = endpoint.add_server_key(&new.public_key_pem().unwrap(), None).unwrap();
    assert_ne!(new_id, old_id);
    endpoint.encrypt(Vec::new(), Compression::None, &new_id).unwrap();
}

#[tokio::test(start_paused = true)]
async fn limiter_delays_instead_of_failing() {
    let limiter = RateLimiter::new(SimEnv::new(), 10, 2);
    assert!(limiter.try_acquire());
    assert!(limiter.try_acquire());
    assert!(!limiter.try_acquire());

    let start = tokio::time::Instant::now();
    limiter.acquire().await;
    assert!(start.elapsed() >= Duration::from_millis(100));

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(limiter.try_acquire());
    assert!(limiter.try_acquire());
    assert!(!limiter.try_acquire(), "bucket never exceeds burst");
}

#[test]
fn zero_rate_disables_limiting() {
    let limiter = RateLimiter::new(SimEnv::new(), 0, 1);
    assert!((0..1000).all(|_| limiter.try_acquire()));
}
