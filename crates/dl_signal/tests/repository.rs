mod common;

use std::time::Duration;

use dl_crypto::MessageKind;
use dl_keystore::KeyKind;
use dl_proto::{Address, InnerMessage};
use dl_signal::{sender_key_name, SessionStatus, SignalError};

use common::*;

#[tokio::test]
async fn pre_key_handshake_then_ordinary_messages() {
    let alice = device("100", "9100", 1);
    let bob = device("200", "9200", 2);
    let bundle = bundle(&bob, 7).await;

    alice.ctx.repository.inject_e2e_session(&bob.primary, &bundle).await.unwrap();
    assert_eq!(
        alice.ctx.repository.validate_session(&bob.primary).await.unwrap(),
        SessionStatus::PendingPreKey
    );

    let first = alice.ctx.repository.encrypt_message(&bob.primary, b"one").await.unwrap();
    assert_eq!(first.kind, MessageKind::PreKey);
    assert_eq!(first.address, bob.primary);

    let plaintext = bob
        .ctx
        .repository
        .decrypt_message(&alice.primary, "pkmsg", &first.ciphertext)
        .await
        .unwrap();
    assert_eq!(plaintext, b"one");
    // One-time pre-key consumed with the session write.
    assert!(!bob.store.contains(KeyKind::PreKey, "7"));
    assert_eq!(
        bob.ctx.repository.identity_key(&alice.primary).await.unwrap(),
        Some(alice.ctx.repository.identity_public_key())
    );

    let reply = bob.ctx.repository.encrypt_message(&alice.primary, b"two").await.unwrap();
    assert_eq!(reply.kind, MessageKind::Whisper);
    let plaintext = alice
        .ctx
        .repository
        .decrypt_message(&bob.primary, "msg", &reply.ciphertext)
        .await
        .unwrap();
    assert_eq!(plaintext, b"two");

    assert_eq!(
        alice.ctx.repository.validate_session(&bob.primary).await.unwrap(),
        SessionStatus::Valid
    );
    let next = alice.ctx.repository.encrypt_message(&bob.primary, b"three").await.unwrap();
    assert_eq!(next.kind, MessageKind::Whisper);
}

#[tokio::test]
async fn unknown_kind_fails_before_touching_state() {
    let bob = device("200", "9200", 2);
    let err = bob
        .ctx
        .repository
        .decrypt_message(&Address::primary("100", 0), "frob", b"xx")
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::UnknownMessageKind(kind) if kind == "frob"));
    assert_eq!(bob.store.set_calls(), 0);
}

#[tokio::test]
async fn ordinary_message_without_session_is_session_absent() {
    let bob = device("200", "9200", 2);
    let err = bob
        .ctx
        .repository
        .decrypt_message(&Address::primary("100", 0), "msg", b"{}")
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::SessionAbsent(_)));
    assert!(bob.store.snapshot(KeyKind::Session).is_empty());
}

#[tokio::test]
async fn encrypt_without_session_is_session_absent() {
    let alice = device("100", "9100", 1);
    let err = alice
        .ctx
        .repository
        .encrypt_message(&Address::primary("200", 0), b"x")
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::SessionAbsent(_)));
}

#[tokio::test]
async fn encrypt_prefers_mapped_alternate_only_with_live_session() {
    let alice = device("100", "9100", 1);
    let bob = device("200", "9200", 2);
    establish(&alice, &bob, &bob.primary, &alice.primary).await;

    alice.ctx.mappings.store_mapping(&bob.primary, &bob.alternate).await.unwrap();
    let sent = alice.ctx.repository.encrypt_message(&bob.primary, b"x").await.unwrap();
    assert_eq!(sent.address, bob.primary, "no alternate session yet");

    alice.ctx.migrator.migrate(&bob.primary, &bob.alternate).await.unwrap();
    let sent = alice.ctx.repository.encrypt_message(&bob.primary, b"y").await.unwrap();
    assert_eq!(sent.address, bob.alternate);
}

#[tokio::test]
async fn delete_sessions_tears_down() {
    let alice = device("100", "9100", 1);
    let bob = device("200", "9200", 2);
    establish(&alice, &bob, &bob.primary, &alice.primary).await;
    assert!(alice.ctx.repository.has_open_session(&bob.primary).await.unwrap());

    alice.ctx.repository.delete_sessions(&[bob.primary.clone()]).await.unwrap();
    assert!(!alice.ctx.repository.has_open_session(&bob.primary).await.unwrap());
    assert_eq!(
        alice.ctx.repository.validate_session(&bob.primary).await.unwrap(),
        SessionStatus::NoSession
    );
}

#[tokio::test]
async fn group_encrypt_creates_sender_key_once() {
    let alice = device("100", "9100", 1);
    let bob = device("200", "9200", 2);
    let group = group();

    let first = alice
        .ctx
        .repository
        .encrypt_group_message(&group, &alice.primary, b"g1")
        .await
        .unwrap();
    let distribution = first.distribution.expect("new sender key is distributed");

    let second = alice
        .ctx
        .repository
        .encrypt_group_message(&group, &alice.primary, b"g2")
        .await
        .unwrap();
    assert!(second.distribution.is_none());

    bob.ctx
        .repository
        .process_sender_key_distribution(&group, &alice.primary, &distribution)
        .await
        .unwrap();
    let repo = &bob.ctx.repository;
    assert_eq!(repo.decrypt_group_message(&group, &alice.primary, &first.ciphertext).await.unwrap(), b"g1");
    assert_eq!(repo.decrypt_group_message(&group, &alice.primary, &second.ciphertext).await.unwrap(), b"g2");
}

#[tokio::test]
async fn queued_group_message_resolves_when_key_arrives() {
    let alice = device("100", "9100", 1);
    let bob = device("200", "9200", 2);
    let group = group();
    let name = sender_key_name(&group, &alice.primary).to_string();

    let distribution = alice
        .ctx
        .repository
        .sender_key_distribution(&group, &alice.primary)
        .await
        .unwrap();
    let sent = alice
        .ctx
        .repository
        .encrypt_group_message(&group, &alice.primary, b"early")
        .await
        .unwrap();

    let repo = bob.ctx.repository.clone();
    let (g, author) = (group.clone(), alice.primary.clone());
    let waiting = tokio::spawn(async move { repo.decrypt_group_message(&g, &author, &sent.ciphertext).await });
    while bob.ctx.keys.pending_group_messages(&name) == 0 {
        tokio::task::yield_now().await;
    }

    bob.ctx
        .repository
        .process_sender_key_distribution(&group, &alice.primary, &distribution)
        .await
        .unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), b"early");
    assert_eq!(bob.ctx.keys.pending_group_messages(&name), 0);
}

#[tokio::test(start_paused = true)]
async fn queued_group_message_times_out() {
    let alice = device("100", "9100", 1);
    let bob = device("200", "9200", 2);
    let group = group();

    let sent = alice
        .ctx
        .repository
        .encrypt_group_message(&group, &alice.primary, b"lost")
        .await
        .unwrap();
    let started = tokio::time::Instant::now();
    let err = bob
        .ctx
        .repository
        .decrypt_group_message(&group, &alice.primary, &sent.ciphertext)
        .await
        .unwrap_err();
    assert!(err.is_queue_timeout(), "{err}");
    assert!(started.elapsed() >= Duration::from_millis(30_000));
}

#[tokio::test]
async fn shutdown_rejects_queued_group_messages() {
    let alice = device("100", "9100", 1);
    let bob = device("200", "9200", 2);
    let group = group();
    let name = sender_key_name(&group, &alice.primary).to_string();
    let sent = alice
        .ctx
        .repository
        .encrypt_group_message(&group, &alice.primary, b"never")
        .await
        .unwrap();

    let repo = bob.ctx.repository.clone();
    let (g, author) = (group.clone(), alice.primary.clone());
    let waiting = tokio::spawn(async move { repo.decrypt_group_message(&g, &author, &sent.ciphertext).await });
    while bob.ctx.keys.pending_group_messages(&name) == 0 {
        tokio::task::yield_now().await;
    }
    bob.ctx.shutdown();
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, SignalError::KeyStore(dl_keystore::KeyStoreError::QueueClosed)));
}

#[tokio::test]
async fn sender_key_memory_tracks_recipients() {
    let alice = device("100", "9100", 1);
    let group = group();
    let members = [Address::primary("200", 0), Address::primary("200", 1), Address::alternate("9300", 0)];

    let repo = &alice.ctx.repository;
    assert_eq!(repo.devices_missing_sender_key(&group, &members).await.unwrap().len(), 3);
    repo.mark_sender_key_distributed(&group, &members[..2]).await.unwrap();
    assert_eq!(
        repo.devices_missing_sender_key(&group, &members).await.unwrap(),
        vec![members[2].clone()]
    );
    repo.reset_sender_key_memory(&group).await.unwrap();
    assert_eq!(repo.devices_missing_sender_key(&group, &members).await.unwrap().len(), 3);
}

#[tokio::test]
async fn distribution_payload_survives_inner_message() {
    let alice = device("100", "9100", 1);
    let group = group();
    let payload = alice
        .ctx
        .repository
        .sender_key_distribution(&group, &alice.primary)
        .await
        .unwrap();
    let inner = with_distribution("hi", &group, payload.clone());
    let parsed = InnerMessage::from_plaintext(&inner.to_plaintext().unwrap()).unwrap();
    assert_eq!(parsed.sender_key_distribution.unwrap().payload, payload);
    // Asking again returns the same chain.
    let again = alice
        .ctx
        .repository
        .sender_key_distribution(&group, &alice.primary)
        .await
        .unwrap();
    assert_eq!(again, payload);
}
