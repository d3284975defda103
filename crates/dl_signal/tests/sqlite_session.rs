mod common;

use std::sync::Arc;

use dl_crypto::identity::IdentityKeyPair;
use dl_crypto::x3dh::SignedPreKeyRecord;
use dl_keystore::{SqliteStore, Vault};
use dl_proto::{Jid, MessageStanza, Server};
use dl_signal::{LocalAccount, SignalContext, SignalCredentials};

use common::*;

async fn sqlite_context(dir: &tempfile::TempDir) -> SignalContext {
    let vault = Vault::new();
    vault.unlock_with_key([7u8; 32]).await;
    let store = SqliteStore::open(&dir.path().join("keys.db"), vault).await.unwrap();

    let identity = IdentityKeyPair::generate();
    let signed_pre_key = SignedPreKeyRecord::generate(&identity, 1);
    SignalContext::start(
        Arc::new(store),
        SignalCredentials {
            identity,
            registration_id: 33,
            signed_pre_key,
        },
        LocalAccount::new(Jid::new("300", Server::Primary), None),
        config(),
    )
}

#[tokio::test]
async fn sessions_persist_through_the_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let carol = sqlite_context(&dir).await;
    let alice = device("100", "9100", 1);
    let carol_addr = dl_proto::Address::primary("300", 0);

    let pre_keys = dl_crypto::x3dh::generate_pre_keys(1, 1);
    carol.repository.store_pre_keys(&pre_keys).await.unwrap();
    let bundle = carol.repository.local_bundle(0, pre_keys.first());
    alice.ctx.repository.inject_e2e_session(&carol_addr, &bundle).await.unwrap();

    for (i, text) in ["first", "second", "third"].into_iter().enumerate() {
        let item = seal_text(&alice, &carol_addr, text).await;
        let stanza = MessageStanza::new(format!("m{i}"), alice.primary_jid()).with_item(item);
        let envelope = carol.receive(&stanza).await.unwrap();
        assert_eq!(envelope.stub, None, "{text}");
        assert_eq!(envelope.decrypted().next().map(text_of), Some(text.to_string()));
    }
    assert!(carol.repository.has_open_session(&alice.primary).await.unwrap());
}
