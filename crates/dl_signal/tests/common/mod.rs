#![allow(dead_code)]

use std::sync::Arc;

use dl_crypto::identity::IdentityKeyPair;
use dl_crypto::x3dh::{generate_pre_keys, PreKeyBundle, SignedPreKeyRecord};
use dl_keystore::{KeyKind, MemoryStore};
use dl_proto::message::SenderKeyDistribution;
use dl_proto::{Address, EncItem, InnerMessage, Jid, MessageStanza, Server};
use dl_signal::telemetry::init_tracing;
use dl_signal::{session_id, LocalAccount, SignalConfig, SignalContext, SignalCredentials};

pub struct Device {
    pub store: Arc<MemoryStore>,
    pub ctx: SignalContext,
    pub primary: Address,
    pub alternate: Address,
}

impl Device {
    pub fn primary_jid(&self) -> Jid {
        self.primary.to_jid()
    }

    pub fn alternate_jid(&self) -> Jid {
        self.alternate.to_jid()
    }

    pub fn has_stored_session(&self, address: &Address) -> bool {
        self.store.contains(KeyKind::Session, &session_id(address))
    }
}

pub fn config() -> SignalConfig {
    let mut config = SignalConfig::default();
    config.keystore.commit_retry_delay_ms = 10;
    config.keystore.sender_key_queue_timeout_ms = 30_000;
    config
}

pub fn device(primary_user: &str, alternate_user: &str, registration_id: u32) -> Device {
    device_with_config(primary_user, alternate_user, registration_id, config())
}

pub fn device_with_config(primary_user: &str, alternate_user: &str, registration_id: u32, config: SignalConfig) -> Device {
    init_tracing("dl_signal=debug,dl_keystore=info");
    let identity = IdentityKeyPair::generate();
    let signed_pre_key = SignedPreKeyRecord::generate(&identity, 1);
    let credentials = SignalCredentials {
        identity,
        registration_id,
        signed_pre_key,
    };
    let account = LocalAccount::new(
        Jid::new(primary_user, Server::Primary),
        Some(Jid::new(alternate_user, Server::Alternate)),
    );
    let store = Arc::new(MemoryStore::new());
    let ctx = SignalContext::start(store.clone(), credentials, account, config);
    Device {
        store,
        ctx,
        primary: Address::primary(primary_user, 0),
        alternate: Address::alternate(alternate_user, 0),
    }
}

/// Publish one fresh one-time pre-key on `device` and return its bundle.
pub async fn bundle(device: &Device, pre_key_id: u32) -> PreKeyBundle {
    let pre_keys = generate_pre_keys(pre_key_id, 1);
    device.ctx.repository.store_pre_keys(&pre_keys).await.unwrap();
    device.ctx.repository.local_bundle(0, pre_keys.first())
}

/// Encrypt `inner` from `from` to `to`, as a stanza item.
pub async fn seal(from: &Device, to: &Address, inner: &InnerMessage) -> EncItem {
    let plaintext = inner.to_plaintext().unwrap();
    let message = from.ctx.repository.encrypt_message(to, &plaintext).await.unwrap();
    EncItem::new(message.kind.as_str(), message.ciphertext)
}

pub async fn seal_text(from: &Device, to: &Address, text: &str) -> EncItem {
    seal(from, to, &InnerMessage::text(text)).await
}

/// `sender` opens a session to `receiver`'s `receiver_addr` and the
/// receiver answers under `sender_addr`, leaving both sides with a
/// confirmed session.
pub async fn establish(sender: &Device, receiver: &Device, receiver_addr: &Address, sender_addr: &Address) {
    let bundle = bundle(receiver, 1).await;
    sender.ctx.repository.inject_e2e_session(receiver_addr, &bundle).await.unwrap();

    let first = seal_text(sender, receiver_addr, "hello").await;
    receiver
        .ctx
        .repository
        .decrypt_message(sender_addr, &first.kind, &first.ciphertext)
        .await
        .unwrap();

    let reply = seal_text(receiver, sender_addr, "hi back").await;
    sender
        .ctx
        .repository
        .decrypt_message(receiver_addr, &reply.kind, &reply.ciphertext)
        .await
        .unwrap();
}

pub fn chat_stanza(id: &str, from: Jid) -> MessageStanza {
    MessageStanza::new(id, from)
}

pub fn group() -> Jid {
    Jid::new("family", Server::Group)
}

pub fn with_distribution(text: &str, group: &Jid, payload: Vec<u8>) -> InnerMessage {
    InnerMessage {
        content: text.as_bytes().to_vec(),
        sender_key_distribution: Some(SenderKeyDistribution {
            group_id: group.to_string(),
            payload,
        }),
    }
}

pub fn text_of(inner_content: &[u8]) -> String {
    String::from_utf8(inner_content.to_vec()).unwrap()
}
