//! Stanza → envelope.
//!
//! Stanza-level problems (classification, addressing) fail the whole
//! stanza. Anything that goes wrong with one item is recorded on that
//! item and its siblings carry on.

use std::sync::Arc;

use tracing::{debug, warn};

use dl_proto::{
    Address, EncItem, InnerMessage, ItemOutcome, Jid, MessageCategory, MessageEnvelope, MessageKey, MessageStanza,
    StubMarker,
};

use crate::error::SignalError;
use crate::mapping::IdentityMappingStore;
use crate::pipeline::classify::{classify, LocalAccount};
use crate::pipeline::resolve::resolve_decrypt_address;
use crate::repository::SignalRepository;

const GROUP_KIND: &str = "skmsg";
const PLAINTEXT_KIND: &str = "plaintext";

#[derive(Clone)]
pub struct DecodePipeline {
    repository: SignalRepository,
    account: Arc<LocalAccount>,
}

fn stub_for(items: &[ItemOutcome]) -> Option<StubMarker> {
    if items.is_empty() {
        Some(StubMarker::Absent)
    } else if items.iter().all(ItemOutcome::is_failed) {
        Some(StubMarker::DecryptionFailed)
    } else {
        None
    }
}

fn outcome(kind: &str, result: Result<Vec<u8>, SignalError>) -> ItemOutcome {
    match result {
        Ok(content) => ItemOutcome::Decrypted {
            kind: kind.to_string(),
            content,
        },
        Err(e) => {
            let error = SignalError::DecryptionFailure(e.to_string());
            warn!(kind, error = %e, "item failed to decrypt");
            ItemOutcome::Failed {
                kind: kind.to_string(),
                error: error.to_string(),
            }
        }
    }
}

impl DecodePipeline {
    pub fn new(repository: SignalRepository, account: LocalAccount) -> Self {
        Self {
            repository,
            account: Arc::new(account),
        }
    }

    pub fn account(&self) -> &LocalAccount {
        &self.account
    }

    fn mappings(&self) -> &IdentityMappingStore {
        self.repository.mappings()
    }

    pub async fn decode(&self, stanza: &MessageStanza) -> Result<MessageEnvelope, SignalError> {
        let classified = classify(stanza, &self.account)?;
        let key = MessageKey {
            id: stanza.id.clone(),
            remote_jid: classified.chat.clone(),
            from_me: classified.from_me,
            participant: classified
                .category
                .has_author_participant()
                .then(|| classified.author.clone()),
        };

        if classified.category == MessageCategory::Newsletter {
            let items: Vec<ItemOutcome> = stanza.items.iter().map(newsletter_item).collect();
            return Ok(MessageEnvelope {
                key,
                category: classified.category,
                author: classified.author,
                decrypt_address: None,
                timestamp: stanza.timestamp,
                stub: stub_for(&items),
                items,
                migration: None,
            });
        }

        let author = classified.author.to_address()?;
        self.learn_from_hints(&author, stanza).await;
        let resolution = resolve_decrypt_address(&self.repository, self.mappings(), &author, stanza).await?;
        debug!(
            id = %stanza.id,
            category = ?classified.category,
            address = %resolution.address,
            source = ?resolution.source,
            "resolved decrypt address"
        );

        // Pairwise items first: they may carry the sender key the group
        // items in the same stanza need.
        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; stanza.items.len()];
        for (index, item) in stanza.items.iter().enumerate() {
            if item.kind != GROUP_KIND {
                let result = self.decrypt_pairwise(&resolution.address, &author, item).await;
                outcomes[index] = Some(outcome(&item.kind, result));
            }
        }
        for (index, item) in stanza.items.iter().enumerate() {
            if item.kind == GROUP_KIND {
                let result = self.decrypt_group(&classified.chat, classified.category, &author, item).await;
                outcomes[index] = Some(outcome(&item.kind, result));
            }
        }
        let items: Vec<ItemOutcome> = outcomes.into_iter().flatten().collect();

        Ok(MessageEnvelope {
            key,
            category: classified.category,
            author: classified.author,
            decrypt_address: Some(resolution.address),
            timestamp: stanza.timestamp,
            stub: stub_for(&items),
            items,
            migration: resolution.migration,
        })
    }

    async fn decrypt_pairwise(&self, address: &Address, author: &Address, item: &EncItem) -> Result<Vec<u8>, SignalError> {
        let plaintext = self
            .repository
            .decrypt_message(address, &item.kind, &item.ciphertext)
            .await?;
        self.open_inner(author, &plaintext).await
    }

    async fn decrypt_group(
        &self,
        chat: &Jid,
        category: MessageCategory,
        author: &Address,
        item: &EncItem,
    ) -> Result<Vec<u8>, SignalError> {
        if !category.has_author_participant() {
            return Err(SignalError::MalformedAddressPair(format!(
                "group item in a {category:?} stanza"
            )));
        }
        let plaintext = self
            .repository
            .decrypt_group_message(chat, author, &item.ciphertext)
            .await?;
        self.open_inner(author, &plaintext).await
    }

    /// Unpad, parse, and store any piggy-backed sender key.
    async fn open_inner(&self, author: &Address, plaintext: &[u8]) -> Result<Vec<u8>, SignalError> {
        let inner = InnerMessage::from_plaintext(plaintext)?;
        if let Some(distribution) = &inner.sender_key_distribution {
            match distribution.group_id.parse::<Jid>() {
                Ok(group) => {
                    if let Err(e) = self
                        .repository
                        .process_sender_key_distribution(&group, author, &distribution.payload)
                        .await
                    {
                        warn!(group = %group, author = %author, error = %e, "could not store sender key");
                    }
                }
                Err(e) => warn!(group = %distribution.group_id, error = %e, "sender key for unparseable group"),
            }
        }
        Ok(inner.content)
    }

    /// Record correlations the server volunteered. Failures here never
    /// affect decryption.
    async fn learn_from_hints(&self, author: &Address, stanza: &MessageStanza) {
        let counterpart = if author.is_primary() {
            stanza.alternate_hint.as_ref()
        } else {
            stanza.primary_hint.as_ref()
        };
        if let Some(hint) = counterpart.and_then(|jid| jid.to_address().ok()) {
            let hint = Address {
                device: author.device,
                ..hint
            };
            if let Err(e) = self.mappings().store_mapping(author, &hint).await {
                warn!(author = %author, hint = %hint, error = %e, "ignoring identity hint");
            }
        }
        if author.is_primary() {
            if let Err(e) = self.mappings().record_devices(&author.user, &[author.device]).await {
                warn!(user = %author.user, error = %e, "could not record device");
            }
        }
    }
}

fn newsletter_item(item: &EncItem) -> ItemOutcome {
    if item.kind == PLAINTEXT_KIND {
        outcome(&item.kind, Ok(item.ciphertext.clone()))
    } else {
        outcome(&item.kind, Err(SignalError::UnknownMessageKind(item.kind.clone())))
    }
}
