//! Signal session repository.
//!
//! Every operation that reads and rewrites a session record holds that
//! address's session lock and runs in a key-store transaction, so the
//! record, the consumed one-time pre-key and the peer identity commit
//! together. Group operations serialize on the sender-key name instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use dl_crypto::group_cipher::{self, SenderKeyDistributionMessage};
use dl_crypto::identity::IdentityKeyPair;
use dl_crypto::session_cipher::{self, LocalPreKeys, PreKeySignalMessage};
use dl_crypto::x3dh::{PreKeyBundle, PreKeyRecord, SignedPreKeyRecord};
use dl_crypto::{CryptoError, MessageKind, SenderKeyRecord, SessionRecord};
use dl_keystore::{KeyKind, KeyStore, MutationSet, QueuedMessage};
use dl_proto::{Address, Jid};

use crate::addressing::{sender_key_name, session_id, signal_address};
use crate::error::SignalError;
use crate::mapping::IdentityMappingStore;

/// Long-lived local key material.
pub struct SignalCredentials {
    pub identity: IdentityKeyPair,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    NoSession,
    /// Outgoing session whose pre-key message has not been answered yet.
    PendingPreKey,
    Valid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Address whose session encrypted the message.
    pub address: Address,
    pub kind: MessageKind,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEncryption {
    pub ciphertext: Vec<u8>,
    /// Present when the sender key was created for this message and must
    /// reach members before they can decrypt it.
    pub distribution: Option<Vec<u8>>,
}

enum GroupDecrypt {
    Done(Vec<u8>),
    Queued(QueuedMessage<SignalError>),
}

#[derive(Clone)]
pub struct SignalRepository {
    inner: Arc<RepositoryInner>,
}

struct RepositoryInner {
    keys: KeyStore,
    mappings: Arc<IdentityMappingStore>,
    credentials: SignalCredentials,
}

impl SignalRepository {
    pub fn new(keys: KeyStore, mappings: Arc<IdentityMappingStore>, credentials: SignalCredentials) -> Self {
        Self {
            inner: Arc::new(RepositoryInner {
                keys,
                mappings,
                credentials,
            }),
        }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.inner.keys
    }

    pub fn mappings(&self) -> &Arc<IdentityMappingStore> {
        &self.inner.mappings
    }

    pub fn registration_id(&self) -> u32 {
        self.inner.credentials.registration_id
    }

    pub fn identity_public_key(&self) -> String {
        self.inner.credentials.identity.public_b64()
    }

    /// Bundle advertising our identity, current signed pre-key and
    /// optionally one of our one-time pre-keys.
    pub fn local_bundle(&self, device_id: u32, pre_key: Option<&PreKeyRecord>) -> PreKeyBundle {
        let creds = &self.inner.credentials;
        PreKeyBundle::from_local(
            creds.registration_id,
            device_id,
            &creds.identity,
            &creds.signed_pre_key,
            pre_key,
        )
    }

    // ── Local key material ───────────────────────────────────────────────

    pub async fn store_pre_keys(&self, records: &[PreKeyRecord]) -> Result<(), SignalError> {
        let mut mutations = MutationSet::new();
        for record in records {
            mutations.put(KeyKind::PreKey, record.id.to_string(), record.serialize()?);
        }
        self.inner.keys.set(mutations).await?;
        Ok(())
    }

    /// Persist a signed pre-key so messages built against it still decrypt
    /// after rotation.
    pub async fn store_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), SignalError> {
        self.inner
            .keys
            .set(MutationSet::new().with(KeyKind::SignedPreKey, record.id.to_string(), record.serialize()?))
            .await?;
        Ok(())
    }

    async fn signed_pre_key(&self, id: u32) -> Result<SignedPreKeyRecord, SignalError> {
        let current = &self.inner.credentials.signed_pre_key;
        if current.id == id {
            return Ok(current.clone());
        }
        match self.inner.keys.get_one(KeyKind::SignedPreKey, &id.to_string()).await? {
            Some(bytes) => Ok(SignedPreKeyRecord::deserialize(&bytes)?),
            None => Err(SignalError::MissingSignedPreKey(id)),
        }
    }

    async fn one_time_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, SignalError> {
        match self.inner.keys.get_one(KeyKind::PreKey, &id.to_string()).await? {
            Some(bytes) => Ok(Some(PreKeyRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── Session records ──────────────────────────────────────────────────

    async fn load_session(&self, id: &str) -> Result<Option<SessionRecord>, SignalError> {
        match self.inner.keys.get_one(KeyKind::Session, id).await? {
            Some(bytes) => Ok(Some(SessionRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_session(&self, id: &str, record: &SessionRecord) -> Result<(), SignalError> {
        self.inner
            .keys
            .set(MutationSet::new().with(KeyKind::Session, id, record.serialize()?))
            .await?;
        Ok(())
    }

    /// Trust on first use: the first identity seen for an address is
    /// recorded; a different one later replaces it with a warning.
    async fn record_identity(&self, address: &Address, identity: &str) -> Result<(), SignalError> {
        let id = signal_address(address).to_string();
        let known = self.inner.keys.get_one(KeyKind::IdentityKey, &id).await?;
        match known {
            Some(existing) if existing == identity.as_bytes() => return Ok(()),
            Some(_) => warn!(address = %address, "identity key changed"),
            None => debug!(address = %address, "recording identity key"),
        }
        self.inner
            .keys
            .set(MutationSet::new().with(KeyKind::IdentityKey, id, identity.as_bytes().to_vec()))
            .await?;
        Ok(())
    }

    pub async fn identity_key(&self, address: &Address) -> Result<Option<String>, SignalError> {
        let id = signal_address(address).to_string();
        Ok(self
            .inner
            .keys
            .get_one(KeyKind::IdentityKey, &id)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn has_open_session(&self, address: &Address) -> Result<bool, SignalError> {
        Ok(self
            .load_session(&session_id(address))
            .await?
            .is_some_and(|record| record.has_open_session()))
    }

    pub async fn validate_session(&self, address: &Address) -> Result<SessionStatus, SignalError> {
        let Some(record) = self.load_session(&session_id(address)).await? else {
            return Ok(SessionStatus::NoSession);
        };
        Ok(match record.session_state() {
            None => SessionStatus::NoSession,
            Some(state) if state.has_pending_pre_key() => SessionStatus::PendingPreKey,
            Some(_) => SessionStatus::Valid,
        })
    }

    pub async fn delete_sessions(&self, addresses: &[Address]) -> Result<(), SignalError> {
        let ids: Vec<String> = addresses.iter().map(session_id).collect();
        let keys = &self.inner.keys;
        keys.with_session_locks(&ids, || {
            keys.transaction(|| async {
                let mut mutations = MutationSet::new();
                for id in &ids {
                    mutations.delete(KeyKind::Session, id.clone());
                }
                keys.set(mutations).await?;
                Ok::<_, SignalError>(())
            })
        })
        .await?;
        info!(count = ids.len(), "deleted sessions");
        Ok(())
    }

    // ── Pairwise ─────────────────────────────────────────────────────────

    /// Build an outgoing session from a fetched pre-key bundle.
    pub async fn inject_e2e_session(&self, address: &Address, bundle: &PreKeyBundle) -> Result<(), SignalError> {
        let id = session_id(address);
        let keys = &self.inner.keys;
        keys.with_session_locks(std::slice::from_ref(&id), || {
            keys.transaction(|| async {
                let mut record = self.load_session(&id).await?.unwrap_or_default();
                let creds = &self.inner.credentials;
                let remote_identity = session_cipher::process_pre_key_bundle(
                    &mut record,
                    &creds.identity,
                    creds.registration_id,
                    bundle,
                )?;
                self.record_identity(address, &remote_identity).await?;
                self.store_session(&id, &record).await?;
                Ok::<_, SignalError>(())
            })
        })
        .await?;
        debug!(address = %address, "injected session from bundle");
        Ok(())
    }

    /// Decrypt a pairwise `pkmsg` or `msg` payload from `address`.
    pub async fn decrypt_message(&self, address: &Address, kind: &str, ciphertext: &[u8]) -> Result<Vec<u8>, SignalError> {
        let kind = MessageKind::parse(kind).ok_or_else(|| SignalError::UnknownMessageKind(kind.to_string()))?;
        let id = session_id(address);
        let keys = &self.inner.keys;
        keys.with_session_locks(std::slice::from_ref(&id), || {
            keys.transaction(|| async {
                let mut record = self.load_session(&id).await?.unwrap_or_default();
                let plaintext = match kind {
                    MessageKind::PreKey => self.decrypt_pre_key_locked(address, &mut record, ciphertext).await?,
                    MessageKind::Whisper => {
                        if !record.has_open_session() {
                            return Err(SignalError::SessionAbsent(address.to_string()));
                        }
                        session_cipher::decrypt_signal(&mut record, ciphertext)?
                    }
                };
                self.store_session(&id, &record).await?;
                Ok::<_, SignalError>(plaintext)
            })
        })
        .await
    }

    async fn decrypt_pre_key_locked(
        &self,
        address: &Address,
        record: &mut SessionRecord,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        let message = PreKeySignalMessage::parse(ciphertext)?;
        let signed_pre_key = self.signed_pre_key(message.x3dh.signed_pre_key_id).await?;
        let one_time = match message.x3dh.pre_key_id {
            Some(pre_key_id) => self.one_time_pre_key(pre_key_id).await?,
            None => None,
        };
        let decrypted = session_cipher::decrypt_pre_key(
            record,
            &message,
            &LocalPreKeys {
                identity: &self.inner.credentials.identity,
                signed_pre_key: &signed_pre_key,
                one_time_pre_key: one_time.as_ref(),
            },
        )?;
        if let Some(pre_key_id) = decrypted.consumed_pre_key {
            debug!(pre_key_id, "consumed one-time pre-key");
            self.inner
                .keys
                .set(MutationSet::new().without(KeyKind::PreKey, pre_key_id.to_string()))
                .await?;
        }
        self.record_identity(address, &decrypted.remote_identity).await?;
        Ok(decrypted.plaintext)
    }

    /// Encrypt for `address`, preferring its alternate identity when one is
    /// mapped and holds a live session.
    pub async fn encrypt_message(&self, address: &Address, plaintext: &[u8]) -> Result<EncryptedMessage, SignalError> {
        let target = self.encryption_target(address).await?;
        let id = session_id(&target);
        let keys = &self.inner.keys;
        let message = keys
            .with_session_locks(std::slice::from_ref(&id), || {
                keys.transaction(|| async {
                    let mut record = match self.load_session(&id).await? {
                        Some(record) if record.has_open_session() => record,
                        _ => return Err(SignalError::SessionAbsent(target.to_string())),
                    };
                    let message = session_cipher::encrypt(&mut record, plaintext)?;
                    self.store_session(&id, &record).await?;
                    Ok::<_, SignalError>(message)
                })
            })
            .await?;
        Ok(EncryptedMessage {
            address: target,
            kind: message.kind,
            ciphertext: message.body,
        })
    }

    async fn encryption_target(&self, address: &Address) -> Result<Address, SignalError> {
        if address.is_alternate() {
            return Ok(address.clone());
        }
        if let Some(alternate) = self.inner.mappings.get_alternate_for_primary(address).await? {
            if self.has_open_session(&alternate).await? {
                return Ok(alternate);
            }
        }
        Ok(address.clone())
    }

    // ── Group ────────────────────────────────────────────────────────────

    async fn load_sender_key(&self, name: &str) -> Result<SenderKeyRecord, SignalError> {
        match self.inner.keys.get_one(KeyKind::SenderKey, name).await? {
            Some(bytes) => Ok(SenderKeyRecord::deserialize(&bytes)?),
            None => Ok(SenderKeyRecord::default()),
        }
    }

    async fn store_sender_key(&self, name: &str, record: &SenderKeyRecord) -> Result<(), SignalError> {
        self.inner
            .keys
            .set(MutationSet::new().with(KeyKind::SenderKey, name, record.serialize()?))
            .await?;
        Ok(())
    }

    /// Our distribution message for `group`, creating our sender key if
    /// we have none yet.
    pub async fn sender_key_distribution(&self, group: &Jid, me: &Address) -> Result<Vec<u8>, SignalError> {
        let name = sender_key_name(group, me).to_string();
        let keys = &self.inner.keys;
        keys.with_sender_key_lock(&name, || {
            keys.transaction(|| async {
                let mut record = self.load_sender_key(&name).await?;
                let created = record.is_empty();
                let message = group_cipher::create_distribution_message(&mut record)?;
                if created {
                    self.store_sender_key(&name, &record).await?;
                }
                Ok::<_, SignalError>(message.serialize()?)
            })
        })
        .await
    }

    pub async fn encrypt_group_message(
        &self,
        group: &Jid,
        me: &Address,
        plaintext: &[u8],
    ) -> Result<GroupEncryption, SignalError> {
        let name = sender_key_name(group, me).to_string();
        let keys = &self.inner.keys;
        keys.with_sender_key_lock(&name, || {
            keys.transaction(|| async {
                let mut record = self.load_sender_key(&name).await?;
                let distribution = if record.is_empty() {
                    info!(sender_key = %name, "creating sender key");
                    Some(group_cipher::create_distribution_message(&mut record)?.serialize()?)
                } else {
                    None
                };
                let ciphertext = group_cipher::group_encrypt(&mut record, plaintext)?;
                self.store_sender_key(&name, &record).await?;
                Ok::<_, SignalError>(GroupEncryption {
                    ciphertext,
                    distribution,
                })
            })
        })
        .await
    }

    /// Store a peer's sender key. Committing it releases any group
    /// messages queued for the same sender-key name.
    pub async fn process_sender_key_distribution(
        &self,
        group: &Jid,
        author: &Address,
        payload: &[u8],
    ) -> Result<(), SignalError> {
        let message = SenderKeyDistributionMessage::deserialize(payload)?;
        let name = sender_key_name(group, author).to_string();
        let keys = &self.inner.keys;
        keys.with_sender_key_lock(&name, || {
            keys.transaction(|| async {
                let mut record = self.load_sender_key(&name).await?;
                group_cipher::process_distribution_message(&mut record, &message)?;
                self.store_sender_key(&name, &record).await?;
                Ok::<_, SignalError>(())
            })
        })
        .await?;
        debug!(sender_key = %name, key_id = message.key_id, "stored sender key");
        Ok(())
    }

    /// Decrypt a group message. If the author's sender key is not known yet
    /// the message waits until it arrives or the queue times out.
    pub async fn decrypt_group_message(
        &self,
        group: &Jid,
        author: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        let name = sender_key_name(group, author).to_string();
        let keys = &self.inner.keys;
        let attempt = keys
            .with_sender_key_lock(&name, || {
                keys.transaction(|| async {
                    let mut record = self.load_sender_key(&name).await?;
                    if record.is_empty() {
                        // Registered while the lock is held so a concurrent
                        // distribution cannot slip in between.
                        let repo = self.clone();
                        let (group, author) = (group.clone(), author.clone());
                        let waiter = keys.enqueue_group_message(&name, ciphertext.to_vec(), move |ct| async move {
                            repo.decrypt_group_now(&group, &author, &ct).await
                        });
                        return Ok(GroupDecrypt::Queued(waiter));
                    }
                    let plaintext = group_cipher::group_decrypt(&mut record, ciphertext)?;
                    self.store_sender_key(&name, &record).await?;
                    Ok::<_, SignalError>(GroupDecrypt::Done(plaintext))
                })
            })
            .await?;

        match attempt {
            GroupDecrypt::Done(plaintext) => Ok(plaintext),
            GroupDecrypt::Queued(waiter) => {
                debug!(sender_key = %name, "sender key missing; message queued");
                waiter.wait().await
            }
        }
    }

    /// Decrypt without queueing; used to replay queued messages.
    async fn decrypt_group_now(&self, group: &Jid, author: &Address, ciphertext: &[u8]) -> Result<Vec<u8>, SignalError> {
        let name = sender_key_name(group, author).to_string();
        let keys = &self.inner.keys;
        keys.with_sender_key_lock(&name, || {
            keys.transaction(|| async {
                let mut record = self.load_sender_key(&name).await?;
                if record.is_empty() {
                    return Err(CryptoError::NoSenderKeyState(0).into());
                }
                let plaintext = group_cipher::group_decrypt(&mut record, ciphertext)?;
                self.store_sender_key(&name, &record).await?;
                Ok::<_, SignalError>(plaintext)
            })
        })
        .await
    }

    // ── Sender-key memory ────────────────────────────────────────────────

    /// Devices of `participants` that have not been sent our sender key
    /// for `group`.
    pub async fn devices_missing_sender_key(
        &self,
        group: &Jid,
        participants: &[Address],
    ) -> Result<Vec<Address>, SignalError> {
        let memory = self.sender_key_memory(group).await?;
        Ok(participants
            .iter()
            .filter(|p| !memory.get(&p.to_string()).copied().unwrap_or(false))
            .cloned()
            .collect())
    }

    pub async fn mark_sender_key_distributed(&self, group: &Jid, participants: &[Address]) -> Result<(), SignalError> {
        let group_id = group.bare().to_string();
        let keys = &self.inner.keys;
        keys.transaction(|| async {
            let mut memory = self.sender_key_memory(group).await?;
            for participant in participants {
                memory.insert(participant.to_string(), true);
            }
            keys.set(MutationSet::new().with(KeyKind::SenderKeyMemory, group_id.clone(), serde_json::to_vec(&memory)?))
                .await?;
            Ok::<_, SignalError>(())
        })
        .await
    }

    /// Forget who holds our sender key, e.g. after membership changes.
    pub async fn reset_sender_key_memory(&self, group: &Jid) -> Result<(), SignalError> {
        self.inner
            .keys
            .set(MutationSet::new().without(KeyKind::SenderKeyMemory, group.bare().to_string()))
            .await?;
        Ok(())
    }

    async fn sender_key_memory(&self, group: &Jid) -> Result<BTreeMap<String, bool>, SignalError> {
        match self
            .inner
            .keys
            .get_one(KeyKind::SenderKeyMemory, &group.bare().to_string())
            .await?
        {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(BTreeMap::new()),
        }
    }
}
