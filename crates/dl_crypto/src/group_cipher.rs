//! Group encrypt/decrypt over a `SenderKeyRecord`.
//!
//! Bodies are AES-256-GCM under the sender message key; every message is
//! signed with the chain's Ed25519 key and verified before decryption.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{
    aead,
    error::CryptoError,
    identity::IdentityKeyPair,
    sender_keys::{
        SenderChainKey, SenderKeyRecord, SenderKeyState, SenderMessageKey, MAX_FORWARD_JUMPS,
    },
    x3dh::{b64d, to_32},
};

/// Hands a chain to other group members over pairwise sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistributionMessage {
    pub key_id: u32,
    pub iteration: u32,
    /// base64 chain seed at `iteration`
    pub chain_key: String,
    /// base64 Ed25519 public key
    pub signing_key: String,
}

impl SenderKeyDistributionMessage {
    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::InvalidMessage(format!("sender key distribution: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyMessage {
    pub key_id: u32,
    pub iteration: u32,
    pub ciphertext: String,
    pub signature: String,
}

fn signed_bytes(key_id: u32, iteration: u32, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + ciphertext.len());
    out.extend_from_slice(&key_id.to_be_bytes());
    out.extend_from_slice(&iteration.to_be_bytes());
    out.extend_from_slice(ciphertext);
    out
}

/// Distribution message for our newest chain, creating the chain if the
/// record is empty.
pub fn create_distribution_message(
    record: &mut SenderKeyRecord,
) -> Result<SenderKeyDistributionMessage, CryptoError> {
    if record.is_empty() {
        let key_id = OsRng.next_u32() & 0x7fff_ffff;
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing = IdentityKeyPair::generate();
        record.add_state(SenderKeyState::new(
            key_id,
            SenderChainKey::new(0, seed),
            signing.public_b64(),
            Some(*signing.secret_bytes()),
        ));
        tracing::debug!(key_id, "created sender key chain");
    }

    let state = record
        .newest_state()
        .ok_or(CryptoError::NoSenderKeyState(0))?;
    Ok(SenderKeyDistributionMessage {
        key_id: state.key_id,
        iteration: state.chain_key.iteration,
        chain_key: URL_SAFE_NO_PAD.encode(state.chain_key.seed()),
        signing_key: state.signing_public.clone(),
    })
}

pub fn process_distribution_message(
    record: &mut SenderKeyRecord,
    message: &SenderKeyDistributionMessage,
) -> Result<(), CryptoError> {
    let seed = to_32(&b64d(&message.chain_key)?)?;
    // Reject keys that cannot verify anything before storing them.
    to_32(&b64d(&message.signing_key)?)?;
    record.add_state(SenderKeyState::new(
        message.key_id,
        SenderChainKey::new(message.iteration, seed),
        message.signing_key.clone(),
        None,
    ));
    Ok(())
}

pub fn group_encrypt(record: &mut SenderKeyRecord, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let state = record
        .newest_state_mut()
        .ok_or(CryptoError::NoSenderKeyState(0))?;
    let signer = IdentityKeyPair::from_bytes(
        state
            .signing_private()
            .ok_or_else(|| CryptoError::InvalidKey("sender key chain is not ours".into()))?,
    )?;

    let mk = state.chain_key.message_key()?;
    let ciphertext = aead::seal_with_iv(&mk.cipher_key, &mk.iv, plaintext)?;
    let signature = signer.sign(&signed_bytes(state.key_id, mk.iteration, &ciphertext));
    state.chain_key = state.chain_key.next()?;

    Ok(serde_json::to_vec(&SenderKeyMessage {
        key_id: state.key_id,
        iteration: mk.iteration,
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        signature: URL_SAFE_NO_PAD.encode(signature),
    })?)
}

fn sender_message_key(
    state: &mut SenderKeyState,
    iteration: u32,
) -> Result<SenderMessageKey, CryptoError> {
    let current = state.chain_key.iteration;
    if current > iteration {
        return state
            .take_message_key(iteration)?
            .ok_or(CryptoError::DuplicateSenderKeyMessage { iteration });
    }

    let jump = iteration - current;
    if jump > MAX_FORWARD_JUMPS {
        return Err(CryptoError::SenderKeyTooFarAhead { jump });
    }

    let mut chain = state.chain_key.clone();
    while chain.iteration < iteration {
        state.add_message_key(&chain.message_key()?);
        chain = chain.next()?;
    }
    state.chain_key = chain.next()?;
    chain.message_key()
}

pub fn group_decrypt(record: &mut SenderKeyRecord, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let message: SenderKeyMessage = serde_json::from_slice(body)
        .map_err(|e| CryptoError::InvalidMessage(format!("sender key message: {e}")))?;
    let state = record
        .state_for_key_id_mut(message.key_id)
        .ok_or(CryptoError::NoSenderKeyState(message.key_id))?;

    let ciphertext = b64d(&message.ciphertext)?;
    let signature = b64d(&message.signature)?;
    let signing_key = b64d(&state.signing_public)?;
    IdentityKeyPair::verify(
        &signing_key,
        &signed_bytes(message.key_id, message.iteration, &ciphertext),
        &signature,
    )?;

    let mk = sender_message_key(state, message.iteration)?;
    aead::open_with_iv(&mk.cipher_key, &mk.iv, &ciphertext)
}
