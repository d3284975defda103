//! Sender-key chain state for group messaging.
//!
//! Each (group, author device) pair owns a symmetric chain:
//!
//!   message seed  = HMAC-SHA256(chain_seed, 0x01)
//!   next chain    = HMAC-SHA256(chain_seed, 0x02)
//!   key material  = HKDF(message seed, salt = 0, info = "WhisperGroup") → 48 bytes
//!                   [0..16) IV, [16..48) AES-256 key
//!
//! The iteration counter drives forward-ratchet decisions on decrypt.

use std::collections::VecDeque;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{error::CryptoError, kdf};

/// Furthest the receiving chain may be advanced by a single message.
pub const MAX_FORWARD_JUMPS: u32 = 2000;
/// Skipped message keys retained per state.
pub const MAX_MESSAGE_KEYS: usize = 2000;
/// States retained per record; a sender rotating keys keeps older ones briefly.
pub const MAX_SENDER_KEY_STATES: usize = 5;

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;
const SENDER_KEY_INFO: &[u8] = b"WhisperGroup";

type HmacSha256 = Hmac<Sha256>;

fn hmac_byte(key: &[u8; 32], byte: u8) -> Result<[u8; 32], CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[byte]);
    Ok(mac.finalize().into_bytes().into())
}

// ── Chain key ────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct SenderChainKey {
    pub iteration: u32,
    seed: [u8; 32],
}

impl Drop for SenderChainKey {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl SenderChainKey {
    pub fn new(iteration: u32, seed: [u8; 32]) -> Self {
        Self { iteration, seed }
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    pub fn next(&self) -> Result<Self, CryptoError> {
        let iteration = self
            .iteration
            .checked_add(1)
            .ok_or_else(|| CryptoError::RatchetStep("sender chain exhausted".into()))?;
        Ok(Self::new(iteration, hmac_byte(&self.seed, CHAIN_KEY_SEED)?))
    }

    pub fn message_key(&self) -> Result<SenderMessageKey, CryptoError> {
        SenderMessageKey::derive(self.iteration, hmac_byte(&self.seed, MESSAGE_KEY_SEED)?)
    }
}

// ── Message key ──────────────────────────────────────────────────────────────

/// Per-message key material. Only the seed is persisted; IV and cipher
/// key are re-derived on load.
pub struct SenderMessageKey {
    pub iteration: u32,
    pub iv: [u8; 16],
    pub cipher_key: [u8; 32],
    seed: [u8; 32],
}

impl Drop for SenderMessageKey {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.cipher_key.zeroize();
        self.seed.zeroize();
    }
}

impl SenderMessageKey {
    pub fn derive(iteration: u32, seed: [u8; 32]) -> Result<Self, CryptoError> {
        let mut blocks = kdf::derive_secrets(&seed, &[0u8; 32], SENDER_KEY_INFO, 2)?;
        let mut material = [0u8; 64];
        material[..32].copy_from_slice(&blocks[0]);
        material[32..].copy_from_slice(&blocks[1]);
        blocks.iter_mut().for_each(|b| b.zeroize());

        let mut iv = [0u8; 16];
        let mut cipher_key = [0u8; 32];
        iv.copy_from_slice(&material[..16]);
        cipher_key.copy_from_slice(&material[16..48]);
        material.zeroize();

        Ok(Self {
            iteration,
            iv,
            cipher_key,
            seed,
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredMessageKey {
    iteration: u32,
    seed: [u8; 32],
}

impl Drop for StoredMessageKey {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

// ── State / record ───────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    pub key_id: u32,
    pub chain_key: SenderChainKey,
    /// Ed25519 public key that signs every message of this chain (base64)
    pub signing_public: String,
    /// Present only for our own chains.
    signing_private: Option<[u8; 32]>,
    message_keys: VecDeque<StoredMessageKey>,
}

impl Drop for SenderKeyState {
    fn drop(&mut self) {
        if let Some(secret) = self.signing_private.as_mut() {
            secret.zeroize();
        }
    }
}

impl SenderKeyState {
    pub fn new(
        key_id: u32,
        chain_key: SenderChainKey,
        signing_public: String,
        signing_private: Option<[u8; 32]>,
    ) -> Self {
        Self {
            key_id,
            chain_key,
            signing_public,
            signing_private,
            message_keys: VecDeque::new(),
        }
    }

    pub fn signing_private(&self) -> Option<&[u8; 32]> {
        self.signing_private.as_ref()
    }

    pub fn add_message_key(&mut self, key: &SenderMessageKey) {
        self.message_keys.push_back(StoredMessageKey {
            iteration: key.iteration,
            seed: key.seed,
        });
        while self.message_keys.len() > MAX_MESSAGE_KEYS {
            self.message_keys.pop_front();
        }
    }

    pub fn take_message_key(&mut self, iteration: u32) -> Result<Option<SenderMessageKey>, CryptoError> {
        match self.message_keys.iter().position(|k| k.iteration == iteration) {
            Some(pos) => match self.message_keys.remove(pos) {
                Some(stored) => Ok(Some(SenderMessageKey::derive(stored.iteration, stored.seed)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    /// Newest first.
    states: VecDeque<SenderKeyState>,
}

impl SenderKeyRecord {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn newest_state(&self) -> Option<&SenderKeyState> {
        self.states.front()
    }

    pub fn newest_state_mut(&mut self) -> Option<&mut SenderKeyState> {
        self.states.front_mut()
    }

    pub fn state_for_key_id_mut(&mut self, key_id: u32) -> Option<&mut SenderKeyState> {
        self.states.iter_mut().find(|s| s.key_id == key_id)
    }

    /// Insert a state as newest, replacing any state with the same key id.
    pub fn add_state(&mut self, state: SenderKeyState) {
        self.states.retain(|s| s.key_id != state.key_id);
        self.states.push_front(state);
        self.states.truncate(MAX_SENDER_KEY_STATES);
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
