//! Pairwise encrypt/decrypt over a `SessionRecord`.
//!
//! Two message kinds exist on the wire:
//!   - `pkmsg`: carries the initiator's X3DH header plus a ratchet message.
//!     Sent until the initiator receives its first reply.
//!   - `msg`:   a bare ratchet message.
//!
//! Ratchet messages are XChaCha20-Poly1305 under the ratchet message key,
//! with the serialized ratchet header as associated data.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::{
    aead,
    error::CryptoError,
    identity::IdentityKeyPair,
    ratchet::{RatchetHeader, RatchetSession},
    session_record::{SessionRecord, SessionState},
    x3dh::{self, PreKeyBundle, PreKeyRecord, SignedPreKeyRecord, X3DHHeader},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PreKey,
    Whisper,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::PreKey => "pkmsg",
            MessageKind::Whisper => "msg",
        }
    }

    /// `None` for tags this library does not know.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "pkmsg" => Some(MessageKind::PreKey),
            "msg" => Some(MessageKind::Whisper),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CiphertextMessage {
    pub kind: MessageKind,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub header: RatchetHeader,
    /// base64url(nonce || ciphertext)
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeySignalMessage {
    pub x3dh: X3DHHeader,
    pub message: SignalMessage,
}

impl PreKeySignalMessage {
    pub fn parse(body: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(body)
            .map_err(|e| CryptoError::InvalidMessage(format!("pre-key message: {e}")))
    }
}

/// Local key material needed to answer a pre-key message.
pub struct LocalPreKeys<'a> {
    pub identity: &'a IdentityKeyPair,
    pub signed_pre_key: &'a SignedPreKeyRecord,
    /// The one-time pre-key the message references, if we still hold it.
    pub one_time_pre_key: Option<&'a PreKeyRecord>,
}

pub struct PreKeyDecryption {
    pub plaintext: Vec<u8>,
    /// One-time pre-key used by a fresh handshake; the caller deletes it.
    pub consumed_pre_key: Option<u32>,
    pub remote_identity: String,
}

// ── Session construction ─────────────────────────────────────────────────────

/// Build an outgoing session from a fetched bundle and make it current.
/// Returns the remote identity key recorded in the new state.
pub fn process_pre_key_bundle(
    record: &mut SessionRecord,
    my_identity: &IdentityKeyPair,
    my_registration_id: u32,
    bundle: &PreKeyBundle,
) -> Result<String, CryptoError> {
    let result = x3dh::initiate(my_identity, my_registration_id, bundle)?;
    let header = result.header.clone();
    let ratchet = RatchetSession::initiate(
        header.base_key.clone(),
        result.shared_key,
        &result.their_signed_pre_key,
    )?;
    record.promote_state(SessionState {
        ratchet,
        remote_identity: bundle.identity_key.clone(),
        remote_registration_id: bundle.registration_id,
        base_key: header.base_key.clone(),
        pending_pre_key: Some(header),
    });
    Ok(bundle.identity_key.clone())
}

// ── Encrypt ──────────────────────────────────────────────────────────────────

pub fn encrypt(record: &mut SessionRecord, plaintext: &[u8]) -> Result<CiphertextMessage, CryptoError> {
    let state = record.session_state_mut().ok_or(CryptoError::NoOpenSession)?;
    let (header, mk) = state.ratchet.encrypt_step()?;
    let aad = serde_json::to_vec(&header)?;
    let sealed = aead::encrypt(&mk, plaintext, &aad)?;
    let message = SignalMessage {
        header,
        ciphertext: URL_SAFE_NO_PAD.encode(sealed),
    };

    match &state.pending_pre_key {
        Some(x3dh) => Ok(CiphertextMessage {
            kind: MessageKind::PreKey,
            body: serde_json::to_vec(&PreKeySignalMessage {
                x3dh: x3dh.clone(),
                message,
            })?,
        }),
        None => Ok(CiphertextMessage {
            kind: MessageKind::Whisper,
            body: serde_json::to_vec(&message)?,
        }),
    }
}

// ── Decrypt ──────────────────────────────────────────────────────────────────

fn decrypt_with_state(state: &mut SessionState, message: &SignalMessage) -> Result<Vec<u8>, CryptoError> {
    let mk = state.ratchet.decrypt_step(&message.header)?;
    let aad = serde_json::to_vec(&message.header)?;
    let sealed = URL_SAFE_NO_PAD.decode(&message.ciphertext)?;
    let plaintext = aead::decrypt(&mk, &sealed, &aad)?;
    // The peer answered, so it has our session; stop sending pre-key messages.
    state.pending_pre_key = None;
    Ok(plaintext.to_vec())
}

fn decrypt_signal_message(
    record: &mut SessionRecord,
    message: &SignalMessage,
) -> Result<Vec<u8>, CryptoError> {
    let mut last_err = None;

    if let Some(current) = record.session_state() {
        let mut candidate = current.clone();
        match decrypt_with_state(&mut candidate, message) {
            Ok(pt) => {
                if let Some(slot) = record.session_state_mut() {
                    *slot = candidate;
                }
                return Ok(pt);
            }
            Err(e) => last_err = Some(e),
        }
    }

    let mut hit = None;
    for (index, previous) in record.previous_states().enumerate() {
        let mut candidate = previous.clone();
        match decrypt_with_state(&mut candidate, message) {
            Ok(pt) => {
                hit = Some((index, candidate, pt));
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    if let Some((index, state, pt)) = hit {
        tracing::debug!(index, "decrypted with archived session; promoting it");
        record.promote_previous(index, state);
        return Ok(pt);
    }

    Err(last_err.unwrap_or(CryptoError::NoOpenSession))
}

/// Decrypt an ordinary (`msg`) ratchet message.
pub fn decrypt_signal(record: &mut SessionRecord, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let message: SignalMessage = serde_json::from_slice(body)
        .map_err(|e| CryptoError::InvalidMessage(format!("ratchet message: {e}")))?;
    decrypt_signal_message(record, &message)
}

/// Decrypt a `pkmsg`, creating the responder session when the handshake is new.
pub fn decrypt_pre_key(
    record: &mut SessionRecord,
    message: &PreKeySignalMessage,
    local: &LocalPreKeys<'_>,
) -> Result<PreKeyDecryption, CryptoError> {
    // Retransmission of a handshake we already answered.
    if record.has_session_with_base_key(&message.x3dh.base_key) {
        let plaintext = decrypt_signal_message(record, &message.message)?;
        return Ok(PreKeyDecryption {
            plaintext,
            consumed_pre_key: None,
            remote_identity: message.x3dh.identity_key.clone(),
        });
    }

    if message.x3dh.signed_pre_key_id != local.signed_pre_key.id {
        return Err(CryptoError::UnknownSignedPreKey(message.x3dh.signed_pre_key_id));
    }

    let opk_secret = match (message.x3dh.pre_key_id, local.one_time_pre_key) {
        (Some(id), Some(opk)) if opk.id == id => Some(opk.secret()),
        (Some(id), _) => return Err(CryptoError::UnknownPreKey(id)),
        (None, _) => None,
    };

    let spk_secret = local.signed_pre_key.secret();
    let mut shared_key = x3dh::respond(local.identity, &spk_secret, opk_secret.as_ref(), &message.x3dh)?;
    let ratchet = RatchetSession::respond(message.x3dh.base_key.clone(), shared_key, &spk_secret);
    zeroize::Zeroize::zeroize(&mut shared_key);

    let mut state = SessionState {
        ratchet,
        remote_identity: message.x3dh.identity_key.clone(),
        remote_registration_id: message.x3dh.registration_id,
        base_key: message.x3dh.base_key.clone(),
        pending_pre_key: None,
    };
    let plaintext = decrypt_with_state(&mut state, &message.message)?;
    record.promote_state(state);

    Ok(PreKeyDecryption {
        plaintext,
        consumed_pre_key: message.x3dh.pre_key_id,
        remote_identity: message.x3dh.identity_key.clone(),
    })
}
