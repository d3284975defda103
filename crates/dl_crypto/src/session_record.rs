//! Persisted per-address session state.
//!
//! A record holds the active session plus a bounded history of archived
//! sessions. Archived sessions still decrypt late messages that were sent
//! before the peer switched to a newer handshake.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{error::CryptoError, ratchet::RatchetSession, x3dh::X3DHHeader};

/// Archived sessions kept per record.
pub const ARCHIVED_STATES_MAX: usize = 40;

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub ratchet: RatchetSession,
    /// Remote Ed25519 identity key (base64)
    pub remote_identity: String,
    pub remote_registration_id: u32,
    /// Initiator's X3DH ephemeral key. Identifies the handshake so a
    /// retransmitted pre-key message reuses the session it created.
    pub base_key: String,
    /// Set while we initiated and have not heard back; outgoing messages
    /// then carry the X3DH header.
    pub pending_pre_key: Option<X3DHHeader>,
}

impl SessionState {
    pub fn has_pending_pre_key(&self) -> bool {
        self.pending_pre_key.is_some()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            previous: VecDeque::new(),
        }
    }

    pub fn has_open_session(&self) -> bool {
        self.current.is_some()
    }

    pub fn session_state(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub fn session_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    pub fn previous_states(&self) -> impl Iterator<Item = &SessionState> {
        self.previous.iter()
    }

    /// Make `state` current, archiving whatever was current before.
    pub fn promote_state(&mut self, state: SessionState) {
        self.archive_current_state();
        self.current = Some(state);
    }

    /// Replace archived state `index` with `state` and make it current.
    pub(crate) fn promote_previous(&mut self, index: usize, state: SessionState) {
        self.previous.remove(index);
        self.promote_state(state);
    }

    pub fn archive_current_state(&mut self) {
        if let Some(state) = self.current.take() {
            self.previous.push_front(state);
            self.previous.truncate(ARCHIVED_STATES_MAX);
        }
    }

    /// True if the current or any archived session came from the handshake
    /// with this initiator base key.
    pub fn has_session_with_base_key(&self, base_key: &str) -> bool {
        self.current
            .iter()
            .chain(self.previous.iter())
            .any(|s| s.base_key == base_key)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
