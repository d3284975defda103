//! Decoded attributes of an inbound message stanza.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::Jid;

/// Which address space the server used for the sender fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressingMode {
    #[serde(rename = "pn")]
    Primary,
    #[serde(rename = "lid")]
    Alternate,
}

/// One encrypted child of the stanza.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncItem {
    /// Wire tag: `pkmsg`, `msg`, `skmsg`, or something newer we don't know.
    pub kind: String,
    pub ciphertext: Vec<u8>,
}

impl EncItem {
    pub fn new(kind: impl Into<String>, ciphertext: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            ciphertext,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStanza {
    pub id: String,
    pub from: Jid,
    /// Author inside a group or broadcast.
    pub participant: Option<Jid>,
    /// Set on messages we sent from another of our devices.
    pub recipient: Option<Jid>,
    pub addressing_mode: Option<AddressingMode>,
    /// Alternate identity of the author announced by the server.
    pub alternate_hint: Option<Jid>,
    /// Primary identity of the author when the stanza is addressed in the
    /// alternate space.
    pub primary_hint: Option<Jid>,
    pub timestamp: DateTime<Utc>,
    pub items: Vec<EncItem>,
}

impl MessageStanza {
    pub fn new(id: impl Into<String>, from: Jid) -> Self {
        Self {
            id: id.into(),
            from,
            participant: None,
            recipient: None,
            addressing_mode: None,
            alternate_hint: None,
            primary_hint: None,
            timestamp: Utc::now(),
            items: Vec::new(),
        }
    }

    pub fn with_participant(mut self, participant: Jid) -> Self {
        self.participant = Some(participant);
        self
    }

    pub fn with_recipient(mut self, recipient: Jid) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn with_alternate_hint(mut self, hint: Jid) -> Self {
        self.alternate_hint = Some(hint);
        self
    }

    pub fn with_primary_hint(mut self, hint: Jid) -> Self {
        self.primary_hint = Some(hint);
        self
    }

    pub fn with_addressing_mode(mut self, mode: AddressingMode) -> Self {
        self.addressing_mode = Some(mode);
        self
    }

    pub fn with_item(mut self, item: EncItem) -> Self {
        self.items.push(item);
        self
    }
}
