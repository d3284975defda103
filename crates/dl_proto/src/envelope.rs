//! Populated message envelope handed back to the wire layer.
//!
//! The envelope always exists, even when nothing could be decrypted:
//!   - every item yields an `ItemOutcome`, successes and failures alike
//!   - `stub` marks stanzas with no usable content
//!   - `migration` asks the mapping subsystem to move a session; it is
//!     executed later, never during decryption

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{Address, Jid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    Chat,
    Group,
    PeerBroadcast,
    OtherBroadcast,
    DirectStatus,
    OtherStatus,
    Newsletter,
}

impl MessageCategory {
    /// Categories whose encrypted group items are keyed by the participant.
    pub fn has_author_participant(self) -> bool {
        matches!(
            self,
            MessageCategory::Group
                | MessageCategory::PeerBroadcast
                | MessageCategory::OtherBroadcast
                | MessageCategory::DirectStatus
                | MessageCategory::OtherStatus
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKey {
    pub id: String,
    /// Chat the message belongs to.
    pub remote_jid: Jid,
    pub from_me: bool,
    pub participant: Option<Jid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Decrypted { kind: String, content: Vec<u8> },
    Failed { kind: String, error: String },
}

impl ItemOutcome {
    pub fn kind(&self) -> &str {
        match self {
            ItemOutcome::Decrypted { kind, .. } | ItemOutcome::Failed { kind, .. } => kind,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubMarker {
    /// The stanza carried nothing to decrypt.
    Absent,
    /// Items were present but none decrypted.
    DecryptionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub from: Address,
    pub to: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub key: MessageKey,
    pub category: MessageCategory,
    pub author: Jid,
    /// Address the pairwise items were decrypted under. Newsletters have none.
    pub decrypt_address: Option<Address>,
    pub timestamp: DateTime<Utc>,
    pub items: Vec<ItemOutcome>,
    pub stub: Option<StubMarker>,
    pub migration: Option<MigrationRequest>,
}

impl MessageEnvelope {
    pub fn decrypted(&self) -> impl Iterator<Item = &[u8]> {
        self.items.iter().filter_map(|item| match item {
            ItemOutcome::Decrypted { content, .. } => Some(content.as_slice()),
            ItemOutcome::Failed { .. } => None,
        })
    }

    pub fn failures(&self) -> usize {
        self.items.iter().filter(|i| i.is_failed()).count()
    }
}
