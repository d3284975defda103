use thiserror::Error;

use dl_crypto::CryptoError;
use dl_keystore::KeyStoreError;
use dl_proto::{AddressError, CodecError};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Unknown message kind {0:?}")]
    UnknownMessageKind(String),

    #[error("Missing participant on {0} stanza")]
    MissingParticipant(&'static str),

    #[error("Malformed address pair: {0}")]
    MalformedAddressPair(String),

    #[error("No open session for {0}")]
    SessionAbsent(String),

    /// Reported for a `DestinationAuthoritative` migration; see
    /// `MigrationOutcome::conflict`.
    #[error("Migration destination {0} is already authoritative")]
    MigrationConflict(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Signed pre-key {0} is not available locally")]
    MissingSignedPreKey(u32),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl SignalError {
    /// All commit retries failed; the transaction was aborted.
    pub fn is_commit_exhausted(&self) -> bool {
        matches!(self, SignalError::KeyStore(KeyStoreError::CommitExhausted { .. }))
    }

    /// A queued group message waited too long for its sender key.
    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, SignalError::KeyStore(KeyStoreError::QueueTimeout { .. }))
    }
}
