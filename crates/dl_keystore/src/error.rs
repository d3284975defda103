use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked; unlock with password first")]
    VaultLocked,

    #[error("Crypto error: {0}")]
    Crypto(#[from] dl_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Unknown key namespace {0:?}")]
    UnknownNamespace(String),

    #[error("Commit failed after {attempts} attempts: {source}")]
    CommitExhausted {
        attempts: u32,
        #[source]
        source: Box<KeyStoreError>,
    },

    #[error("Timed out waiting for sender key {name}")]
    QueueTimeout { name: String },

    #[error("Sender key queue closed")]
    QueueClosed,
}
