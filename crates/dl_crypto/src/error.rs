use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("No open session")]
    NoOpenSession,

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unknown pre-key id {0}")]
    UnknownPreKey(u32),

    #[error("Unknown signed pre-key id {0}")]
    UnknownSignedPreKey(u32),

    #[error("No sender key state for key id {0}")]
    NoSenderKeyState(u32),

    #[error("Sender key message is too far in the future ({jump} iterations)")]
    SenderKeyTooFarAhead { jump: u32 },

    #[error("Duplicate sender key message (iteration {iteration} already consumed)")]
    DuplicateSenderKeyMessage { iteration: u32 },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
