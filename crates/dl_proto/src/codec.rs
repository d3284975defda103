//! Plaintext padding.
//!
//! Every encrypted plaintext carries 1..=16 trailing bytes, each equal to
//! the pad length. The padding is added INSIDE the plaintext before
//! encryption and stripped after decryption.

use rand::Rng;

pub const MAX_PADDING: u8 = 16;

/// Append 1..=16 padding bytes whose value equals the pad length.
pub fn pad_random_max16(plaintext: &[u8]) -> Vec<u8> {
    let pad = rand::thread_rng().gen_range(1..=MAX_PADDING);
    let mut out = Vec::with_capacity(plaintext.len() + pad as usize);
    out.extend_from_slice(plaintext);
    out.resize(plaintext.len() + pad as usize, pad);
    out
}

/// Strip the padding added by [`pad_random_max16`].
pub fn unpad_random_max16(padded: &[u8]) -> Result<&[u8], CodecError> {
    let pad = *padded
        .last()
        .ok_or_else(|| CodecError::InvalidPadding("empty plaintext".into()))?;
    if pad == 0 || pad > MAX_PADDING || pad as usize > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "pad length {pad} for {} bytes",
            padded.len()
        )));
    }
    let body_len = padded.len() - pad as usize;
    if padded[body_len..].iter().any(|&b| b != pad) {
        return Err(CodecError::InvalidPadding("inconsistent pad bytes".into()));
    }
    Ok(&padded[..body_len])
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
