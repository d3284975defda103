//! Authenticated Encryption with Associated Data
//!
//! Pairwise messages and stored values use XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ]
//!
//! Sender-key messages use AES-256-GCM keyed by the derived sender message
//! key; see [`seal_with_iv`] / [`open_with_iv`].

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const XNONCE_LEN: usize = 24;

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
/// `aad` - additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(XNONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < XNONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(XNONCE_LEN);
    let nonce = chacha20poly1305::XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// AES-256-GCM with a caller-derived IV. Only the first 12 bytes of `iv`
/// are used as the GCM nonce; each (key, iv) pair must be single-use.
pub fn seal_with_iv(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = aes_gcm::Nonce::from_slice(&iv[..12]);
    cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)
}

pub fn open_with_iv(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let nonce = aes_gcm::Nonce::from_slice(&iv[..12]);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AeadDecrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xchacha_rejects_wrong_aad() {
        let key = [3u8; 32];
        let ct = encrypt(&key, b"hello", b"aad-1").unwrap();
        assert!(decrypt(&key, &ct, b"aad-2").is_err());
        assert_eq!(decrypt(&key, &ct, b"aad-1").unwrap().as_slice(), b"hello");
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = [3u8; 32];
        assert!(matches!(decrypt(&key, &[0u8; 10], b""), Err(CryptoError::AeadDecrypt)));
    }

    #[test]
    fn gcm_with_iv_detects_tampering() {
        let key = [9u8; 32];
        let iv = [1u8; 16];
        let mut ct = seal_with_iv(&key, &iv, b"group payload").unwrap();
        assert_eq!(open_with_iv(&key, &iv, &ct).unwrap(), b"group payload");
        ct[0] ^= 0xFF;
        assert!(open_with_iv(&key, &iv, &ct).is_err());
    }
}
