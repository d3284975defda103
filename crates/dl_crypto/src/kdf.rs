//! Key derivation functions
//!
//! `vault_key_from_password` - Argon2id, derives the 32-byte key used to
//!   encrypt values in the local SQLite key store.
//!
//! `hkdf_expand` / `derive_secrets` - HKDF-SHA256, used for session and
//!   sender-key material.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Vault key (Argon2id) ──────────────────────────────────────────────────────

/// 32-byte vault key derived from user password. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey(pub [u8; 32]);

/// Argon2id parameters - tuned for interactive (desktop) use.
fn argon2_params() -> Result<Params, CryptoError> {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a vault key from a user password + 16-byte salt.
/// The salt is stored alongside the key store (not secret).
pub fn vault_key_from_password(password: &[u8], salt: &[u8; 16]) -> Result<VaultKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params()?);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(VaultKey(output))
}

/// Generate a fresh random 16-byte salt (call once on first run; store it).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive `blocks` consecutive 32-byte blocks from `(seed, salt, label)`.
///
/// Block `i` is bytes `32*i..32*(i+1)` of one HKDF expansion, so callers
/// may split across block boundaries freely.
pub fn derive_secrets(
    seed: &[u8],
    salt: &[u8; 32],
    label: &[u8],
    blocks: usize,
) -> Result<Vec<[u8; 32]>, CryptoError> {
    let mut okm = vec![0u8; blocks * 32];
    hkdf_expand(seed, Some(salt), label, &mut okm)?;
    let out = okm
        .chunks_exact(32)
        .map(|chunk| {
            let mut block = [0u8; 32];
            block.copy_from_slice(chunk);
            block
        })
        .collect();
    zeroize::Zeroize::zeroize(&mut okm);
    Ok(out)
}
