//! Vault: in-memory key that encrypts stored key material.
//!
//! The vault holds the 32-byte value-encryption key in memory. Locking
//! zeroizes it; every store read or write then fails with `VaultLocked`.
//!
//! Each value is sealed with XChaCha20-Poly1305 and bound to its
//! `namespace/id` slot through the AAD, so ciphertexts cannot be swapped
//! between rows.

use std::sync::Arc;

use tokio::sync::RwLock;

use dl_crypto::kdf::{generate_salt, vault_key_from_password, VaultKey};

use crate::error::KeyStoreError;

/// Thread-safe vault handle. Clone to share between stores.
#[derive(Clone, Default)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultKey>>>,
}

fn slot_aad(namespace: &str, id: &str) -> Vec<u8> {
    format!("dl-keystore-v1/{namespace}/{id}").into_bytes()
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unlock with a password-derived key (Argon2id).
    pub async fn unlock(&self, password: &[u8], salt: &[u8; 16]) -> Result<(), KeyStoreError> {
        let key = vault_key_from_password(password, salt)?;
        *self.inner.write().await = Some(key);
        Ok(())
    }

    /// Unlock with an existing key (e.g. from the OS keyring).
    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        *self.inner.write().await = Some(VaultKey(key));
    }

    /// Lock the vault and zeroize the key.
    pub async fn lock(&self) {
        *self.inner.write().await = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    pub async fn seal(&self, namespace: &str, id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let guard = self.inner.read().await;
        let key = guard.as_ref().ok_or(KeyStoreError::VaultLocked)?;
        Ok(dl_crypto::aead::encrypt(&key.0, plaintext, &slot_aad(namespace, id))?)
    }

    pub async fn open(&self, namespace: &str, id: &str, sealed: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let guard = self.inner.read().await;
        let key = guard.as_ref().ok_or(KeyStoreError::VaultLocked)?;
        let pt = dl_crypto::aead::decrypt(&key.0, sealed, &slot_aad(namespace, id))?;
        Ok(pt.to_vec())
    }
}

/// Generate a fresh salt for a new database. Store it next to the DB (not secret).
pub fn new_vault_salt() -> [u8; 16] {
    generate_salt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locked_vault_refuses_io() {
        let vault = Vault::new();
        assert!(vault.is_locked().await);
        assert!(matches!(
            vault.seal("session", "a", b"x").await,
            Err(KeyStoreError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn sealed_value_is_bound_to_its_slot() {
        let vault = Vault::new();
        vault.unlock_with_key([7u8; 32]).await;
        let sealed = vault.seal("session", "a", b"record").await.unwrap();
        assert_eq!(vault.open("session", "a", &sealed).await.unwrap(), b"record");
        assert!(vault.open("session", "b", &sealed).await.is_err());
        assert!(vault.open("pre-key", "a", &sealed).await.is_err());

        vault.lock().await;
        assert!(matches!(
            vault.open("session", "a", &sealed).await,
            Err(KeyStoreError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn password_unlock_is_deterministic_per_salt() {
        let salt = new_vault_salt();
        let a = Vault::new();
        let b = Vault::new();
        a.unlock(b"hunter2", &salt).await.unwrap();
        b.unlock(b"hunter2", &salt).await.unwrap();
        let sealed = a.seal("session", "x", b"v").await.unwrap();
        assert_eq!(b.open("session", "x", &sealed).await.unwrap(), b"v");
    }
}
