//! SQLite-backed `SignalStore` via sqlx.

use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    QueryBuilder, Row, Sqlite,
};

use crate::{
    error::KeyStoreError,
    kind::{KeyKind, KeyValues, MutationSet},
    migrations::run_migrations,
    store::SignalStore,
    vault::Vault,
};

/// Store handle. Cheap to clone (the pool and vault are Arc internally).
#[derive(Clone)]
pub struct SqliteStore {
    pub pool: SqlitePool,
    pub vault: Vault,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `db_path`.
    /// Runs all pending migrations automatically.
    ///
    /// WAL journal mode is configured at connection time, NOT inside a
    /// migration: SQLite forbids changing `journal_mode` inside a
    /// transaction and sqlx wraps every migration in one.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, KeyStoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts).await?;
        run_migrations(&pool).await?;
        tracing::debug!(path = %db_path.display(), "opened key store database");

        Ok(Self { pool, vault })
    }

    async fn seal(&self, kind: KeyKind, id: &str, value: &[u8]) -> Result<String, KeyStoreError> {
        let sealed = self.vault.seal(kind.namespace(), id, value).await?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    async fn open_value(&self, kind: KeyKind, id: &str, b64: &str) -> Result<Vec<u8>, KeyStoreError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(b64)
            .map_err(|e| KeyStoreError::Crypto(dl_crypto::CryptoError::Base64Decode(e)))?;
        self.vault.open(kind.namespace(), id, &sealed).await
    }
}

#[async_trait]
impl SignalStore for SqliteStore {
    async fn get(&self, kind: KeyKind, ids: &[String]) -> Result<KeyValues, KeyStoreError> {
        if ids.is_empty() {
            return Ok(KeyValues::new());
        }
        if self.vault.is_locked().await {
            return Err(KeyStoreError::VaultLocked);
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, value FROM signal_keys WHERE namespace = ");
        query.push_bind(kind.namespace()).push(" AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut out = KeyValues::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let value: String = row.try_get("value")?;
            let plain = self.open_value(kind, &id, &value).await?;
            out.insert(id, plain);
        }
        Ok(out)
    }

    async fn set(&self, mutations: &MutationSet) -> Result<(), KeyStoreError> {
        // Seal everything up front so a locked vault fails before any write.
        let mut sealed = Vec::with_capacity(mutations.len());
        for (kind, id, value) in mutations.iter() {
            let value = match value {
                Some(v) => Some(self.seal(kind, id, v).await?),
                None => None,
            };
            sealed.push((kind, id, value));
        }

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (kind, id, value) in sealed {
            match value {
                Some(value) => {
                    sqlx::query(
                        "INSERT INTO signal_keys (namespace, id, value, updated_at) VALUES (?, ?, ?, ?)
                         ON CONFLICT(namespace, id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    )
                    .bind(kind.namespace())
                    .bind(id.as_str())
                    .bind(value)
                    .bind(now.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM signal_keys WHERE namespace = ? AND id = ?")
                        .bind(kind.namespace())
                        .bind(id.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), KeyStoreError> {
        sqlx::query("DELETE FROM signal_keys")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_unlocked(dir: &tempfile::TempDir) -> SqliteStore {
        let vault = Vault::new();
        vault.unlock_with_key([3u8; 32]).await;
        SqliteStore::open(&dir.path().join("keys.db"), vault)
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn values_roundtrip_and_are_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_unlocked(&dir).await;
        store
            .set(&MutationSet::new().with(KeyKind::Session, "alice.1", b"secret-record".to_vec()))
            .await
            .unwrap();

        let got = store
            .get(KeyKind::Session, &["alice.1".into(), "bob.1".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["alice.1"], b"secret-record");

        let raw: String = sqlx::query_scalar("SELECT value FROM signal_keys WHERE id = ?")
            .bind("alice.1")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert!(!raw.contains("secret"));
    }

    #[tokio::test]
    async fn tombstone_deletes_and_namespaces_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_unlocked(&dir).await;
        store
            .set(
                &MutationSet::new()
                    .with(KeyKind::PreKey, "1", vec![1])
                    .with(KeyKind::SignedPreKey, "1", vec![2]),
            )
            .await
            .unwrap();
        store
            .set(&MutationSet::new().without(KeyKind::PreKey, "1"))
            .await
            .unwrap();

        assert!(store.get(KeyKind::PreKey, &["1".into()]).await.unwrap().is_empty());
        assert_eq!(
            store.get(KeyKind::SignedPreKey, &["1".into()]).await.unwrap()["1"],
            vec![2]
        );
    }

    #[tokio::test]
    async fn locked_vault_blocks_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_unlocked(&dir).await;
        store.vault.lock().await;
        assert!(matches!(
            store.set(&MutationSet::new().with(KeyKind::Session, "a", vec![1])).await,
            Err(KeyStoreError::VaultLocked)
        ));
        assert!(matches!(
            store.get(KeyKind::Session, &["a".into()]).await,
            Err(KeyStoreError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_unlocked(&dir).await;
        store
            .set(&MutationSet::new().with(KeyKind::IdentityMapping, "u.0", b"x".to_vec()))
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert!(store
            .get(KeyKind::IdentityMapping, &["u.0".into()])
            .await
            .unwrap()
            .is_empty());
    }
}
