use sqlx::SqlitePool;

use crate::error::KeyStoreError;

/// Apply the embedded migrations in `migrations/`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), KeyStoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| KeyStoreError::Migration(e.to_string()))
}
