//! Persistent store contract.

use async_trait::async_trait;

use crate::{
    error::KeyStoreError,
    kind::{KeyKind, KeyValues, MutationSet},
};

/// Backing storage for the transactional key store.
///
/// `set` must be all-or-nothing: either every mutation in the set is
/// applied or none is.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn get(&self, kind: KeyKind, ids: &[String]) -> Result<KeyValues, KeyStoreError>;

    async fn set(&self, mutations: &MutationSet) -> Result<(), KeyStoreError>;

    async fn clear(&self) -> Result<(), KeyStoreError> {
        Ok(())
    }
}
