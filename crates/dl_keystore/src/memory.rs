//! In-memory `SignalStore`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    error::KeyStoreError,
    kind::{KeyKind, KeyValues, MutationSet},
    store::SignalStore,
};

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<KeyKind, HashMap<String, Vec<u8>>>>,
    fail_next_sets: AtomicU32,
    set_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `set` fail without applying anything.
    pub fn fail_next_sets(&self, n: u32) {
        self.fail_next_sets.store(n, Ordering::SeqCst);
    }

    /// Number of `set` calls that reached the store, failed ones included.
    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, kind: KeyKind) -> HashMap<String, Vec<u8>> {
        self.data.read().get(&kind).cloned().unwrap_or_default()
    }

    pub fn contains(&self, kind: KeyKind, id: &str) -> bool {
        self.data
            .read()
            .get(&kind)
            .map(|ids| ids.contains_key(id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn get(&self, kind: KeyKind, ids: &[String]) -> Result<KeyValues, KeyStoreError> {
        let data = self.data.read();
        let Some(values) = data.get(&kind) else {
            return Ok(KeyValues::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| values.get(id).map(|v| (id.clone(), v.clone())))
            .collect())
    }

    async fn set(&self, mutations: &MutationSet) -> Result<(), KeyStoreError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(KeyStoreError::Backend("injected write failure".into()));
        }

        let mut data = self.data.write();
        for (kind, id, value) in mutations.iter() {
            let values = data.entry(kind).or_default();
            match value {
                Some(v) => {
                    values.insert(id.clone(), v.clone());
                }
                None => {
                    values.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), KeyStoreError> {
        self.data.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let store = MemoryStore::new();
        store
            .set(&MutationSet::new().with(KeyKind::Session, "a", b"rec".to_vec()))
            .await
            .unwrap();
        let got = store
            .get(KeyKind::Session, &["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["a"], b"rec");
    }

    #[tokio::test]
    async fn injected_failure_applies_nothing() {
        let store = MemoryStore::new();
        store.fail_next_sets(1);
        let m = MutationSet::new()
            .with(KeyKind::Session, "a", vec![1])
            .with(KeyKind::PreKey, "1", vec![2]);
        assert!(store.set(&m).await.is_err());
        assert!(!store.contains(KeyKind::Session, "a"));
        store.set(&m).await.unwrap();
        assert!(store.contains(KeyKind::PreKey, "1"));
        assert_eq!(store.set_calls(), 2);
    }
}
