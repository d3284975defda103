//! Per-contact privacy tokens.
//!
//! Tokens are stored per user (device-less) under the identity space they
//! were issued for: `pn:{user}` or `lid:{user}`. When two identities are
//! correlated a token held by only one of them is copied to the other.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use dl_keystore::{KeyKind, KeyStore, MutationSet};
use dl_proto::{Address, IdentityKind};

use crate::error::SignalError;
use crate::mapping::cache::TtlCache;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    #[serde(with = "b64")]
    pub token: Vec<u8>,
    /// Issue time, unix seconds.
    pub timestamp: i64,
}

impl AuthToken {
    pub fn new(token: Vec<u8>, timestamp: i64) -> Self {
        Self { token, timestamp }
    }
}

mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        B64.decode(s).map_err(serde::de::Error::custom)
    }
}

pub fn token_key(address: &Address) -> String {
    match address.kind {
        IdentityKind::Primary => format!("pn:{}", address.user),
        IdentityKind::Alternate => format!("lid:{}", address.user),
    }
}

pub struct TokenManager {
    keys: KeyStore,
    cache: TtlCache,
}

impl TokenManager {
    pub fn new(keys: KeyStore, cache: TtlCache) -> Self {
        Self { keys, cache }
    }

    pub async fn get_token(&self, address: &Address) -> Result<Option<AuthToken>, SignalError> {
        let key = token_key(address);
        if let Some(raw) = self.cache.get(&key) {
            return Ok(Some(serde_json::from_str(&raw)?));
        }
        let epoch = self.cache.epoch();
        let Some(bytes) = self.keys.get_one(KeyKind::AuthToken, &key).await? else {
            return Ok(None);
        };
        let raw = String::from_utf8_lossy(&bytes).into_owned();
        let token: AuthToken = serde_json::from_str(&raw)?;
        // Reads inside a transaction may see uncommitted writes.
        if !self.keys.is_in_transaction() {
            self.cache.put_if_unchanged(epoch, key, raw);
        }
        Ok(Some(token))
    }

    pub async fn store_token(&self, address: &Address, token: &AuthToken) -> Result<(), SignalError> {
        let key = token_key(address);
        let bytes = serde_json::to_vec(token)?;
        self.keys
            .transaction(|| async {
                self.keys
                    .set(MutationSet::new().with(KeyKind::AuthToken, key.clone(), bytes))
                    .await?;
                self.cache.remove(&key);
                let cache = self.cache.clone();
                self.keys.after_commit(move || cache.remove(&key));
                Ok::<_, SignalError>(())
            })
            .await
    }

    /// Copy a token held by exactly one of `primary`/`alternate` to the
    /// other. Returns true if a copy was written.
    pub async fn cross_reference(
        &self,
        primary: &Address,
        alternate: &Address,
    ) -> Result<bool, SignalError> {
        self.keys
            .transaction(|| async {
                let from_primary = self.get_token(primary).await?;
                let from_alternate = self.get_token(alternate).await?;
                match (from_primary, from_alternate) {
                    (Some(token), None) => {
                        debug!(from = %primary, to = %alternate, "copying token to alternate identity");
                        self.store_token(alternate, &token).await?;
                        Ok(true)
                    }
                    (None, Some(token)) => {
                        debug!(from = %alternate, to = %primary, "copying token to primary identity");
                        self.store_token(primary, &token).await?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
            .await
    }

    /// Carry the primary identity's token over during session migration.
    /// The primary copy stays in place.
    pub async fn migrate_token(&self, from: &Address, to: &Address) -> Result<bool, SignalError> {
        self.keys
            .transaction(|| async {
                match self.get_token(from).await? {
                    Some(token) => {
                        self.store_token(to, &token).await?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dl_keystore::{KeyStoreConfig, MemoryStore, TokioClock};

    use super::*;
    use crate::config::MappingCacheConfig;

    fn manager() -> (Arc<MemoryStore>, TokenManager) {
        let mem = Arc::new(MemoryStore::new());
        let keys = KeyStore::new(mem.clone(), &KeyStoreConfig::default());
        let cache = TtlCache::new(&MappingCacheConfig::default(), Arc::new(TokioClock));
        (mem, TokenManager::new(keys, cache))
    }

    #[tokio::test]
    async fn tokens_are_keyed_per_user_and_space() {
        let (mem, tokens) = manager();
        let token = AuthToken::new(vec![1, 2, 3], 1_700_000_000);
        tokens.store_token(&Address::primary("100", 4), &token).await.unwrap();

        assert!(mem.contains(KeyKind::AuthToken, "pn:100"));
        assert_eq!(tokens.get_token(&Address::primary("100", 0)).await.unwrap(), Some(token));
        assert_eq!(tokens.get_token(&Address::alternate("100", 0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cross_reference_copies_only_when_one_side_has_a_token() {
        let (_mem, tokens) = manager();
        let pn = Address::primary("100", 0);
        let lid = Address::alternate("900", 0);

        assert!(!tokens.cross_reference(&pn, &lid).await.unwrap());

        let token = AuthToken::new(b"tok".to_vec(), 5);
        tokens.store_token(&lid, &token).await.unwrap();
        assert!(tokens.cross_reference(&pn, &lid).await.unwrap());
        assert_eq!(tokens.get_token(&pn).await.unwrap(), Some(token.clone()));

        // Both sides populated: nothing to do.
        assert!(!tokens.cross_reference(&pn, &lid).await.unwrap());
    }

    #[tokio::test]
    async fn store_invalidates_cached_value() {
        let (_mem, tokens) = manager();
        let pn = Address::primary("1", 0);
        tokens.store_token(&pn, &AuthToken::new(vec![1], 1)).await.unwrap();
        assert_eq!(tokens.get_token(&pn).await.unwrap().unwrap().token, vec![1]);
        tokens.store_token(&pn, &AuthToken::new(vec![2], 2)).await.unwrap();
        assert_eq!(tokens.get_token(&pn).await.unwrap().unwrap().token, vec![2]);
    }
}
