//! Primary ↔ alternate identity mappings.
//!
//! Each pair is persisted twice under `identity-mapping`:
//!   `{primary_user}.{device}`       → alternate address
//!   `alt:{alternate_user}.{device}` → primary address
//!
//! Writes invalidate the touched cache keys when staged and again once the
//! transaction commits. Reads refill the cache only outside a transaction
//! and only if no invalidation happened while they were reading.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dl_keystore::{KeyKind, KeyStore, MutationSet};
use dl_proto::Address;

use crate::addressing::device_key;
use crate::error::SignalError;
use crate::mapping::cache::TtlCache;
use crate::mapping::token::TokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingChange {
    Created,
    Unchanged,
    /// One side was previously paired with a different identity.
    Replaced,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DeviceList {
    devices: Vec<u32>,
    updated_at: i64,
}

pub fn forward_key(primary: &Address) -> String {
    device_key(primary)
}

pub fn reverse_key(alternate: &Address) -> String {
    format!("alt:{}", device_key(alternate))
}

/// Order a pair as (primary, alternate), rejecting anything else.
fn normalise(a: &Address, b: &Address) -> Result<(Address, Address), SignalError> {
    if a.user.is_empty() || b.user.is_empty() {
        return Err(SignalError::MalformedAddressPair("empty user".into()));
    }
    match (a.is_primary(), b.is_primary()) {
        (true, false) => Ok((a.clone(), b.clone())),
        (false, true) => Ok((b.clone(), a.clone())),
        _ => Err(SignalError::MalformedAddressPair(format!(
            "{a} and {b} are in the same identity space"
        ))),
    }
}

pub struct IdentityMappingStore {
    keys: KeyStore,
    cache: TtlCache,
    tokens: Arc<TokenManager>,
}

impl IdentityMappingStore {
    pub fn new(keys: KeyStore, cache: TtlCache, tokens: Arc<TokenManager>) -> Self {
        Self {
            keys,
            cache,
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Record that `a` and `b` name the same contact device. Either order
    /// is accepted; two addresses of the same kind are rejected without
    /// touching the store.
    pub async fn store_mapping(&self, a: &Address, b: &Address) -> Result<MappingChange, SignalError> {
        let (primary, alternate) = normalise(a, b)?;
        self.keys
            .transaction(|| self.store_pair(&primary, &alternate))
            .await
    }

    /// Store several pairs in one transaction. Malformed pairs are skipped
    /// with a warning. Returns how many pairs were new or changed.
    pub async fn store_mappings(&self, pairs: &[(Address, Address)]) -> Result<usize, SignalError> {
        self.keys
            .transaction(|| async {
                let mut changed = 0;
                for (a, b) in pairs {
                    let (primary, alternate) = match normalise(a, b) {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "skipping malformed mapping");
                            continue;
                        }
                    };
                    if self.store_pair(&primary, &alternate).await? != MappingChange::Unchanged {
                        changed += 1;
                    }
                }
                Ok::<_, SignalError>(changed)
            })
            .await
    }

    async fn store_pair(&self, primary: &Address, alternate: &Address) -> Result<MappingChange, SignalError> {
        let forward = forward_key(primary);
        let reverse = reverse_key(alternate);

        let old_alternate = self.read_address(&forward).await?;
        let old_primary = self.read_address(&reverse).await?;
        if old_alternate.as_ref() == Some(alternate) && old_primary.as_ref() == Some(primary) {
            return Ok(MappingChange::Unchanged);
        }

        let mut mutations = MutationSet::new();
        let mut change = MappingChange::Created;
        let mut touched = vec![forward.clone(), reverse.clone()];
        if let Some(stale) = old_alternate.filter(|old| old != alternate) {
            info!(primary = %primary, old = %stale, new = %alternate, "alternate identity changed");
            let stale_key = reverse_key(&stale);
            touched.push(stale_key.clone());
            mutations.delete(KeyKind::IdentityMapping, stale_key);
            change = MappingChange::Replaced;
        }
        if let Some(stale) = old_primary.filter(|old| old != primary) {
            info!(alternate = %alternate, old = %stale, new = %primary, "primary identity changed");
            let stale_key = forward_key(&stale);
            touched.push(stale_key.clone());
            mutations.delete(KeyKind::IdentityMapping, stale_key);
            change = MappingChange::Replaced;
        }

        mutations
            .put(KeyKind::IdentityMapping, forward, alternate.to_string().into_bytes())
            .put(KeyKind::IdentityMapping, reverse, primary.to_string().into_bytes());
        self.keys.set(mutations).await?;

        // Readers outside the transaction still see the old pair until it
        // commits and may cache it meanwhile.
        self.cache.invalidate(&touched);
        let cache = self.cache.clone();
        self.keys.after_commit(move || cache.invalidate(&touched));

        if change == MappingChange::Created {
            self.tokens.cross_reference(primary, alternate).await?;
        }
        debug!(primary = %primary, alternate = %alternate, ?change, "stored identity mapping");
        Ok(change)
    }

    pub async fn get_alternate_for_primary(&self, primary: &Address) -> Result<Option<Address>, SignalError> {
        if !primary.is_primary() {
            return Err(SignalError::MalformedAddressPair(format!("{primary} is not a primary address")));
        }
        self.lookup(&forward_key(primary), reverse_key, primary).await
    }

    pub async fn get_primary_for_alternate(&self, alternate: &Address) -> Result<Option<Address>, SignalError> {
        if !alternate.is_alternate() {
            return Err(SignalError::MalformedAddressPair(format!("{alternate} is not an alternate address")));
        }
        self.lookup(&reverse_key(alternate), forward_key, alternate).await
    }

    /// Batch form of `get_alternate_for_primary`; unmapped addresses are
    /// absent from the result.
    pub async fn get_alternates_for_primaries(
        &self,
        primaries: &[Address],
    ) -> Result<HashMap<Address, Address>, SignalError> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for primary in primaries.iter().filter(|a| a.is_primary()) {
            match self.cache.get(&forward_key(primary)) {
                Some(raw) => {
                    found.insert(primary.clone(), raw.parse()?);
                }
                None => missing.push(primary),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let ids: Vec<String> = missing.iter().map(|a| forward_key(a)).collect();
        let epoch = self.cache.epoch();
        let values = self.keys.get(KeyKind::IdentityMapping, &ids).await?;
        let committed = !self.keys.is_in_transaction();
        for primary in missing {
            let key = forward_key(primary);
            let Some(bytes) = values.get(&key) else { continue };
            let raw = String::from_utf8_lossy(bytes).into_owned();
            let alternate: Address = raw.parse()?;
            if committed {
                self.cache.put_if_unchanged(epoch, reverse_key(&alternate), primary.to_string());
                self.cache.put_if_unchanged(epoch, key, raw);
            }
            found.insert(primary.clone(), alternate);
        }
        Ok(found)
    }

    async fn lookup(
        &self,
        key: &str,
        counterpart_key: fn(&Address) -> String,
        origin: &Address,
    ) -> Result<Option<Address>, SignalError> {
        if let Some(raw) = self.cache.get(key) {
            return Ok(Some(raw.parse()?));
        }
        let epoch = self.cache.epoch();
        let Some(found) = self.read_address(key).await? else {
            return Ok(None);
        };
        // Warm both directions.
        if !self.keys.is_in_transaction() && self.cache.put_if_unchanged(epoch, key, found.to_string()) {
            self.cache.put_if_unchanged(epoch, counterpart_key(&found), origin.to_string());
        }
        Ok(Some(found))
    }

    async fn read_address(&self, key: &str) -> Result<Option<Address>, SignalError> {
        match self.keys.get_one(KeyKind::IdentityMapping, key).await? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).parse()?)),
            None => Ok(None),
        }
    }

    // ── Device lists ─────────────────────────────────────────────────────

    /// Remember the device indices seen for a user, merged with what is
    /// already known.
    pub async fn record_devices(&self, user: &str, devices: &[u32]) -> Result<Vec<u32>, SignalError> {
        self.keys
            .transaction(|| async {
                let mut list = self.device_list(user).await?;
                let before = list.devices.len();
                list.devices.extend_from_slice(devices);
                list.devices.sort_unstable();
                list.devices.dedup();
                if list.devices.len() != before {
                    list.updated_at = chrono::Utc::now().timestamp();
                    let bytes = serde_json::to_vec(&list)?;
                    self.keys
                        .set(MutationSet::new().with(KeyKind::DeviceList, user, bytes))
                        .await?;
                }
                Ok::<_, SignalError>(list.devices)
            })
            .await
    }

    /// Known devices for `user`; device 0 is always included.
    pub async fn devices_for(&self, user: &str) -> Result<Vec<u32>, SignalError> {
        let mut devices = self.device_list(user).await?.devices;
        if !devices.contains(&0) {
            devices.insert(0, 0);
        }
        Ok(devices)
    }

    async fn device_list(&self, user: &str) -> Result<DeviceList, SignalError> {
        match self.keys.get_one(KeyKind::DeviceList, user).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(DeviceList::default()),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
