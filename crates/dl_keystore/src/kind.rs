//! Closed set of key kinds and their storage namespaces.
//!
//! Variant order equals namespace order, so `Ord` doubles as the lock
//! acquisition order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KeyStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyKind {
    AuthToken,
    DeviceList,
    IdentityKey,
    IdentityMapping,
    MigrationMarker,
    PreKey,
    SenderKey,
    SenderKeyMemory,
    Session,
    SignedPreKey,
}

impl KeyKind {
    pub const ALL: [KeyKind; 10] = [
        KeyKind::AuthToken,
        KeyKind::DeviceList,
        KeyKind::IdentityKey,
        KeyKind::IdentityMapping,
        KeyKind::MigrationMarker,
        KeyKind::PreKey,
        KeyKind::SenderKey,
        KeyKind::SenderKeyMemory,
        KeyKind::Session,
        KeyKind::SignedPreKey,
    ];

    pub fn namespace(self) -> &'static str {
        match self {
            KeyKind::AuthToken => "auth-token",
            KeyKind::DeviceList => "device-list",
            KeyKind::IdentityKey => "identity-key",
            KeyKind::IdentityMapping => "identity-mapping",
            KeyKind::MigrationMarker => "migration-marker",
            KeyKind::PreKey => "pre-key",
            KeyKind::SenderKey => "sender-key",
            KeyKind::SenderKeyMemory => "sender-key-memory",
            KeyKind::Session => "session",
            KeyKind::SignedPreKey => "signed-pre-key",
        }
    }

    /// Deletions of these kinds are only honoured for keys known to exist.
    pub fn is_pre_key(self) -> bool {
        matches!(self, KeyKind::PreKey | KeyKind::SignedPreKey)
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for KeyKind {
    type Err = KeyStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyKind::ALL
            .into_iter()
            .find(|k| k.namespace() == s)
            .ok_or_else(|| KeyStoreError::UnknownNamespace(s.to_string()))
    }
}

/// Values returned by a read. Missing ids are simply absent.
pub type KeyValues = HashMap<String, Vec<u8>>;

/// kind → id → value, where `None` is a tombstone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationSet(BTreeMap<KeyKind, BTreeMap<String, Option<Vec<u8>>>>);

impl MutationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, kind: KeyKind, id: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.0.entry(kind).or_default().insert(id.into(), Some(value));
        self
    }

    pub fn delete(&mut self, kind: KeyKind, id: impl Into<String>) -> &mut Self {
        self.0.entry(kind).or_default().insert(id.into(), None);
        self
    }

    pub fn insert(&mut self, kind: KeyKind, id: impl Into<String>, value: Option<Vec<u8>>) -> &mut Self {
        self.0.entry(kind).or_default().insert(id.into(), value);
        self
    }

    pub fn with(mut self, kind: KeyKind, id: impl Into<String>, value: Vec<u8>) -> Self {
        self.put(kind, id, value);
        self
    }

    pub fn without(mut self, kind: KeyKind, id: impl Into<String>) -> Self {
        self.delete(kind, id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|ids| ids.is_empty())
    }

    pub fn len(&self) -> usize {
        self.0.values().map(|ids| ids.len()).sum()
    }

    /// Kinds touched, in lock order.
    pub fn kinds(&self) -> impl Iterator<Item = KeyKind> + '_ {
        self.0
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(kind, _)| *kind)
    }

    pub fn entries(&self, kind: KeyKind) -> impl Iterator<Item = (&String, &Option<Vec<u8>>)> {
        self.0.get(&kind).into_iter().flat_map(|ids| ids.iter())
    }

    pub fn iter(&self) -> impl Iterator<Item = (KeyKind, &String, &Option<Vec<u8>>)> {
        self.0
            .iter()
            .flat_map(|(kind, ids)| ids.iter().map(move |(id, v)| (*kind, id, v)))
    }

    pub fn lookup(&self, kind: KeyKind, id: &str) -> Option<&Option<Vec<u8>>> {
        self.0.get(&kind).and_then(|ids| ids.get(id))
    }

    pub(crate) fn remove(&mut self, kind: KeyKind, id: &str) {
        if let Some(ids) = self.0.get_mut(&kind) {
            ids.remove(id);
        }
    }

    /// Later writes win.
    pub fn merge(&mut self, other: MutationSet) {
        for (kind, ids) in other.0 {
            self.0.entry(kind).or_default().extend(ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ord_matches_namespace_order() {
        let mut by_ns = KeyKind::ALL.to_vec();
        by_ns.sort_by_key(|k| k.namespace());
        assert_eq!(by_ns, KeyKind::ALL.to_vec());
    }

    #[test]
    fn namespaces_roundtrip() {
        for kind in KeyKind::ALL {
            assert_eq!(kind.namespace().parse::<KeyKind>().unwrap(), kind);
        }
        assert!("sessions".parse::<KeyKind>().is_err());
    }

    #[test]
    fn merge_keeps_latest_write() {
        let mut a = MutationSet::new().with(KeyKind::Session, "x", vec![1]);
        let b = MutationSet::new()
            .without(KeyKind::Session, "x")
            .with(KeyKind::PreKey, "7", vec![2]);
        a.merge(b);
        assert_eq!(a.lookup(KeyKind::Session, "x"), Some(&None));
        assert_eq!(a.len(), 2);
        assert_eq!(a.kinds().collect::<Vec<_>>(), vec![KeyKind::PreKey, KeyKind::Session]);
    }
}
