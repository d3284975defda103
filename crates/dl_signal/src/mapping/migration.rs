//! Moving pairwise sessions from a primary identity to its alternate.
//!
//! A migration runs under the session locks of both addresses and inside
//! one transaction: the session copy, source deletion, mapping update,
//! token carry-over and the completion marker commit together or not at
//! all. Once the marker for a source address exists, further requests for
//! it are no-ops.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use dl_crypto::SessionRecord;
use dl_keystore::{KeyKind, KeyStore, MutationSet};
use dl_proto::{Address, MigrationRequest};

use crate::addressing::{device_key, session_id};
use crate::error::SignalError;
use crate::mapping::store::IdentityMappingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Marker already present.
    AlreadyMigrated,
    /// Destination had a live session; nothing moved.
    DestinationAuthoritative,
    /// Source had no session; nothing moved.
    NothingToMigrate,
    Migrated,
}

impl MigrationOutcome {
    /// The error a caller that insists on moving the session should surface:
    /// `MigrationConflict` when the destination already held a live one.
    pub fn conflict(self, to: &Address) -> Option<SignalError> {
        match self {
            MigrationOutcome::DestinationAuthoritative => Some(SignalError::MigrationConflict(to.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MigrationMarker {
    to: String,
    migrated_at: i64,
}

pub struct SessionMigrator {
    keys: KeyStore,
    mappings: Arc<IdentityMappingStore>,
}

fn validate(from: &Address, to: &Address) -> Result<(), SignalError> {
    if !from.is_primary() || !to.is_alternate() {
        return Err(SignalError::MalformedAddressPair(format!(
            "migration must go primary -> alternate, got {from} -> {to}"
        )));
    }
    Ok(())
}

impl SessionMigrator {
    pub fn new(keys: KeyStore, mappings: Arc<IdentityMappingStore>) -> Self {
        Self { keys, mappings }
    }

    pub async fn execute(&self, request: &MigrationRequest) -> Result<MigrationOutcome, SignalError> {
        self.migrate(&request.from, &request.to).await
    }

    pub async fn migrate(&self, from: &Address, to: &Address) -> Result<MigrationOutcome, SignalError> {
        validate(from, to)?;
        let locks = [session_id(from), session_id(to)];
        self.keys
            .with_session_locks(&locks, || {
                self.keys.transaction(|| self.migrate_locked(from, to))
            })
            .await
    }

    /// Migrate every known device of `primary_user` to the same device
    /// index under `alternate_user`, atomically.
    pub async fn migrate_all_devices(
        &self,
        primary_user: &str,
        alternate_user: &str,
    ) -> Result<Vec<(u32, MigrationOutcome)>, SignalError> {
        let devices = self.mappings.devices_for(primary_user).await?;
        let pairs: Vec<(Address, Address)> = devices
            .iter()
            .map(|&d| (Address::primary(primary_user, d), Address::alternate(alternate_user, d)))
            .collect();
        let locks: Vec<String> = pairs
            .iter()
            .flat_map(|(from, to)| [session_id(from), session_id(to)])
            .collect();

        self.keys
            .with_session_locks(&locks, || {
                self.keys.transaction(|| async {
                    let mut outcomes = Vec::with_capacity(pairs.len());
                    for (from, to) in &pairs {
                        outcomes.push((from.device, self.migrate_locked(from, to).await?));
                    }
                    Ok::<_, SignalError>(outcomes)
                })
            })
            .await
    }

    pub async fn is_migrated(&self, from: &Address) -> Result<bool, SignalError> {
        Ok(self
            .keys
            .get_one(KeyKind::MigrationMarker, &device_key(from))
            .await?
            .is_some())
    }

    async fn migrate_locked(&self, from: &Address, to: &Address) -> Result<MigrationOutcome, SignalError> {
        let marker_id = device_key(from);
        if self.keys.get_one(KeyKind::MigrationMarker, &marker_id).await?.is_some() {
            debug!(from = %from, "session already migrated");
            return Ok(MigrationOutcome::AlreadyMigrated);
        }

        let marker = serde_json::to_vec(&MigrationMarker {
            to: to.to_string(),
            migrated_at: chrono::Utc::now().timestamp(),
        })?;
        let from_id = session_id(from);
        let to_id = session_id(to);

        if let Some(bytes) = self.keys.get_one(KeyKind::Session, &to_id).await? {
            if SessionRecord::deserialize(&bytes)?.has_open_session() {
                info!(from = %from, to = %to, "destination session already live; marking migrated");
                self.keys
                    .set(MutationSet::new().with(KeyKind::MigrationMarker, marker_id, marker))
                    .await?;
                return Ok(MigrationOutcome::DestinationAuthoritative);
            }
        }

        let Some(source) = self.keys.get_one(KeyKind::Session, &from_id).await? else {
            debug!(from = %from, "no session to migrate");
            self.keys
                .set(MutationSet::new().with(KeyKind::MigrationMarker, marker_id, marker))
                .await?;
            return Ok(MigrationOutcome::NothingToMigrate);
        };

        self.keys
            .set(
                MutationSet::new()
                    .with(KeyKind::Session, to_id, source)
                    .without(KeyKind::Session, from_id),
            )
            .await?;
        self.mappings.store_mapping(from, to).await?;
        self.mappings.tokens().migrate_token(from, to).await?;
        self.keys
            .set(MutationSet::new().with(KeyKind::MigrationMarker, marker_id, marker))
            .await?;

        info!(from = %from, to = %to, "migrated session");
        Ok(MigrationOutcome::Migrated)
    }
}
