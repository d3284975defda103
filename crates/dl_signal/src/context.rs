//! Process-scoped wiring of the session layer.
//!
//! Components are built in dependency order and hold plain handles to
//! what they need; nothing points back up the chain.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dl_keystore::{KeyStore, SharedClock, SignalStore, TokioClock};
use dl_proto::{MessageEnvelope, MessageStanza, MigrationRequest};

use crate::config::SignalConfig;
use crate::error::SignalError;
use crate::mapping::{IdentityMappingStore, MigrationOutcome, SessionMigrator, TokenManager, TtlCache};
use crate::pipeline::{DecodePipeline, LocalAccount};
use crate::repository::{SignalCredentials, SignalRepository};
use crate::satellite::{MemoryOutboundCache, MemoryReceiptTracker, OutboundMessageCache, ReceiptTracker};

pub struct SignalContext {
    pub keys: KeyStore,
    pub tokens: Arc<TokenManager>,
    pub mappings: Arc<IdentityMappingStore>,
    pub migrator: Arc<SessionMigrator>,
    pub repository: SignalRepository,
    pub pipeline: DecodePipeline,
    pub outbound: Arc<MemoryOutboundCache>,
    pub receipts: Arc<MemoryReceiptTracker>,
    config: SignalConfig,
}

impl SignalContext {
    pub fn start(
        store: Arc<dyn SignalStore>,
        credentials: SignalCredentials,
        account: LocalAccount,
        config: SignalConfig,
    ) -> Self {
        Self::with_clock(store, credentials, account, config, Arc::new(TokioClock))
    }

    pub fn with_clock(
        store: Arc<dyn SignalStore>,
        credentials: SignalCredentials,
        account: LocalAccount,
        config: SignalConfig,
        clock: SharedClock,
    ) -> Self {
        let keys = KeyStore::with_clock(store, &config.keystore, clock.clone());
        let tokens = Arc::new(TokenManager::new(
            keys.clone(),
            TtlCache::new(&config.mapping_cache, clock.clone()),
        ));
        let mappings = Arc::new(IdentityMappingStore::new(
            keys.clone(),
            TtlCache::new(&config.mapping_cache, clock.clone()),
            tokens.clone(),
        ));
        let migrator = Arc::new(SessionMigrator::new(keys.clone(), mappings.clone()));
        let repository = SignalRepository::new(keys.clone(), mappings.clone(), credentials);
        let pipeline = DecodePipeline::new(repository.clone(), account);
        let outbound = Arc::new(MemoryOutboundCache::new(&config.outbound_cache, clock.clone()));
        let receipts = Arc::new(MemoryReceiptTracker::new(clock));

        info!(
            registration_id = repository.registration_id(),
            "signal context started"
        );
        Self {
            keys,
            tokens,
            mappings,
            migrator,
            repository,
            pipeline,
            outbound,
            receipts,
            config,
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Run a flagged migration on its own task.
    pub fn dispatch_migration(&self, request: MigrationRequest) -> JoinHandle<Result<MigrationOutcome, SignalError>> {
        let migrator = self.migrator.clone();
        tokio::spawn(async move {
            let result = migrator.execute(&request).await;
            match &result {
                Ok(outcome) => {
                    if let Some(conflict) = outcome.conflict(&request.to) {
                        debug!(from = %request.from, reason = %conflict, "migration left sessions in place");
                    }
                }
                Err(e) => warn!(from = %request.from, to = %request.to, error = %e, "migration failed"),
            }
            result
        })
    }

    /// Decode a stanza and dispatch any migration it flagged.
    pub async fn receive(&self, stanza: &MessageStanza) -> Result<MessageEnvelope, SignalError> {
        let envelope = self.pipeline.decode(stanza).await?;
        if let Some(request) = envelope.migration.clone() {
            drop(self.dispatch_migration(request));
        }
        Ok(envelope)
    }

    pub fn shutdown(&self) {
        self.keys.close_queue();
        self.tokens.clear_cache();
        self.mappings.clear_cache();
        self.outbound.clear();
        self.receipts.clear();
        info!("signal context shut down");
    }
}
