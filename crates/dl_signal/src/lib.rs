//! Darklock Signal session layer.
//!
//! Sits between the wire layer and the cryptographic primitives:
//!
//!   - `mapping`     - primary ↔ alternate identity mapping, tokens, migration
//!   - `repository`  - pairwise and group encrypt/decrypt over the key store
//!   - `pipeline`    - stanza classification, addressing, per-item decoding
//!   - `satellite`   - outbound message cache and receipt tracking
//!   - `context`     - process-scoped wiring of the above

pub mod addressing;
pub mod config;
pub mod context;
pub mod error;
pub mod mapping;
pub mod pipeline;
pub mod repository;
pub mod satellite;
pub mod telemetry;

pub use addressing::{sender_key_name, session_id, signal_address};
pub use config::{MappingCacheConfig, OutboundCacheConfig, SignalConfig};
pub use context::SignalContext;
pub use error::SignalError;
pub use mapping::{AuthToken, IdentityMappingStore, MappingChange, MigrationOutcome, SessionMigrator, TokenManager};
pub use pipeline::{DecodePipeline, LocalAccount, Resolution, ResolutionSource};
pub use repository::{EncryptedMessage, GroupEncryption, SessionStatus, SignalCredentials, SignalRepository};
pub use satellite::{AckProgress, MemoryOutboundCache, MemoryReceiptTracker, OutboundMessageCache, ReceiptTracker};
