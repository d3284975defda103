//! dl_keystore - Transactional key store for the Darklock Signal session layer
//!
//! # Layers
//! - `SignalStore` is the persistent contract: `get(kind, ids)`,
//!   all-or-nothing `set(mutations)`, optional `clear()`.
//! - `KeyStore` adds nested transactions, per-kind commit locks, named
//!   locks for sender keys and sessions, bounded commit retries, and the
//!   queue of group messages waiting for a sender key.
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. `SqliteStore` seals every value with
//! XChaCha20-Poly1305 under the in-memory `Vault` key; namespaces and ids
//! stay in plaintext so lookups remain indexable.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on open.

pub mod config;
pub mod db;
pub mod error;
pub mod kind;
pub mod locks;
pub mod memory;
pub mod migrations;
pub mod retry;
pub mod sender_queue;
pub mod store;
pub mod transaction;
pub mod vault;

pub use config::KeyStoreConfig;
pub use db::SqliteStore;
pub use error::KeyStoreError;
pub use kind::{KeyKind, KeyValues, MutationSet};
pub use memory::MemoryStore;
pub use retry::{Clock, RetryPolicy, SharedClock, TokioClock};
pub use sender_queue::QueuedMessage;
pub use store::SignalStore;
pub use transaction::KeyStore;
pub use vault::Vault;
