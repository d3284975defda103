//! Identity mapping, tokens, and session migration between identity spaces.

pub mod cache;
pub mod migration;
pub mod store;
pub mod token;

pub use cache::TtlCache;
pub use migration::{MigrationOutcome, SessionMigrator};
pub use store::{IdentityMappingStore, MappingChange};
pub use token::{AuthToken, TokenManager};
