//! dl_crypto - Signal-style cryptographic primitives for the Darklock session layer
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Records are plain serde structs; persistence belongs to the caller.
//!
//! # Module layout
//! - `address`          - protocol address and sender-key name
//! - `identity`         - long-term Ed25519 identity keys
//! - `x3dh`             - X3DH key agreement, pre-key records and bundles
//! - `ratchet`          - Double Ratchet with DH ratchet steps + skipped message keys
//! - `session_record`   - current + archived sessions per address
//! - `session_cipher`   - pairwise encrypt/decrypt by message kind
//! - `sender_keys`      - group sender-key chains and records
//! - `group_cipher`     - group encrypt/decrypt and distribution messages
//! - `aead`             - XChaCha20-Poly1305 / AES-256-GCM helpers
//! - `kdf`              - HKDF / Argon2id key derivation
//! - `error`            - unified error type

pub mod address;
pub mod aead;
pub mod error;
pub mod group_cipher;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod sender_keys;
pub mod session_cipher;
pub mod session_record;
pub mod x3dh;

pub use address::{ProtocolAddress, SenderKeyName};
pub use error::CryptoError;
pub use session_cipher::{CiphertextMessage, MessageKind};
pub use session_record::SessionRecord;
pub use sender_keys::SenderKeyRecord;
