//! Inbound stanza classification, addressing resolution and decoding.

pub mod classify;
pub mod decode;
pub mod resolve;

pub use classify::{classify, Classified, LocalAccount};
pub use decode::DecodePipeline;
pub use resolve::{resolve_decrypt_address, Resolution, ResolutionSource};
