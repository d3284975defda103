//! dl_proto - Wire-layer contract types for the Darklock Signal session layer
//!
//! Stanza parsing itself happens upstream; this crate only carries the
//! decoded attributes in and the populated envelope back out.
//!
//! # Modules
//! - `address`  - JIDs, identity kinds, session-keying addresses
//! - `stanza`   - decoded inbound message stanza attributes
//! - `envelope` - populated message envelope returned to the wire layer
//! - `message`  - inner plaintext carried by each encrypted item
//! - `codec`    - random plaintext padding

pub mod address;
pub mod codec;
pub mod envelope;
pub mod message;
pub mod stanza;

pub use address::{Address, AddressError, IdentityKind, Jid, Server};
pub use codec::CodecError;
pub use envelope::{ItemOutcome, MessageCategory, MessageEnvelope, MessageKey, MigrationRequest, StubMarker};
pub use message::InnerMessage;
pub use stanza::{AddressingMode, EncItem, MessageStanza};
