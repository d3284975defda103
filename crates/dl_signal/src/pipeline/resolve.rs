//! Choosing the single identity a stanza's pairwise items decrypt under.
//!
//! First match wins:
//!   1. the stanza's alternate hint, if a live session exists there
//!   2. a stored mapping, if a live session exists there
//!   3. the author's primary address
//!
//! Landing on an alternate identity from a primary author flags a
//! migration; it is never executed here.

use tracing::debug;

use dl_proto::{Address, Jid, MessageStanza, MigrationRequest};

use crate::error::SignalError;
use crate::mapping::IdentityMappingStore;
use crate::repository::SignalRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    AlternateHint,
    PrimaryHint,
    StoredMapping,
    /// The author's own address was used as is.
    Author,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub address: Address,
    pub source: ResolutionSource,
    pub migration: Option<MigrationRequest>,
}

impl Resolution {
    fn author(address: Address) -> Self {
        Self {
            address,
            source: ResolutionSource::Author,
            migration: None,
        }
    }

    fn crossed(from: &Address, to: Address, source: ResolutionSource) -> Self {
        Self {
            migration: Some(MigrationRequest {
                from: from.clone(),
                to: to.clone(),
            }),
            address: to,
            source,
        }
    }
}

/// Hint `jid` at the author's device index, if it is in the wanted space.
fn hinted(jid: Option<&Jid>, device: u32, alternate: bool) -> Option<Address> {
    let jid = jid?;
    let address = Address {
        device,
        ..jid.to_address().ok()?
    };
    (address.is_alternate() == alternate).then_some(address)
}

pub async fn resolve_decrypt_address(
    repository: &SignalRepository,
    mappings: &IdentityMappingStore,
    author: &Address,
    stanza: &MessageStanza,
) -> Result<Resolution, SignalError> {
    if author.is_alternate() {
        return resolve_from_alternate(repository, mappings, author, stanza).await;
    }

    if let Some(alternate) = hinted(stanza.alternate_hint.as_ref(), author.device, true) {
        if repository.has_open_session(&alternate).await? {
            debug!(author = %author, alternate = %alternate, "using alternate hint");
            return Ok(Resolution::crossed(author, alternate, ResolutionSource::AlternateHint));
        }
    }

    if let Some(alternate) = mappings.get_alternate_for_primary(author).await? {
        if repository.has_open_session(&alternate).await? {
            debug!(author = %author, alternate = %alternate, "using stored mapping");
            return Ok(Resolution::crossed(author, alternate, ResolutionSource::StoredMapping));
        }
    }

    Ok(Resolution::author(author.clone()))
}

/// An alternate-addressed author decrypts under the alternate identity
/// unless the session still lives only under the primary one.
async fn resolve_from_alternate(
    repository: &SignalRepository,
    mappings: &IdentityMappingStore,
    author: &Address,
    stanza: &MessageStanza,
) -> Result<Resolution, SignalError> {
    if repository.has_open_session(author).await? {
        return Ok(Resolution::author(author.clone()));
    }
    let (primary, source) = match hinted(stanza.primary_hint.as_ref(), author.device, false) {
        Some(primary) => (Some(primary), ResolutionSource::PrimaryHint),
        None => (
            mappings.get_primary_for_alternate(author).await?,
            ResolutionSource::StoredMapping,
        ),
    };
    if let Some(primary) = primary {
        if repository.has_open_session(&primary).await? {
            debug!(author = %author, primary = %primary, "session still under primary identity");
            return Ok(Resolution {
                migration: Some(MigrationRequest {
                    from: primary.clone(),
                    to: author.clone(),
                }),
                address: primary,
                source,
            });
        }
    }
    Ok(Resolution::author(author.clone()))
}
