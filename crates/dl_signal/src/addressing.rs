//! Mapping from wire addresses to Signal protocol addresses.
//!
//! Sessions under an alternate identity live beside primary ones in the
//! same namespace, so alternate names carry a `_1` suffix.

use dl_crypto::{ProtocolAddress, SenderKeyName};
use dl_proto::{Address, IdentityKind, Jid};

const ALTERNATE_SUFFIX: &str = "_1";

pub fn signal_address(address: &Address) -> ProtocolAddress {
    let name = match address.kind {
        IdentityKind::Primary => address.user.clone(),
        IdentityKind::Alternate => format!("{}{}", address.user, ALTERNATE_SUFFIX),
    };
    ProtocolAddress::new(name, address.device)
}

/// Session-record id for `address`.
pub fn session_id(address: &Address) -> String {
    signal_address(address).to_string()
}

pub fn sender_key_name(group: &Jid, author: &Address) -> SenderKeyName {
    SenderKeyName::new(group.bare().to_string(), signal_address(author))
}

/// Device-preserving cache/storage key: `user.device`.
pub fn device_key(address: &Address) -> String {
    format!("{}.{}", address.user, address.device)
}

#[cfg(test)]
mod tests {
    use dl_proto::Server;

    use super::*;

    #[test]
    fn alternate_sessions_do_not_collide_with_primary() {
        let pn = Address::primary("123", 2);
        let lid = Address::alternate("123", 2);
        assert_eq!(session_id(&pn), "123.2");
        assert_eq!(session_id(&lid), "123_1.2");
        assert_ne!(session_id(&pn), session_id(&lid));
    }

    #[test]
    fn sender_key_names_use_bare_group() {
        let group = Jid::new("family", Server::Group).with_device(3);
        let name = sender_key_name(&group, &Address::alternate("77", 1));
        assert_eq!(name.group_id, "family@g");
        assert_eq!(name.sender.to_string(), "77_1.1");
    }
}
