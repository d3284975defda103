//! Categorising inbound stanzas and picking out the author.

use dl_proto::{Jid, MessageCategory, MessageStanza};

use crate::error::SignalError;

/// Our own identities, device-less.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub primary: Jid,
    pub alternate: Option<Jid>,
}

impl LocalAccount {
    pub fn new(primary: Jid, alternate: Option<Jid>) -> Self {
        Self { primary, alternate }
    }

    pub fn is_me(&self, jid: &Jid) -> bool {
        jid.same_user(&self.primary) || self.alternate.as_ref().is_some_and(|alt| jid.same_user(alt))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub category: MessageCategory,
    /// Chat the message belongs to.
    pub chat: Jid,
    /// Who wrote it, including device.
    pub author: Jid,
    pub from_me: bool,
}

fn participant(stanza: &MessageStanza, what: &'static str) -> Result<Jid, SignalError> {
    let participant = stanza
        .participant
        .clone()
        .ok_or(SignalError::MissingParticipant(what))?;
    if !participant.is_user() {
        return Err(SignalError::MalformedAddressPair(format!(
            "{what} participant {participant} is not a user"
        )));
    }
    Ok(participant)
}

pub fn classify(stanza: &MessageStanza, me: &LocalAccount) -> Result<Classified, SignalError> {
    let from = &stanza.from;

    if from.is_user() {
        let from_me = me.is_me(from);
        let chat = match &stanza.recipient {
            Some(recipient) if from_me => recipient.bare(),
            Some(recipient) => {
                return Err(SignalError::MalformedAddressPair(format!(
                    "recipient {recipient} on a message from {from}"
                )))
            }
            None => from.bare(),
        };
        return Ok(Classified {
            category: MessageCategory::Chat,
            chat,
            author: from.clone(),
            from_me,
        });
    }

    if from.is_group() {
        let author = participant(stanza, "group")?;
        return Ok(Classified {
            category: MessageCategory::Group,
            chat: from.bare(),
            from_me: me.is_me(&author),
            author,
        });
    }

    if from.is_broadcast() {
        let author = participant(stanza, "broadcast")?;
        let from_me = me.is_me(&author);
        let category = match (from.is_status_broadcast(), from_me) {
            (true, true) => MessageCategory::DirectStatus,
            (true, false) => MessageCategory::OtherStatus,
            (false, true) => MessageCategory::PeerBroadcast,
            (false, false) => MessageCategory::OtherBroadcast,
        };
        return Ok(Classified {
            category,
            chat: from.bare(),
            author,
            from_me,
        });
    }

    Ok(Classified {
        category: MessageCategory::Newsletter,
        chat: from.bare(),
        author: from.clone(),
        from_me: false,
    })
}

#[cfg(test)]
mod tests {
    use dl_proto::Server;

    use super::*;

    fn me() -> LocalAccount {
        LocalAccount::new(Jid::new("111", Server::Primary), Some(Jid::new("999", Server::Alternate)))
    }

    #[test]
    fn direct_chat_from_peer() {
        let stanza = MessageStanza::new("1", "222:3@pn".parse().unwrap());
        let c = classify(&stanza, &me()).unwrap();
        assert_eq!(c.category, MessageCategory::Chat);
        assert_eq!(c.chat.to_string(), "222@pn");
        assert_eq!(c.author.device, Some(3));
        assert!(!c.from_me);
    }

    #[test]
    fn own_device_echo_uses_recipient_as_chat() {
        let stanza = MessageStanza::new("1", "999:2@lid".parse().unwrap()).with_recipient("222@pn".parse().unwrap());
        let c = classify(&stanza, &me()).unwrap();
        assert!(c.from_me);
        assert_eq!(c.chat.to_string(), "222@pn");
    }

    #[test]
    fn recipient_from_stranger_is_rejected() {
        let stanza = MessageStanza::new("1", "222@pn".parse().unwrap()).with_recipient("333@pn".parse().unwrap());
        assert!(matches!(classify(&stanza, &me()), Err(SignalError::MalformedAddressPair(_))));
    }

    #[test]
    fn group_requires_participant() {
        let stanza = MessageStanza::new("1", "fam@g".parse().unwrap());
        assert!(matches!(classify(&stanza, &me()), Err(SignalError::MissingParticipant("group"))));

        let stanza = stanza.with_participant("fam2@g".parse().unwrap());
        assert!(matches!(classify(&stanza, &me()), Err(SignalError::MalformedAddressPair(_))));
    }

    #[test]
    fn broadcast_and_status_split_on_author() {
        let status: Jid = "status@broadcast".parse().unwrap();
        let mine = MessageStanza::new("1", status.clone()).with_participant("111:1@pn".parse().unwrap());
        let theirs = MessageStanza::new("2", status).with_participant("222@pn".parse().unwrap());
        let list = MessageStanza::new("3", "1234@broadcast".parse().unwrap()).with_participant("222@pn".parse().unwrap());

        assert_eq!(classify(&mine, &me()).unwrap().category, MessageCategory::DirectStatus);
        assert_eq!(classify(&theirs, &me()).unwrap().category, MessageCategory::OtherStatus);
        assert_eq!(classify(&list, &me()).unwrap().category, MessageCategory::OtherBroadcast);
    }

    #[test]
    fn newsletter() {
        let stanza = MessageStanza::new("1", "news@newsletter".parse().unwrap());
        let c = classify(&stanza, &me()).unwrap();
        assert_eq!(c.category, MessageCategory::Newsletter);
        assert!(!c.from_me);
    }
}
