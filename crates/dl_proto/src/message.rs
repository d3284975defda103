//! Inner plaintext carried by each encrypted item.
//!
//! Pairwise items may piggy-back a sender-key distribution payload for a
//! group; the receiver stores it before touching the group items that
//! follow in the same stanza.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    pub group_id: String,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerMessage {
    #[serde(with = "b64")]
    pub content: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key_distribution: Option<SenderKeyDistribution>,
}

impl InnerMessage {
    pub fn text(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            sender_key_distribution: None,
        }
    }

    /// Serialize and pad, ready for encryption.
    pub fn to_plaintext(&self) -> Result<Vec<u8>, CodecError> {
        Ok(codec::pad_random_max16(&serde_json::to_vec(self)?))
    }

    /// Unpad and parse a decrypted plaintext.
    pub fn from_plaintext(padded: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(codec::unpad_random_max16(padded)?)?)
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
