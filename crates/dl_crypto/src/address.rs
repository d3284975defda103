//! Protocol-level addressing.
//!
//! A `ProtocolAddress` names one device of one remote identity and keys
//! its session record. A `SenderKeyName` scopes a sender-key record to a
//! (group, author device) pair.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolAddress {
    pub name: String,
    pub device_id: u32,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

impl FromStr for ProtocolAddress {
    type Err = CryptoError;

    /// Parses `name.device`. The device is the suffix after the last dot.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, device) = s
            .rsplit_once('.')
            .ok_or_else(|| CryptoError::InvalidMessage(format!("bad protocol address {s:?}")))?;
        let device_id = device
            .parse()
            .map_err(|_| CryptoError::InvalidMessage(format!("bad device id in {s:?}")))?;
        if name.is_empty() {
            return Err(CryptoError::InvalidMessage(format!("empty name in {s:?}")));
        }
        Ok(Self::new(name, device_id))
    }
}

/// Composite key of a group sender-key record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderKeyName {
    pub group_id: String,
    pub sender: ProtocolAddress,
}

impl SenderKeyName {
    pub fn new(group_id: impl Into<String>, sender: ProtocolAddress) -> Self {
        Self {
            group_id: group_id.into(),
            sender,
        }
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}",
            self.group_id, self.sender.name, self.sender.device_id
        )
    }
}
