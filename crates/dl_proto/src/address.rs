//! JIDs and session-keying addresses.
//!
//! One logical contact is reachable in two address spaces:
//!   - primary   (`user@pn`)  - stable, long-lived
//!   - alternate (`user@lid`) - privacy-preserving, correlated to a primary
//!
//! A JID may carry a device index: `user:device@server`. Device 0 is the
//! contact's main device and is omitted when formatting.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty JID")]
    Empty,
    #[error("JID {0:?} has no server part")]
    MissingServer(String),
    #[error("JID {0:?} has an unknown server")]
    UnknownServer(String),
    #[error("JID {0:?} has an invalid device index")]
    InvalidDevice(String),
    #[error("JID {0} does not name a user")]
    NotAUser(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Server {
    Primary,
    Alternate,
    Group,
    Broadcast,
    Newsletter,
}

impl Server {
    pub fn as_str(self) -> &'static str {
        match self {
            Server::Primary => "pn",
            Server::Alternate => "lid",
            Server::Group => "g",
            Server::Broadcast => "broadcast",
            Server::Newsletter => "newsletter",
        }
    }
}

impl FromStr for Server {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pn" => Ok(Server::Primary),
            "lid" => Ok(Server::Alternate),
            "g" => Ok(Server::Group),
            "broadcast" => Ok(Server::Broadcast),
            "newsletter" => Ok(Server::Newsletter),
            other => Err(AddressError::UnknownServer(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub device: Option<u32>,
    pub server: Server,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: Server) -> Self {
        Self {
            user: user.into(),
            device: None,
            server,
        }
    }

    pub fn with_device(mut self, device: u32) -> Self {
        self.device = Some(device);
        self
    }

    pub fn is_user(&self) -> bool {
        matches!(self.server, Server::Primary | Server::Alternate)
    }

    pub fn is_group(&self) -> bool {
        self.server == Server::Group
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == Server::Broadcast
    }

    /// `status@broadcast`, the status feed pseudo-chat.
    pub fn is_status_broadcast(&self) -> bool {
        self.server == Server::Broadcast && self.user == "status"
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == Server::Newsletter
    }

    /// Same JID without its device index.
    pub fn bare(&self) -> Jid {
        Jid::new(self.user.clone(), self.server)
    }

    /// Same user on the same server, ignoring device.
    pub fn same_user(&self, other: &Jid) -> bool {
        self.user == other.user && self.server == other.server
    }

    pub fn to_address(&self) -> Result<Address, AddressError> {
        let kind = match self.server {
            Server::Primary => IdentityKind::Primary,
            Server::Alternate => IdentityKind::Alternate,
            _ => return Err(AddressError::NotAUser(self.to_string())),
        };
        Ok(Address {
            user: self.user.clone(),
            device: self.device.unwrap_or(0),
            kind,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(device) if device != 0 => {
                write!(f, "{}:{}@{}", self.user, device, self.server.as_str())
            }
            _ => write!(f, "{}@{}", self.user, self.server.as_str()),
        }
    }
}

impl FromStr for Jid {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let (local, server) = s
            .split_once('@')
            .ok_or_else(|| AddressError::MissingServer(s.to_string()))?;
        let server: Server = server.parse()?;
        let (user, device) = match local.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse::<u32>()
                    .map_err(|_| AddressError::InvalidDevice(s.to_string()))?;
                (user, Some(device))
            }
            None => (local, None),
        };
        if user.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Jid {
            user: user.to_string(),
            device,
            server,
        })
    }
}

// ── Session-keying address ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Primary,
    Alternate,
}

/// (user, device, identity kind). Keys pairwise sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub user: String,
    pub device: u32,
    pub kind: IdentityKind,
}

impl Address {
    pub fn primary(user: impl Into<String>, device: u32) -> Self {
        Self {
            user: user.into(),
            device,
            kind: IdentityKind::Primary,
        }
    }

    pub fn alternate(user: impl Into<String>, device: u32) -> Self {
        Self {
            user: user.into(),
            device,
            kind: IdentityKind::Alternate,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.kind == IdentityKind::Primary
    }

    pub fn is_alternate(&self) -> bool {
        self.kind == IdentityKind::Alternate
    }

    pub fn to_jid(&self) -> Jid {
        let server = match self.kind {
            IdentityKind::Primary => Server::Primary,
            IdentityKind::Alternate => Server::Alternate,
        };
        Jid::new(self.user.clone(), server).with_device(self.device)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_jid().fmt(f)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Jid>()?.to_address()
    }
}
