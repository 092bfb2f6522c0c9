use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;


/// Server of ordinary phone-number identities.
pub const PN_SERVER: &str = "s.whatsapp.net";
/// Server of phone-number identities in the hosted namespace.
pub const HOSTED_PN_SERVER: &str = "hosted";
/// Server of linked-identity identifiers.
pub const LID_SERVER: &str = "lid";
/// Server of linked-identity identifiers in the hosted namespace.
pub const HOSTED_LID_SERVER: &str = "hosted.lid";
/// Device number conventionally used by hosted companions.
pub const HOSTED_DEVICE: u16 = 99;

/// JID represents a WhatsApp identifier of the form `user[:device]@server`.
///
/// The user part is opaque: digits for phone-number identities, an opaque
/// token for linked identities. Classification is by server only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JID {
    pub user: String,
    pub device: u16,
    pub server: String,
}

impl JID {
    /// Create a new JID with device 0.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: 0,
            server: server.into(),
        }
    }

    /// Parse a JID from the string format `user[:device]@server`.
    pub fn parse(jid_str: &str) -> Result<Self, Error> {
        let (user_part, server) = jid_str
            .split_once('@')
            .ok_or_else(|| Error::InvalidJid(format!("missing server: {}", jid_str)))?;
        if server.is_empty() || server.contains('@') {
            return Err(Error::InvalidJid(format!("invalid server: {}", jid_str)));
        }

        let (user, device) = match user_part.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidJid(format!("invalid device: {}", jid_str)))?;
                (user, device)
            }
            None => (user_part, 0),
        };
        if user.is_empty() {
            return Err(Error::InvalidJid(format!("empty user: {}", jid_str)));
        }

        Ok(Self {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }

    /// Construct the device-specific phone-number JID for a user. Device 99
    /// lands in the hosted namespace.
    pub fn pn(user: impl Into<String>, device: u16) -> Self {
        let server = if device == HOSTED_DEVICE {
            HOSTED_PN_SERVER
        } else {
            PN_SERVER
        };
        Self {
            user: user.into(),
            device,
            server: server.to_string(),
        }
    }

    /// Construct the device-specific linked-identity JID for a user. Device
    /// 99 lands in the hosted namespace.
    pub fn lid(user: impl Into<String>, device: u16) -> Self {
        let server = if device == HOSTED_DEVICE {
            HOSTED_LID_SERVER
        } else {
            LID_SERVER
        };
        Self {
            user: user.into(),
            device,
            server: server.to_string(),
        }
    }

    /// Check if this is an ordinary phone-number JID
    pub fn is_pn(&self) -> bool {
        self.server == PN_SERVER
    }

    /// Check if this is a hosted phone-number JID
    pub fn is_hosted_pn(&self) -> bool {
        self.server == HOSTED_PN_SERVER
    }

    /// Check if this is a linked-identity JID
    pub fn is_lid(&self) -> bool {
        self.server == LID_SERVER
    }

    /// Check if this is a hosted linked-identity JID
    pub fn is_hosted_lid(&self) -> bool {
        self.server == HOSTED_LID_SERVER
    }

    /// Phone-number JID in either the ordinary or hosted namespace.
    pub fn is_any_pn(&self) -> bool {
        self.is_pn() || self.is_hosted_pn()
    }

    /// Linked-identity JID in either the ordinary or hosted namespace.
    pub fn is_any_lid(&self) -> bool {
        self.is_lid() || self.is_hosted_lid()
    }

    /// Project a known device onto a peer identity: the target's user and
    /// server with the source's device number.
    pub fn transfer_device(src: &JID, target: &JID) -> JID {
        JID {
            user: target.user.clone(),
            device: src.device,
            server: target.server.clone(),
        }
    }

    /// String representation without the device segment.
    pub fn to_non_device(&self) -> String {
        format!("{}@{}", self.user, self.server)
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device != 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl std::str::FromStr for JID {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
