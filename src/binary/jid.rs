use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const SERVER_JID: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const HIDDEN_USER_SERVER: &str = "lid";
pub const LEGACY_USER_SERVER: &str = "c.us";
pub const STATUS_BROADCAST_USER: &str = "status";

pub type MessageId = String;

#[derive(Debug, Error)]
pub enum JidError {
    #[error("invalid jid: {0}")]
    InvalidFormat(String),
    #[error("invalid numeric component: {0}")]
    Parse(#[from] std::num::ParseIntError),
}

/// A Jabber-style identifier, `user[_agent][:device]@server`.
///
/// Equality of two JIDs is structural; "same user" comparisons that ignore
/// the device go through [`Jid::is_same_user_as`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub agent: u8,
    pub device: u16,
}

impl Jid {
    pub fn new(user: &str, server: &str) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_string(),
            agent: 0,
            device: 0,
        }
    }

    /// The bare server JID (`@s.whatsapp.net` with no user part).
    pub fn server_jid() -> Self {
        Self::new("", SERVER_JID)
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER && self.user == STATUS_BROADCAST_USER
    }

    pub fn is_lid(&self) -> bool {
        self.server == HIDDEN_USER_SERVER
    }

    /// True for addressable-device JIDs (a nonzero device on a user server).
    pub fn is_ad(&self) -> bool {
        self.device > 0
            && (self.server == DEFAULT_USER_SERVER || self.server == HIDDEN_USER_SERVER)
    }

    pub fn is_same_user_as(&self, other: &Jid) -> bool {
        self.user == other.user
    }

    /// Strips the device and agent, leaving the bare user JID.
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            agent: 0,
            device: 0,
        }
    }

    /// Returns a copy of this JID addressing a specific device.
    pub fn with_device(&self, device: u16) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            agent: self.agent,
            device,
        }
    }

    /// The signal-address form used to key session rows: `user.device`.
    pub fn signal_address(&self) -> crate::signal::address::SignalAddress {
        crate::signal::address::SignalAddress::new(self.user.clone(), self.device as u32)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            return write!(f, "{}", self.server);
        }
        write!(f, "{}", self.user)?;
        if self.agent > 0 {
            write!(f, "_{}", self.agent)?;
        }
        if self.device > 0 {
            write!(f, ":{}", self.device)?;
        }
        write!(f, "@{}", self.server)
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = match s.split_once('@') {
            Some((u, srv)) => (u, srv),
            // A bare server name is a valid JID with no user.
            None => return Ok(Jid::new("", s)),
        };
        if server.is_empty() {
            return Err(JidError::InvalidFormat(s.to_string()));
        }

        let (user_agent, device) = match user_part.split_once(':') {
            Some((ua, d)) if !d.is_empty() => (ua, d.parse::<u16>()?),
            Some((ua, _)) => (ua, 0),
            None => (user_part, 0),
        };
        let (user, agent) = match user_agent.split_once('_') {
            Some((u, a)) => (u, a.parse::<u8>()?),
            None => (user_agent, 0),
        };

        Ok(Jid {
            user: user.to_string(),
            server: server.to_string(),
            agent,
            device,
        })
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for s in [
            "1234567890@s.whatsapp.net",
            "1234567890:12@s.whatsapp.net",
            "1234567890_2:3@lid",
            "120363041234567890@g.us",
            "status@broadcast",
            "s.whatsapp.net",
        ] {
            let jid: Jid = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
        }
    }

    #[test]
    fn device_and_agent_are_parsed() {
        let jid: Jid = "123_1:45@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "123");
        assert_eq!(jid.agent, 1);
        assert_eq!(jid.device, 45);
        assert!(jid.is_ad());
        assert_eq!(jid.to_non_ad().to_string(), "123@s.whatsapp.net");
    }

    #[test]
    fn same_user_ignores_device() {
        let a: Jid = "123@s.whatsapp.net".parse().unwrap();
        let b: Jid = "123:9@s.whatsapp.net".parse().unwrap();
        assert!(a.is_same_user_as(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn classification() {
        let group: Jid = "1203630@g.us".parse().unwrap();
        assert!(group.is_group());
        let lid: Jid = "99887:2@lid".parse().unwrap();
        assert!(lid.is_lid());
        assert!(lid.is_ad());
        let status: Jid = "status@broadcast".parse().unwrap();
        assert!(status.is_status_broadcast());
    }
}
