//! Identifiers
//!
//! Newtypes for every id that crosses a boundary: transport connections,
//! platform identities, rendezvous sessions, levels and avatar entities.
//! All are `Ord` so they can key `BTreeMap`s with stable iteration order.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Transport connection identifier, allocated by the authority's listener.
///
/// Keys the roster and presence tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform identity of a user (the rendezvous service's account id).
///
/// `0` means "unknown".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ExternalId(pub u64);

impl ExternalId {
    /// The "unknown identity" value.
    pub const UNKNOWN: Self = Self(0);

    /// Parse from the decimal form published in session metadata.
    ///
    /// Zero is rejected: a session can never be hosted by the unknown identity.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(v) => Some(Self(v)),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rendezvous session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0.to_be_bytes()[..4])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Level (scene) identifier. Empty means "no level selected".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LevelId(pub String);

impl LevelId {
    /// Create from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The empty "nothing selected" level.
    pub fn none() -> Self {
        Self(String::new())
    }

    /// Whether no level is selected.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Borrow the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LevelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Networked avatar entity identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_id_parse() {
        assert_eq!(ExternalId::parse("76561198000000001"), Some(ExternalId(76561198000000001)));
        assert_eq!(ExternalId::parse(" 42 "), Some(ExternalId(42)));
        assert_eq!(ExternalId::parse(""), None);
        assert_eq!(ExternalId::parse("0"), None);
        assert_eq!(ExternalId::parse("host"), None);
        assert_eq!(ExternalId::parse("-5"), None);
    }

    #[test]
    fn test_level_id_empty() {
        assert!(LevelId::none().is_empty());
        assert!(LevelId::new("   ").is_empty());
        assert!(!LevelId::new("Surf_Intro").is_empty());
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId(0x0102_0304_0506_0708);
        assert_eq!(id.to_string(), "0102030405060708");
        assert_eq!(id.short(), "01020304");
    }
}
