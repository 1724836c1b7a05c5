//! Tagged entity identifiers.
//!
//! Every record carries exactly one canonical id at any time. Records created
//! offline get a client-generated [`EntityId::Local`]; the remote store issues
//! the permanent [`EntityId::Remote`] id on first upload, after which every
//! local reference to the temporary id is rewritten.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Reserved prefix for temporary local identifiers. The remote store never
/// issues ids with this prefix.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Identifier of a synchronized record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    /// Temporary client-generated id, assigned before any remote round-trip.
    Local(String),
    /// Permanent id issued by the remote store.
    Remote(String),
}

impl EntityId {
    /// Mint a fresh temporary local id.
    pub fn new_local() -> Self {
        EntityId::Local(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()))
    }

    /// Wrap a server-issued id.
    pub fn remote(value: impl Into<String>) -> Self {
        EntityId::Remote(value.into())
    }

    /// Classify a raw id string. Total: every string is one of the two
    /// variants, keyed off the reserved prefix.
    pub fn parse(value: &str) -> Self {
        if value.starts_with(LOCAL_ID_PREFIX) {
            EntityId::Local(value.to_string())
        } else {
            EntityId::Remote(value.to_string())
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, EntityId::Local(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntityId::Local(value) | EntityId::Remote(value) => value,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EntityId::parse(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_local_ids_are_local_and_unique() {
        let a = EntityId::new_local();
        let b = EntityId::new_local();
        assert!(a.is_local());
        assert!(b.is_local());
        assert_ne!(a, b);
    }

    #[test]
    fn parse_round_trips_through_json() {
        let local = EntityId::new_local();
        let remote = EntityId::remote("0d9f75f2-9c41-4d6e-a873-2f3f7bafef00");

        for id in [local, remote] {
            let json = serde_json::to_string(&id).expect("serialize id");
            let back: EntityId = serde_json::from_str(&json).expect("deserialize id");
            assert_eq!(back, id);
        }
    }

    #[test]
    fn server_issued_ids_parse_as_remote() {
        let id = EntityId::parse("42");
        assert!(!id.is_local());
        assert_eq!(id.as_str(), "42");
    }
}
