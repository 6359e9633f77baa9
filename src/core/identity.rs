//! Layer 1: Identity atoms
//!
//! ReplicaId / ClientKey: uuid-backed participant identifiers
//! UserId: account identifier carried by verified tokens
//! LibraryId: validated name of a document library

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Replica identifier.
///
/// Generated once per device/profile pair and persisted by the client.
/// Rotated (regenerated) only when the authority rejects the id as owned
/// by a different user.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, InvalidId> {
        Uuid::parse_str(s).map(Self).map_err(|_| InvalidId::Replica {
            raw: s.to_string(),
        })
    }

    /// Lowercase hex without hyphens; fixed width, byte-comparable.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.0.simple())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Stable per-connection key.
///
/// Broadcast fan-out excludes the sender by this identity, never by
/// replica id: the same replica may reconnect and hold two live
/// connections for a short overlap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(Uuid);

impl ClientKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientKey({})", self.0.simple())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// User identifier - non-empty string from the verified token.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidId::User { raw: s })
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({:?})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const LIBRARY_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz-_";

/// Library identifier - a tenant/workspace name.
///
/// Lowercase alphanumeric with `-` and `_`; non-empty.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LibraryId(String);

impl LibraryId {
    pub fn parse(s: &str) -> Result<Self, InvalidId> {
        let s = s.trim();
        if s.is_empty() {
            return Err(InvalidId::Library {
                raw: s.to_string(),
                reason: "empty".into(),
            });
        }
        for c in s.bytes() {
            if !LIBRARY_ALPHABET.contains(&c) {
                return Err(InvalidId::Library {
                    raw: s.to_string(),
                    reason: "contains character outside [a-z0-9-_]".into(),
                });
            }
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LibraryId({:?})", self.0)
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access level carried by a verified token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadWrite,
    ReadOnly,
}

impl Access {
    pub fn can_write(self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// Verified token contents presented with every client message.
///
/// Token issuance and verification are a collaborator's job; the
/// authority trusts what arrives here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub user_id: UserId,
    pub access: Access,
    /// Display profile forwarded to peers via presence; opaque here.
    #[serde(default)]
    pub profile: Option<serde_json::Value>,
}

impl TokenInfo {
    pub fn read_write(user_id: UserId) -> Self {
        Self {
            user_id,
            access: Access::ReadWrite,
            profile: None,
        }
    }

    pub fn read_only(user_id: UserId) -> Self {
        Self {
            user_id,
            access: Access::ReadOnly,
            profile: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidId {
    #[error("invalid replica id {raw:?}")]
    Replica { raw: String },
    #[error("invalid user id {raw:?}")]
    User { raw: String },
    #[error("invalid library id {raw:?}: {reason}")]
    Library { raw: String, reason: String },
}
