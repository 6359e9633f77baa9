//! Layer 2: Object identifiers
//!
//! Oid: hierarchical string address of a document root or nested sub-object
//! OidAllocator: per-replica counter-based id generation

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::identity::ReplicaId;

const COLLECTION_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz-_";
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Object identifier.
///
/// Two canonical forms:
/// - `<collection>/<rootId>` for a document root
/// - `<collection>/<rootId>.<fieldPath>:<localId>` for a nested object
///
/// Because `.` sorts below `:` in every sub-object's suffix, all OIDs
/// under a root lie byte-wise within `[root, root + ":\u{FFFF}"]`. The
/// allocator preserves this by only emitting ids from the alphabets
/// above.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid {
    raw: String,
    /// Byte length of the `<collection>/<rootId>` prefix.
    root_len: usize,
}

impl Oid {
    /// Parse and validate an OID string.
    pub fn parse(s: &str) -> Result<Self, OidError> {
        let s = s.trim();
        let Some((collection, rest)) = s.split_once('/') else {
            return Err(OidError::Malformed {
                raw: s.to_string(),
                reason: "missing '/' separator".into(),
            });
        };
        if collection.is_empty() || !collection.bytes().all(|c| COLLECTION_ALPHABET.contains(&c)) {
            return Err(OidError::Malformed {
                raw: s.to_string(),
                reason: "collection must be non-empty [a-z0-9-_]".into(),
            });
        }

        let (root_id, suffix) = match rest.split_once('.') {
            None => (rest, None),
            Some((root_id, suffix)) => (root_id, Some(suffix)),
        };
        if root_id.is_empty() || !root_id.bytes().all(|c| ID_ALPHABET.contains(&c)) {
            return Err(OidError::Malformed {
                raw: s.to_string(),
                reason: "root id must be non-empty lowercase alphanumeric".into(),
            });
        }

        let root_len = collection.len() + 1 + root_id.len();

        if let Some(suffix) = suffix {
            let Some((field_path, local_id)) = suffix.split_once(':') else {
                return Err(OidError::Malformed {
                    raw: s.to_string(),
                    reason: "sub-object suffix missing ':<localId>'".into(),
                });
            };
            validate_field_path(s, field_path)?;
            if local_id.is_empty() || !local_id.bytes().all(|c| ID_ALPHABET.contains(&c)) {
                return Err(OidError::Malformed {
                    raw: s.to_string(),
                    reason: "local id must be non-empty lowercase alphanumeric".into(),
                });
            }
        }

        Ok(Self {
            raw: s.to_string(),
            root_len,
        })
    }

    /// Build a root OID from validated parts.
    pub fn root(collection: &str, root_id: &str) -> Result<Self, OidError> {
        Self::parse(&format!("{collection}/{root_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn collection(&self) -> &str {
        // root_len was validated to sit past the '/'
        let slash = self.raw.find('/').unwrap_or(0);
        &self.raw[..slash]
    }

    pub fn is_root(&self) -> bool {
        self.raw.len() == self.root_len
    }

    /// The root OID this object belongs to (itself, for roots).
    pub fn root_oid(&self) -> Oid {
        Oid {
            raw: self.raw[..self.root_len].to_string(),
            root_len: self.root_len,
        }
    }

    /// Exclusive-ish upper bound of the sub-object range: `root + ":\u{FFFF}"`.
    ///
    /// Everything allocated under this root sorts at or below this string.
    pub fn range_end(&self) -> String {
        format!("{}:\u{ffff}", &self.raw[..self.root_len])
    }

    /// Whether `other` addresses this root or one of its sub-objects.
    pub fn contains(&self, other: &Oid) -> bool {
        let root = &self.raw[..self.root_len];
        other.as_str() >= root && other.as_str() <= self.range_end().as_str()
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:?})", self.raw)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl TryFrom<String> for Oid {
    type Error = OidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Oid> for String {
    fn from(value: Oid) -> String {
        value.raw
    }
}

fn validate_field_path(raw: &str, field_path: &str) -> Result<(), OidError> {
    if field_path.is_empty() {
        return Err(OidError::Malformed {
            raw: raw.to_string(),
            reason: "empty field path".into(),
        });
    }
    for segment in field_path.split('.') {
        if segment.is_empty()
            || !segment
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            return Err(OidError::Malformed {
                raw: raw.to_string(),
                reason: "field path segments must be non-empty [A-Za-z0-9_]".into(),
            });
        }
    }
    Ok(())
}

/// Per-replica OID allocation.
///
/// Ids embed the allocating replica and a local counter, so two replicas
/// can never collide and a replica replaying its own initialize ops
/// regenerates identical ids.
#[derive(Debug)]
pub struct OidAllocator {
    replica: ReplicaId,
    counter: u64,
}

impl OidAllocator {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            counter: 0,
        }
    }

    /// Resume from a previously persisted counter.
    pub fn resume(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn next_id(&mut self) -> String {
        let id = format!("{}{:06x}", self.replica.simple(), self.counter);
        self.counter += 1;
        id
    }

    /// Allocate a fresh root OID in `collection`.
    pub fn allocate_root(&mut self, collection: &str) -> Result<Oid, OidError> {
        let id = self.next_id();
        Oid::parse(&format!("{collection}/{id}"))
    }

    /// Allocate a sub-object OID under `root` at `field_path`.
    pub fn allocate_child(&mut self, root: &Oid, field_path: &str) -> Result<Oid, OidError> {
        if !root.is_root() {
            return Err(OidError::NotARoot {
                oid: root.as_str().to_string(),
            });
        }
        let id = self.next_id();
        Oid::parse(&format!("{}.{}:{}", root.as_str(), field_path, id))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OidError {
    #[error("malformed oid {raw:?}: {reason}")]
    Malformed { raw: String, reason: String },
    #[error("oid {oid:?} is not a document root")]
    NotARoot { oid: String },
}
