//! Layer 0: Time primitives
//!
//! Stamp (HLC) for causal ordering.
//! WallClock for truancy/lease decisions (not ordering).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::identity::ReplicaId;

/// HLC timestamp - the ordering primitive.
///
/// (wall_ms, counter, replica) forms a total order across all replicas.
/// The canonical string form is fixed-width lower hex, so byte order of
/// the encoded string equals `Ord` on the struct. Equality implies the
/// same producer at the same instant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Stamp {
    pub wall_ms: u64,
    pub counter: u32,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(wall_ms: u64, counter: u32, replica: ReplicaId) -> Self {
        Self {
            wall_ms,
            counter,
            replica,
        }
    }

    /// Canonical wire encoding: `{wall_ms:016x}-{counter:08x}-{replica}`.
    ///
    /// Every component is fixed width, so lexicographic comparison of two
    /// encoded stamps agrees with `Ord`.
    pub fn encode(&self) -> String {
        format!(
            "{:016x}-{:08x}-{}",
            self.wall_ms,
            self.counter,
            self.replica.simple()
        )
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_ms
            .cmp(&other.wall_ms)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.replica.cmp(&other.replica)) // deterministic tiebreak
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for Stamp {
    type Err = StampParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let (Some(wall), Some(counter), Some(replica)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(StampParseError::Malformed { raw: s.to_string() });
        };
        if wall.len() != 16 || counter.len() != 8 {
            return Err(StampParseError::Malformed { raw: s.to_string() });
        }
        let wall_ms = u64::from_str_radix(wall, 16)
            .map_err(|_| StampParseError::Malformed { raw: s.to_string() })?;
        let counter = u32::from_str_radix(counter, 16)
            .map_err(|_| StampParseError::Malformed { raw: s.to_string() })?;
        let replica = ReplicaId::parse(replica)
            .map_err(|_| StampParseError::Malformed { raw: s.to_string() })?;
        Ok(Self {
            wall_ms,
            counter,
            replica,
        })
    }
}

impl TryFrom<String> for Stamp {
    type Error = StampParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Stamp> for String {
    fn from(value: Stamp) -> String {
        value.encode()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StampParseError {
    #[error("malformed stamp {raw:?}")]
    Malformed { raw: String },
}

/// Wall clock for truancy decisions - NOT for causal ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClock(pub u64);

impl WallClock {
    pub fn now() -> Self {
        let source = wall_clock_source()
            .read()
            .unwrap_or_else(|err| err.into_inner());
        Self(source.now_ms())
    }

    pub fn saturating_elapsed_since(self, earlier: WallClock) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

pub trait WallClockSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

struct SystemWallClockSource;

impl WallClockSource for SystemWallClockSource {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

fn wall_clock_source() -> &'static RwLock<Arc<dyn WallClockSource>> {
    static SOURCE: OnceLock<RwLock<Arc<dyn WallClockSource>>> = OnceLock::new();
    SOURCE.get_or_init(|| RwLock::new(Arc::new(SystemWallClockSource)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn replica(byte: u8) -> ReplicaId {
        ReplicaId::new(Uuid::from_bytes([byte; 16]))
    }

    #[test]
    fn ord_matches_encoded_byte_order() {
        let a = Stamp::new(5, 0, replica(1));
        let b = Stamp::new(5, 1, replica(1));
        let c = Stamp::new(6, 0, replica(1));
        let d = Stamp::new(5, 1, replica(2));

        let mut structs = vec![c.clone(), d.clone(), a.clone(), b.clone()];
        structs.sort();

        let mut strings = vec![c.encode(), d.encode(), a.encode(), b.encode()];
        strings.sort();

        let encoded: Vec<String> = structs.iter().map(Stamp::encode).collect();
        assert_eq!(encoded, strings);
        assert_eq!(structs, vec![a, b, d, c]);
    }

    #[test]
    fn round_trips_through_string() {
        let stamp = Stamp::new(0x1234_5678, 42, replica(7));
        let parsed: Stamp = stamp.encode().parse().unwrap();
        assert_eq!(parsed, stamp);
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!("".parse::<Stamp>().is_err());
        assert!("12-34".parse::<Stamp>().is_err());
        assert!(
            "zzzzzzzzzzzzzzzz-00000000-00000000000000000000000000000001"
                .parse::<Stamp>()
                .is_err()
        );
    }

    #[test]
    fn serde_uses_string_form() {
        let stamp = Stamp::new(99, 3, replica(9));
        let json = serde_json::to_string(&stamp).unwrap();
        assert_eq!(json, format!("\"{}\"", stamp.encode()));
        let back: Stamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stamp);
    }
}
