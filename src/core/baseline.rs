//! Layer 5: Baselines
//!
//! A baseline is the compacted snapshot of one object: the fold of every
//! operation on its OID up to and including the baseline stamp.

use serde::{Deserialize, Serialize};

use super::oid::Oid;
use super::time::Stamp;
use super::value::Value;

/// Compacted per-object snapshot.
///
/// Invariants (enforced by the stores, not this type):
/// - at most one baseline per OID
/// - every logged op on the OID has a stamp strictly greater than
///   `stamp`; ops at or below it were folded in and dropped
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub oid: Oid,
    pub snapshot: Value,
    #[serde(rename = "timestamp")]
    pub stamp: Stamp,
}

impl Baseline {
    pub fn new(oid: Oid, snapshot: Value, stamp: Stamp) -> Self {
        Self {
            oid,
            snapshot,
            stamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::ReplicaId;
    use uuid::Uuid;

    #[test]
    fn wire_shape_matches_protocol() {
        let baseline = Baseline::new(
            Oid::parse("items/ab").unwrap(),
            Value::object(),
            Stamp::new(4, 0, ReplicaId::new(Uuid::from_bytes([1u8; 16]))),
        );
        let json = serde_json::to_value(&baseline).unwrap();
        assert_eq!(json["oid"], "items/ab");
        assert!(json["timestamp"].is_string());
        assert!(json["snapshot"].is_object());
    }
}
