//! Layer 4: Operations
//!
//! The unit of change: one field-level or list-level mutation on one
//! object, stamped by the producing replica's HLC.

use serde::{Deserialize, Serialize};

use super::identity::ReplicaId;
use super::oid::Oid;
use super::time::Stamp;
use super::value::Value;

/// One mutation on one object.
///
/// Identity for deduplication is `(oid, stamp)` - the authority's log
/// silently ignores a second insert of the same pair, which is what makes
/// rebroadcast loops harmless.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub oid: Oid,
    #[serde(rename = "timestamp")]
    pub stamp: Stamp,
    #[serde(rename = "replicaId")]
    pub replica: ReplicaId,
    pub data: OpKind,
}

impl Operation {
    pub fn new(oid: Oid, stamp: Stamp, data: OpKind) -> Self {
        let replica = stamp.replica;
        Self {
            oid,
            stamp,
            replica,
            data,
        }
    }

    /// Dedup key in the log.
    pub fn key(&self) -> (Oid, Stamp) {
        (self.oid.clone(), self.stamp.clone())
    }

    /// Coordinate by which a pending op supersedes earlier pending ops.
    pub fn effect_key(&self) -> EffectKey {
        self.data.effect_key()
    }
}

/// Operation payload, tagged `op` on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum OpKind {
    /// Set a field on an object.
    Set { field: String, value: Value },
    /// Remove a field from an object.
    Delete { field: String },
    /// Insert into an array at an index (clamped to length).
    ListInsert { index: usize, value: Value },
    /// Move an element between positions. Out-of-range moves are no-ops.
    ListMove { from: usize, to: usize },
    /// Delete an element. Out-of-range deletes are no-ops.
    ListDelete { index: usize },
    /// Create (or reset) the object with a full snapshot.
    Initialize { snapshot: Value },
}

impl OpKind {
    pub fn effect_key(&self) -> EffectKey {
        match self {
            OpKind::Set { field, .. } | OpKind::Delete { field } => {
                EffectKey::Field(field.clone())
            }
            OpKind::Initialize { .. } => EffectKey::Object,
            OpKind::ListInsert { .. } | OpKind::ListMove { .. } | OpKind::ListDelete { .. } => {
                EffectKey::Positional
            }
        }
    }

    /// Values carried by this op (for ref-cycle checks at write time).
    pub fn value(&self) -> Option<&Value> {
        match self {
            OpKind::Set { value, .. } | OpKind::ListInsert { value, .. } => Some(value),
            OpKind::Initialize { snapshot } => Some(snapshot),
            _ => None,
        }
    }
}

/// Supersession coordinate within one object's pending ops.
///
/// - `Field(f)`: set/delete on the same field collapse to the latest
/// - `Object`: an initialize replaces everything pending for the oid
/// - `Positional`: list edits never supersede (ordering matters)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EffectKey {
    Field(String),
    Object,
    Positional,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn stamp(n: u64) -> Stamp {
        Stamp::new(n, 0, ReplicaId::new(Uuid::from_bytes([1u8; 16])))
    }

    #[test]
    fn wire_shape_uses_op_discriminator() {
        let op = Operation::new(
            Oid::parse("items/ab").unwrap(),
            stamp(7),
            OpKind::Set {
                field: "title".into(),
                value: Value::from("hello"),
            },
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["oid"], "items/ab");
        assert_eq!(json["data"]["op"], "set");
        assert_eq!(json["data"]["field"], "title");
        assert_eq!(json["data"]["value"], "hello");
        assert!(json["timestamp"].is_string());

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn list_kinds_use_kebab_names() {
        let json = serde_json::to_value(OpKind::ListInsert {
            index: 0,
            value: Value::Null,
        })
        .unwrap();
        assert_eq!(json["op"], "list-insert");

        let json = serde_json::to_value(OpKind::ListMove { from: 1, to: 0 }).unwrap();
        assert_eq!(json["op"], "list-move");
    }

    #[test]
    fn effect_keys_group_set_and_delete() {
        let set = OpKind::Set {
            field: "x".into(),
            value: Value::Null,
        };
        let del = OpKind::Delete { field: "x".into() };
        assert_eq!(set.effect_key(), del.effect_key());
        assert_eq!(
            OpKind::Initialize {
                snapshot: Value::object()
            }
            .effect_key(),
            EffectKey::Object
        );
        assert_eq!(
            OpKind::ListDelete { index: 0 }.effect_key(),
            EffectKey::Positional
        );
    }
}
