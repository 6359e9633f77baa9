//! Layer 7: Applying operations and materialising snapshots
//!
//! One entrypoint folds an operation into a value; materialisation
//! resolves refs recursively from baselines plus newer ops. Conflict
//! resolution is emergent: values are computed by applying ops in HLC
//! order, so the greater stamp wins a field and list edits interleave
//! positionally.

use std::collections::HashSet;

use thiserror::Error;

use super::baseline::Baseline;
use super::oid::Oid;
use super::op::{OpKind, Operation};
use super::time::Stamp;
use super::value::Value;

/// Fold one operation into a value.
///
/// Never fails: the edge cases the protocol allows (set on a fresh
/// object, out-of-range list indices) are defined as coercions or
/// no-ops so every replica computes the same result from the same
/// op sequence.
pub fn apply_op(value: &mut Value, op: &OpKind) {
    match op {
        OpKind::Initialize { snapshot } => {
            *value = snapshot.clone();
        }
        OpKind::Set { field, value: v } => {
            let map = match value {
                Value::Object(map) => map,
                _ => {
                    // First write to a fresh (or non-object) target starts an object.
                    *value = Value::object();
                    match value {
                        Value::Object(map) => map,
                        _ => unreachable!(),
                    }
                }
            };
            map.insert(field.clone(), v.clone());
        }
        OpKind::Delete { field } => {
            if let Value::Object(map) = value {
                map.remove(field);
            }
        }
        OpKind::ListInsert { index, value: v } => {
            let items = match value {
                Value::Array(items) => items,
                _ => {
                    *value = Value::Array(Vec::new());
                    match value {
                        Value::Array(items) => items,
                        _ => unreachable!(),
                    }
                }
            };
            let at = (*index).min(items.len());
            items.insert(at, v.clone());
        }
        OpKind::ListMove { from, to } => {
            if let Value::Array(items) = value
                && *from < items.len()
            {
                let item = items.remove(*from);
                let at = (*to).min(items.len());
                items.insert(at, item);
            }
        }
        OpKind::ListDelete { index } => {
            if let Value::Array(items) = value
                && *index < items.len()
            {
                items.remove(*index);
            }
        }
    }
}

/// Fold `ops` (already HLC-ascending) into `base`.
pub fn apply_all(base: &mut Value, ops: &[Operation]) {
    for op in ops {
        apply_op(base, &op.data);
    }
}

/// Read access to one side's baselines and log, for materialisation.
///
/// Implemented by both the authority's stores and the client's local
/// store; `ops_for` must return stamps ascending.
pub trait ObjectSource {
    fn baseline(&self, oid: &Oid) -> Option<Baseline>;
    fn ops_for(&self, oid: &Oid, after: Option<&Stamp>) -> Vec<Operation>;
}

/// The un-resolved state of one object: baseline plus newer ops.
pub fn object_state(source: &impl ObjectSource, oid: &Oid) -> Value {
    let (mut value, after) = match source.baseline(oid) {
        Some(baseline) => (baseline.snapshot, Some(baseline.stamp)),
        None => (Value::Null, None),
    };
    for op in source.ops_for(oid, after.as_ref()) {
        apply_op(&mut value, &op.data);
    }
    value
}

/// Materialise a document: resolve refs recursively from `oid`.
///
/// The visited set tracks the current resolution path, so diamonds
/// (the same object referenced twice) are fine while genuine cycles
/// surface as an error.
pub fn materialize(source: &impl ObjectSource, oid: &Oid) -> Result<Value, MaterializeError> {
    let mut path = HashSet::new();
    path.insert(oid.clone());
    let state = object_state(source, oid);
    resolve(source, state, &mut path)
}

fn resolve(
    source: &impl ObjectSource,
    value: Value,
    path: &mut HashSet<Oid>,
) -> Result<Value, MaterializeError> {
    Ok(match value {
        Value::Ref(oid) => {
            if !path.insert(oid.clone()) {
                return Err(MaterializeError::CycleDetected { oid });
            }
            let state = object_state(source, &oid);
            let resolved = resolve(source, state, path)?;
            path.remove(&oid);
            resolved
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| resolve(source, item, path))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| Ok((k, resolve(source, v, path)?)))
                .collect::<Result<_, MaterializeError>>()?,
        ),
        other => other,
    })
}

/// Write-time guard: would writing `candidate` at `oid` close a ref cycle?
///
/// Walks the ref graph reachable from the candidate value through the
/// source's current state, with `oid` seeded on the path.
pub fn ensure_acyclic(
    source: &impl ObjectSource,
    oid: &Oid,
    candidate: &Value,
) -> Result<(), MaterializeError> {
    let mut refs = Vec::new();
    candidate.collect_refs(&mut refs);
    let mut path = HashSet::new();
    path.insert(oid.clone());
    for target in refs {
        walk_refs(source, &target, &mut path)?;
    }
    Ok(())
}

fn walk_refs(
    source: &impl ObjectSource,
    oid: &Oid,
    path: &mut HashSet<Oid>,
) -> Result<(), MaterializeError> {
    if !path.insert(oid.clone()) {
        return Err(MaterializeError::CycleDetected { oid: oid.clone() });
    }
    let mut refs = Vec::new();
    object_state(source, oid).collect_refs(&mut refs);
    for target in refs {
        walk_refs(source, &target, path)?;
    }
    path.remove(oid);
    Ok(())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MaterializeError {
    #[error("reference cycle through {oid}")]
    CycleDetected { oid: Oid },
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::identity::ReplicaId;
    use uuid::Uuid;

    fn stamp(n: u64) -> Stamp {
        Stamp::new(n, 0, ReplicaId::new(Uuid::from_bytes([1u8; 16])))
    }

    fn oid(s: &str) -> Oid {
        Oid::parse(s).unwrap()
    }

    #[derive(Default)]
    struct MapSource {
        baselines: BTreeMap<Oid, Baseline>,
        ops: Vec<Operation>,
    }

    impl ObjectSource for MapSource {
        fn baseline(&self, oid: &Oid) -> Option<Baseline> {
            self.baselines.get(oid).cloned()
        }

        fn ops_for(&self, oid: &Oid, after: Option<&Stamp>) -> Vec<Operation> {
            let mut ops: Vec<Operation> = self
                .ops
                .iter()
                .filter(|op| &op.oid == oid && after.is_none_or(|a| &op.stamp > a))
                .cloned()
                .collect();
            ops.sort_by(|a, b| a.stamp.cmp(&b.stamp));
            ops
        }
    }

    #[test]
    fn later_set_wins_the_field() {
        let mut value = Value::Null;
        apply_op(
            &mut value,
            &OpKind::Set {
                field: "title".into(),
                value: Value::from("A"),
            },
        );
        apply_op(
            &mut value,
            &OpKind::Set {
                field: "title".into(),
                value: Value::from("B"),
            },
        );
        assert_eq!(value.get("title"), Some(&Value::from("B")));
    }

    #[test]
    fn list_edits_clamp_and_noop_out_of_range() {
        let mut value = Value::Null;
        apply_op(
            &mut value,
            &OpKind::ListInsert {
                index: 99,
                value: Value::from("a"),
            },
        );
        apply_op(
            &mut value,
            &OpKind::ListInsert {
                index: 0,
                value: Value::from("b"),
            },
        );
        apply_op(&mut value, &OpKind::ListMove { from: 5, to: 0 });
        apply_op(&mut value, &OpKind::ListDelete { index: 7 });
        assert_eq!(
            value,
            Value::Array(vec![Value::from("b"), Value::from("a")])
        );
    }

    #[test]
    fn move_reorders_within_bounds() {
        let mut value = Value::Array(vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        apply_op(&mut value, &OpKind::ListMove { from: 2, to: 0 });
        assert_eq!(
            value,
            Value::Array(vec![Value::from("c"), Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn object_state_folds_baseline_then_newer_ops() {
        let item = oid("items/aa");
        let mut source = MapSource::default();
        let mut base = Value::object();
        apply_op(
            &mut base,
            &OpKind::Set {
                field: "title".into(),
                value: Value::from("old"),
            },
        );
        source
            .baselines
            .insert(item.clone(), Baseline::new(item.clone(), base, stamp(5)));
        // Below the baseline stamp: must be ignored.
        source.ops.push(Operation::new(
            item.clone(),
            stamp(3),
            OpKind::Set {
                field: "title".into(),
                value: Value::from("stale"),
            },
        ));
        source.ops.push(Operation::new(
            item.clone(),
            stamp(8),
            OpKind::Set {
                field: "title".into(),
                value: Value::from("new"),
            },
        ));

        let state = object_state(&source, &item);
        assert_eq!(state.get("title"), Some(&Value::from("new")));
    }

    #[test]
    fn materialize_resolves_refs_and_shares_diamonds() {
        let root = oid("docs/root");
        let shared = oid("docs/shared");
        let mut source = MapSource::default();
        source.ops.push(Operation::new(
            shared.clone(),
            stamp(1),
            OpKind::Initialize {
                snapshot: Value::from("leaf"),
            },
        ));
        let mut snapshot = BTreeMap::new();
        snapshot.insert("a".to_string(), Value::Ref(shared.clone()));
        snapshot.insert("b".to_string(), Value::Ref(shared.clone()));
        source.ops.push(Operation::new(
            root.clone(),
            stamp(2),
            OpKind::Initialize {
                snapshot: Value::Object(snapshot),
            },
        ));

        let doc = materialize(&source, &root).unwrap();
        assert_eq!(doc.get("a"), Some(&Value::from("leaf")));
        assert_eq!(doc.get("b"), Some(&Value::from("leaf")));
    }

    #[test]
    fn materialize_surfaces_cycles() {
        let a = oid("docs/aa");
        let b = oid("docs/bb");
        let mut source = MapSource::default();
        let mut obj = BTreeMap::new();
        obj.insert("next".to_string(), Value::Ref(b.clone()));
        source.ops.push(Operation::new(
            a.clone(),
            stamp(1),
            OpKind::Initialize {
                snapshot: Value::Object(obj),
            },
        ));
        let mut obj = BTreeMap::new();
        obj.insert("next".to_string(), Value::Ref(a.clone()));
        source.ops.push(Operation::new(
            b.clone(),
            stamp(2),
            OpKind::Initialize {
                snapshot: Value::Object(obj),
            },
        ));

        let err = materialize(&source, &a).unwrap_err();
        assert!(matches!(err, MaterializeError::CycleDetected { .. }));
    }

    #[test]
    fn ensure_acyclic_rejects_a_write_that_closes_a_loop() {
        let a = oid("docs/aa");
        let b = oid("docs/bb");
        let mut source = MapSource::default();
        let mut obj = BTreeMap::new();
        obj.insert("back".to_string(), Value::Ref(a.clone()));
        source.ops.push(Operation::new(
            b.clone(),
            stamp(1),
            OpKind::Initialize {
                snapshot: Value::Object(obj),
            },
        ));

        let candidate = Value::Ref(b.clone());
        let err = ensure_acyclic(&source, &a, &candidate).unwrap_err();
        assert!(matches!(err, MaterializeError::CycleDetected { .. }));

        // A fresh target with no path back is fine.
        let c = oid("docs/cc");
        assert!(ensure_acyclic(&source, &c, &Value::Ref(a.clone())).is_ok());
    }
}
