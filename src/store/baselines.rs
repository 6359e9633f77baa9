//! Per-object baseline storage.
//!
//! At most one baseline per OID. `apply_operations` is the compaction
//! primitive: fold an HLC-ascending run of ops into the existing
//! baseline and restamp it with the greatest folded stamp. The caller
//! deletes the folded ops from the log only after this returns.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::{Baseline, Oid, Operation, Stamp, Value, apply_op};

#[derive(Default, Debug)]
pub struct BaselineStore {
    baselines: BTreeMap<Oid, Baseline>,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    pub fn get(&self, oid: &Oid) -> Option<Baseline> {
        self.baselines.get(oid).cloned()
    }

    /// Baselines with stamp strictly greater than `after` (all when
    /// `None`), for initial sync.
    pub fn get_all_after(&self, after: Option<&Stamp>) -> Vec<Baseline> {
        self.baselines
            .values()
            .filter(|baseline| after.is_none_or(|a| &baseline.stamp > a))
            .cloned()
            .collect()
    }

    pub fn upsert(&mut self, baseline: Baseline) {
        self.baselines.insert(baseline.oid.clone(), baseline);
    }

    /// Fold `ops` (HLC-ascending, all on `oid`) into the baseline.
    ///
    /// The new baseline's stamp is the greatest folded stamp, which by
    /// the ascending precondition is the last one.
    pub fn apply_operations(
        &mut self,
        oid: &Oid,
        ops: &[Operation],
    ) -> Result<Baseline, BaselineError> {
        let Some(last) = ops.last() else {
            return Err(BaselineError::EmptyFold { oid: oid.clone() });
        };
        debug_assert!(ops.iter().all(|op| &op.oid == oid));
        debug_assert!(ops.windows(2).all(|w| w[0].stamp < w[1].stamp));

        let mut snapshot = match self.baselines.get(oid) {
            Some(existing) => {
                if last.stamp <= existing.stamp {
                    return Err(BaselineError::StaleFold {
                        oid: oid.clone(),
                        baseline: existing.stamp.clone(),
                        op: last.stamp.clone(),
                    });
                }
                existing.snapshot.clone()
            }
            None => Value::Null,
        };
        for op in ops {
            apply_op(&mut snapshot, &op.data);
        }

        let baseline = Baseline::new(oid.clone(), snapshot, last.stamp.clone());
        self.baselines.insert(oid.clone(), baseline.clone());
        Ok(baseline)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BaselineError {
    #[error("refusing to fold zero operations into {oid}")]
    EmptyFold { oid: Oid },
    #[error("stale fold for {oid}: op stamp {op} at or below baseline stamp {baseline}")]
    StaleFold {
        oid: Oid,
        baseline: Stamp,
        op: Stamp,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OpKind, ReplicaId};
    use uuid::Uuid;

    fn stamp(n: u64) -> Stamp {
        Stamp::new(n, 0, ReplicaId::new(Uuid::from_bytes([1u8; 16])))
    }

    fn set(oid: &Oid, wall: u64, field: &str, value: &str) -> Operation {
        Operation::new(
            oid.clone(),
            stamp(wall),
            OpKind::Set {
                field: field.into(),
                value: Value::from(value),
            },
        )
    }

    #[test]
    fn fold_starts_empty_and_restamps_to_last_op() {
        let oid = Oid::parse("items/aa").unwrap();
        let mut store = BaselineStore::new();
        let baseline = store
            .apply_operations(&oid, &[set(&oid, 1, "a", "1"), set(&oid, 2, "b", "2")])
            .unwrap();
        assert_eq!(baseline.stamp, stamp(2));
        assert_eq!(baseline.snapshot.get("a"), Some(&Value::from("1")));
        assert_eq!(baseline.snapshot.get("b"), Some(&Value::from("2")));
    }

    #[test]
    fn fold_extends_existing_baseline() {
        let oid = Oid::parse("items/aa").unwrap();
        let mut store = BaselineStore::new();
        store
            .apply_operations(&oid, &[set(&oid, 1, "a", "old")])
            .unwrap();
        let baseline = store
            .apply_operations(&oid, &[set(&oid, 5, "a", "new")])
            .unwrap();
        assert_eq!(baseline.stamp, stamp(5));
        assert_eq!(baseline.snapshot.get("a"), Some(&Value::from("new")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stale_fold_is_rejected() {
        let oid = Oid::parse("items/aa").unwrap();
        let mut store = BaselineStore::new();
        store
            .apply_operations(&oid, &[set(&oid, 5, "a", "x")])
            .unwrap();
        let err = store
            .apply_operations(&oid, &[set(&oid, 3, "a", "y")])
            .unwrap_err();
        assert!(matches!(err, BaselineError::StaleFold { .. }));
    }

    #[test]
    fn get_all_after_filters_by_stamp() {
        let a = Oid::parse("items/aa").unwrap();
        let b = Oid::parse("items/bb").unwrap();
        let mut store = BaselineStore::new();
        store.apply_operations(&a, &[set(&a, 1, "f", "x")]).unwrap();
        store.apply_operations(&b, &[set(&b, 9, "f", "y")]).unwrap();

        assert_eq!(store.get_all_after(None).len(), 2);
        let newer = store.get_all_after(Some(&stamp(1)));
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].oid, b);
    }
}
