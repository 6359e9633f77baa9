//! Append-ordered operation storage.
//!
//! The log is keyed by `(oid, stamp)` - the same primary key the durable
//! backend's `operations` table carries - with a secondary stamp-ordered
//! index for global range reads. Insertion is idempotent on that key, so
//! rebroadcast loops and duplicated uploads cannot double-apply.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::core::{Oid, Operation, Stamp};

#[derive(Default, Debug)]
pub struct OperationLog {
    by_object: BTreeMap<(Oid, Stamp), Operation>,
    by_stamp: BTreeSet<(Stamp, Oid)>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_object.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_object.is_empty()
    }

    pub fn contains(&self, key: &(Oid, Stamp)) -> bool {
        self.by_object.contains_key(key)
    }

    /// Insert a batch. Duplicate `(oid, stamp)` pairs are silently
    /// ignored; structurally corrupt operations are dropped with a
    /// warning and never retried. Returns how many were actually added.
    pub fn insert_all(&mut self, ops: &[Operation]) -> usize {
        let mut inserted = 0;
        for op in ops {
            if op.replica != op.stamp.replica {
                warn!(
                    oid = %op.oid,
                    stamp = %op.stamp,
                    "dropping corrupt operation: replica does not match stamp producer"
                );
                continue;
            }
            let key = op.key();
            if self.by_object.contains_key(&key) {
                continue;
            }
            self.by_stamp.insert((op.stamp.clone(), op.oid.clone()));
            self.by_object.insert(key, op.clone());
            inserted += 1;
        }
        inserted
    }

    /// All operations with stamp strictly greater than `after` (or the
    /// whole log when `None`), stamp ascending.
    pub fn get_after(&self, after: Option<&Stamp>) -> Vec<Operation> {
        self.by_stamp
            .iter()
            .filter(|(stamp, _)| after.is_none_or(|a| stamp > a))
            .map(|(stamp, oid)| self.by_object[&(oid.clone(), stamp.clone())].clone())
            .collect()
    }

    /// All operations with stamp strictly less than `before`, ascending.
    pub fn get_before(&self, before: &Stamp) -> Vec<Operation> {
        self.by_stamp
            .iter()
            .take_while(|(stamp, _)| stamp < before)
            .map(|(stamp, oid)| self.by_object[&(oid.clone(), stamp.clone())].clone())
            .collect()
    }

    /// Operations for one object, optionally after a stamp, ascending.
    pub fn get_for_oid(&self, oid: &Oid, after: Option<&Stamp>) -> Vec<Operation> {
        self.by_object
            .range((oid.clone(), Stamp::new(0, 0, zero_replica()))..)
            .take_while(|((o, _), _)| o == oid)
            .filter(|((_, stamp), _)| after.is_none_or(|a| stamp > a))
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Remove a specific set. The caller must already have folded them
    /// into a baseline durably.
    pub fn drop_ops(&mut self, ops: &[Operation]) {
        for op in ops {
            if self.by_object.remove(&op.key()).is_some() {
                self.by_stamp.remove(&(op.stamp.clone(), op.oid.clone()));
            }
        }
    }

    /// Greatest stamp currently in the log.
    pub fn max_stamp(&self) -> Option<Stamp> {
        self.by_stamp.iter().next_back().map(|(stamp, _)| stamp.clone())
    }
}

fn zero_replica() -> crate::core::ReplicaId {
    crate::core::ReplicaId::new(uuid::Uuid::nil())
}
