//! Replica registry: who participates in a library and how far each
//! participant has acknowledged.
//!
//! The registry is the consensus input for compaction: the global ack
//! is the minimum acknowledged stamp across every replica that gates it.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::core::{ReplicaId, ReplicaInfo, ReplicaType, Stamp, UserId, WallClock};

/// Outcome of a handshake lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RosterStatus {
    New,
    Existing,
    Truant,
}

pub struct ReplicaRegistry {
    rows: Vec<ReplicaInfo>,
    truancy_ms: u64,
}

impl ReplicaRegistry {
    pub fn new(truancy_ms: u64) -> Self {
        Self {
            rows: Vec::new(),
            truancy_ms,
        }
    }

    pub fn truancy_ms(&self) -> u64 {
        self.truancy_ms
    }

    pub fn get(&self, replica_id: &ReplicaId) -> Option<&ReplicaInfo> {
        self.rows.iter().find(|row| &row.replica_id == replica_id)
    }

    pub fn rows(&self) -> &[ReplicaInfo] {
        &self.rows
    }

    /// Whether this replica id is already registered to a different user.
    pub fn owner_conflict(&self, replica_id: &ReplicaId, user_id: &UserId) -> bool {
        self.get(replica_id)
            .is_some_and(|row| &row.user_id != user_id)
    }

    /// Look up or register a replica. Callers check ownership first.
    pub fn get_or_create(
        &mut self,
        replica_id: ReplicaId,
        user_id: UserId,
        replica_type: ReplicaType,
        now: WallClock,
    ) -> (RosterStatus, ReplicaInfo) {
        if let Some(row) = self
            .rows
            .iter_mut()
            .find(|row| row.replica_id == replica_id)
        {
            let status = if row.is_truant_at(now, self.truancy_ms) {
                RosterStatus::Truant
            } else {
                RosterStatus::Existing
            };
            row.last_seen = now;
            row.replica_type = replica_type;
            return (status, row.clone());
        }

        let row = ReplicaInfo::new(replica_id, user_id, replica_type, now);
        self.rows.push(row.clone());
        (RosterStatus::New, row)
    }

    /// Monotonic: the acked stamp never moves backwards.
    pub fn update_acknowledged(
        &mut self,
        replica_id: &ReplicaId,
        stamp: Stamp,
    ) -> Result<(), RegistryError> {
        let row = self.row_mut(replica_id)?;
        if row.acked.as_ref().is_none_or(|acked| &stamp > acked) {
            row.acked = Some(stamp);
        }
        Ok(())
    }

    pub fn update_last_seen(
        &mut self,
        replica_id: &ReplicaId,
        now: WallClock,
    ) -> Result<(), RegistryError> {
        self.row_mut(replica_id)?.last_seen = now;
        Ok(())
    }

    /// Drop the row entirely; used when a client requests a full resync.
    pub fn forget(&mut self, replica_id: &ReplicaId) {
        self.rows.retain(|row| &row.replica_id != replica_id);
    }

    /// The compaction horizon: minimum acked stamp across all non-truant,
    /// write-capable replicas. `active` adds currently-connected replicas
    /// regardless of truancy state. `None` when any qualifying replica
    /// has never acknowledged, or when nothing qualifies at all.
    pub fn global_ack(&self, now: WallClock, active: &BTreeSet<ReplicaId>) -> Option<Stamp> {
        let mut floor: Option<Stamp> = None;
        let mut qualified = false;
        for row in &self.rows {
            if !row.replica_type.gates_compaction() {
                continue;
            }
            if row.is_truant_at(now, self.truancy_ms) && !active.contains(&row.replica_id) {
                continue;
            }
            qualified = true;
            match &row.acked {
                None => return None,
                Some(acked) => {
                    if floor.as_ref().is_none_or(|f| acked < f) {
                        floor = Some(acked.clone());
                    }
                }
            }
        }
        if qualified { floor } else { None }
    }

    fn row_mut(&mut self, replica_id: &ReplicaId) -> Result<&mut ReplicaInfo, RegistryError> {
        self.rows
            .iter_mut()
            .find(|row| &row.replica_id == replica_id)
            .ok_or(RegistryError::UnknownReplica {
                replica_id: *replica_id,
            })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown replica {replica_id}")]
    UnknownReplica { replica_id: ReplicaId },
}
