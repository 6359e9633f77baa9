//! Layer 6: Replica records
//!
//! What the authority knows about each participant: type, ownership,
//! acknowledgment progress, and liveness.

use serde::{Deserialize, Serialize};

use super::identity::{ReplicaId, UserId};
use super::time::{Stamp, WallClock};

/// How a replica participates in a library.
///
/// Read-only types never produce writes, so they do not gate compaction:
/// the global ack floor ignores them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaType {
    Realtime,
    Push,
    Pull,
    ReadOnlyRealtime,
    ReadOnlyPull,
}

impl ReplicaType {
    pub fn is_read_only(self) -> bool {
        matches!(self, ReplicaType::ReadOnlyRealtime | ReplicaType::ReadOnlyPull)
    }

    /// Whether this replica's acks hold back the rebase horizon.
    pub fn gates_compaction(self) -> bool {
        !self.is_read_only()
    }
}

/// Registry row for one replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub replica_id: ReplicaId,
    pub user_id: UserId,
    pub replica_type: ReplicaType,
    /// Highest stamp this replica has acknowledged applying, if any.
    pub acked: Option<Stamp>,
    pub last_seen: WallClock,
    pub created_at: WallClock,
}

impl ReplicaInfo {
    pub fn new(
        replica_id: ReplicaId,
        user_id: UserId,
        replica_type: ReplicaType,
        now: WallClock,
    ) -> Self {
        Self {
            replica_id,
            user_id,
            replica_type,
            acked: None,
            last_seen: now,
            created_at: now,
        }
    }

    /// Truant = silent longer than the configured threshold. Truant
    /// replicas are excluded from consensus but never deleted implicitly.
    pub fn is_truant_at(&self, now: WallClock, threshold_ms: u64) -> bool {
        now.saturating_elapsed_since(self.last_seen) > threshold_ms
    }
}
