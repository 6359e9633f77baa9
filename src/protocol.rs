//! Wire protocol between replicas and the authority.
//!
//! JSON messages with a `type` discriminator and camelCase fields.
//! Transport framing (WebSocket, HTTP) is a collaborator's job; this
//! module only defines the shapes.

use serde::{Deserialize, Serialize};

use crate::core::{Baseline, Operation, ReplicaId, ReplicaType, Stamp, UserId};

/// Replica → authority.
///
/// Every message carries the sender's replica id and the sender's HLC
/// reading at send time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Sync {
        replica_id: ReplicaId,
        replica_type: ReplicaType,
        #[serde(default)]
        resync_all: bool,
        schema_version: u32,
        timestamp: Stamp,
    },
    SyncStep2 {
        replica_id: ReplicaId,
        operations: Vec<Operation>,
        baselines: Vec<Baseline>,
        timestamp: Stamp,
    },
    Op {
        replica_id: ReplicaId,
        operations: Vec<Operation>,
        timestamp: Stamp,
    },
    Ack {
        replica_id: ReplicaId,
        timestamp: Stamp,
    },
    Heartbeat {
        replica_id: ReplicaId,
        timestamp: Stamp,
    },
    PresenceUpdate {
        replica_id: ReplicaId,
        presence: serde_json::Value,
        timestamp: Stamp,
    },
}

impl ClientMessage {
    pub fn replica_id(&self) -> ReplicaId {
        match self {
            ClientMessage::Sync { replica_id, .. }
            | ClientMessage::SyncStep2 { replica_id, .. }
            | ClientMessage::Op { replica_id, .. }
            | ClientMessage::Ack { replica_id, .. }
            | ClientMessage::Heartbeat { replica_id, .. }
            | ClientMessage::PresenceUpdate { replica_id, .. } => *replica_id,
        }
    }

    pub fn timestamp(&self) -> &Stamp {
        match self {
            ClientMessage::Sync { timestamp, .. }
            | ClientMessage::SyncStep2 { timestamp, .. }
            | ClientMessage::Op { timestamp, .. }
            | ClientMessage::Ack { timestamp, .. }
            | ClientMessage::Heartbeat { timestamp, .. }
            | ClientMessage::PresenceUpdate { timestamp, .. } => timestamp,
        }
    }
}

/// Authority → replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SyncResp {
        operations: Vec<Operation>,
        baselines: Vec<Baseline>,
        /// "Send me everything you have after this" - step two of sync.
        provide_changes_since: Option<Stamp>,
        global_ack_timestamp: Option<Stamp>,
        peer_presence: Vec<PresenceState>,
        overwrite_local_data: bool,
    },
    /// Rebroadcast of another replica's delivery.
    OpRe {
        operations: Vec<Operation>,
        baselines: Vec<Baseline>,
        replica_id: ReplicaId,
        global_ack_timestamp: Option<Stamp>,
    },
    GlobalAck {
        timestamp: Stamp,
    },
    PresenceChanged {
        replica_id: ReplicaId,
        user_info: PresenceState,
    },
    PresenceOffline {
        replica_id: ReplicaId,
        user_id: UserId,
    },
    HeartbeatResponse,
    Forbidden {
        reason: ForbiddenReason,
    },
}

/// Why a request was refused. Ownership violations tell the client to
/// rotate its replica id and resync; read-only refusals roll back the
/// attempted write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForbiddenReason {
    ReadOnly,
    ReplicaOwnership,
}

/// One user's ephemeral presence entry as peers see it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub id: UserId,
    pub replica_id: ReplicaId,
    pub presence: serde_json::Value,
    #[serde(default)]
    pub profile: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Oid, OpKind, Value};
    use uuid::Uuid;

    fn replica(byte: u8) -> ReplicaId {
        ReplicaId::new(Uuid::from_bytes([byte; 16]))
    }

    fn stamp(n: u64) -> Stamp {
        Stamp::new(n, 0, replica(1))
    }

    #[test]
    fn client_messages_use_type_discriminator() {
        let msg = ClientMessage::Sync {
            replica_id: replica(1),
            replica_type: ReplicaType::Realtime,
            resync_all: false,
            schema_version: 3,
            timestamp: stamp(1),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sync");
        assert_eq!(json["schemaVersion"], 3);
        assert!(json["replicaId"].is_string());

        let back: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn step2_and_op_re_round_trip() {
        let op = Operation::new(
            Oid::parse("items/ab").unwrap(),
            stamp(2),
            OpKind::Set {
                field: "title".into(),
                value: Value::from("x"),
            },
        );
        let msg = ClientMessage::SyncStep2 {
            replica_id: replica(1),
            operations: vec![op.clone()],
            baselines: vec![],
            timestamp: stamp(3),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sync-step2");

        let reply = ServerMessage::OpRe {
            operations: vec![op],
            baselines: vec![],
            replica_id: replica(1),
            global_ack_timestamp: None,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "op-re");
        assert_eq!(json["globalAckTimestamp"], serde_json::Value::Null);
        let back: ServerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn resync_all_defaults_to_false() {
        let json = serde_json::json!({
            "type": "sync",
            "replicaId": replica(2),
            "replicaType": "realtime",
            "schemaVersion": 1,
            "timestamp": stamp(5),
        });
        let msg: ClientMessage = serde_json::from_value(json).unwrap();
        let ClientMessage::Sync { resync_all, .. } = msg else {
            panic!("expected sync");
        };
        assert!(!resync_all);
    }

    #[test]
    fn forbidden_carries_reason() {
        let json = serde_json::to_value(ServerMessage::Forbidden {
            reason: ForbiddenReason::ReplicaOwnership,
        })
        .unwrap();
        assert_eq!(json["type"], "forbidden");
        assert_eq!(json["reason"], "replica-ownership");
    }
}
