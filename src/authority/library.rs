//! Per-library coordinator.
//!
//! Owns one library's log, baselines, registry, presence, and
//! connections. Every handler runs on the library's task thread, which
//! is the serialization point: exclusive access here is what makes
//! ingest, step2 persistence, and rebase atomic.

use std::time::Instant;

use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{
    Baseline, ClientKey, LibraryId, Operation, ReplicaId, ReplicaType, Stamp, TokenInfo, WallClock,
};
use crate::protocol::{ClientMessage, ForbiddenReason, PresenceState, ServerMessage};
use crate::store::{BaselineStore, OperationLog};

use super::broadcast::{Broadcaster, Connection};
use super::presence::PresenceMap;
use super::rebase::{RebaseScheduler, run_rebase};
use super::registry::{ReplicaRegistry, RosterStatus};

/// Everything a library task can be told.
pub enum LibraryEvent {
    Connect {
        key: ClientKey,
        token: TokenInfo,
        sender: Sender<ServerMessage>,
    },
    Message {
        key: ClientKey,
        message: ClientMessage,
    },
    Disconnect {
        key: ClientKey,
    },
    /// Admin/status introspection: reply with a copy of current state.
    Inspect {
        respond: Sender<LibrarySnapshot>,
    },
    Shutdown,
}

/// Point-in-time copy of a library's state, for admin/status surfaces.
#[derive(Clone, Debug)]
pub struct LibrarySnapshot {
    pub operations: Vec<Operation>,
    pub baselines: Vec<Baseline>,
    pub replicas: Vec<crate::core::ReplicaInfo>,
    pub presence: Vec<PresenceState>,
    pub connections: usize,
}

pub struct Library {
    id: LibraryId,
    config: Config,
    log: OperationLog,
    baselines: BaselineStore,
    registry: ReplicaRegistry,
    presence: PresenceMap,
    broadcaster: Broadcaster,
    scheduler: RebaseScheduler,
    last_announced_ack: Option<Stamp>,
}

impl Library {
    pub fn new(id: LibraryId, config: Config) -> Self {
        let registry = ReplicaRegistry::new(config.sync.truancy_ms);
        let broadcaster = Broadcaster::new(config.limits.max_connections);
        let scheduler = RebaseScheduler::new(
            config.rebase.debounce(),
            config.rebase.max_interval(),
            config.rebase.max_ops,
        );
        info!(library = %id, "library task starting");
        Self {
            id,
            config,
            log: OperationLog::new(),
            baselines: BaselineStore::new(),
            registry,
            presence: PresenceMap::new(),
            broadcaster,
            scheduler,
            last_announced_ack: None,
        }
    }

    pub fn id(&self) -> &LibraryId {
        &self.id
    }

    /// Next moment the task should wake even without traffic.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.scheduler.deadline(now)
    }

    /// Returns false when the task should stop.
    pub fn handle(&mut self, event: LibraryEvent) -> bool {
        match event {
            LibraryEvent::Connect { key, token, sender } => self.handle_connect(key, token, sender),
            LibraryEvent::Message { key, message } => self.handle_message(key, message),
            LibraryEvent::Disconnect { key } => self.handle_disconnect(key),
            LibraryEvent::Inspect { respond } => {
                let _ = respond.send(self.snapshot());
            }
            LibraryEvent::Shutdown => return false,
        }
        true
    }

    fn handle_connect(&mut self, key: ClientKey, token: TokenInfo, sender: Sender<ServerMessage>) {
        let conn = Connection {
            sender,
            token,
            replica_id: None,
        };
        if let Err(err) = self.broadcaster.register(key, conn) {
            warn!(library = %self.id, client = %key, %err, "rejecting connection");
        }
    }

    fn handle_message(&mut self, key: ClientKey, message: ClientMessage) {
        let Some(conn) = self.broadcaster.get(&key) else {
            warn!(library = %self.id, client = %key, "message from unknown connection");
            return;
        };
        let token = conn.token.clone();

        let replica_id = message.replica_id();
        let now = WallClock::now();
        let _ = self.registry.update_last_seen(&replica_id, now);

        match message {
            ClientMessage::Sync {
                replica_id,
                replica_type,
                resync_all,
                schema_version,
                ..
            } => self.handle_sync(key, token, replica_id, replica_type, resync_all, schema_version),
            ClientMessage::SyncStep2 {
                replica_id,
                operations,
                baselines,
                timestamp,
            } => self.handle_sync_step2(key, token, replica_id, operations, baselines, timestamp),
            ClientMessage::Op {
                replica_id,
                operations,
                ..
            } => self.handle_op(key, token, replica_id, operations),
            ClientMessage::Ack { timestamp, .. } => self.handle_ack(replica_id, timestamp),
            ClientMessage::Heartbeat { .. } => {
                self.broadcaster.send_to(&key, ServerMessage::HeartbeatResponse);
            }
            ClientMessage::PresenceUpdate { presence, .. } => {
                self.handle_presence_update(key, token, replica_id, presence)
            }
        }
    }

    /// Handshake: decide what the joining replica must download, what it
    /// should upload, and whether its local data survives.
    fn handle_sync(
        &mut self,
        key: ClientKey,
        token: TokenInfo,
        replica_id: ReplicaId,
        replica_type: ReplicaType,
        resync_all: bool,
        schema_version: u32,
    ) {
        if self.registry.owner_conflict(&replica_id, &token.user_id) {
            warn!(library = %self.id, %replica_id, "replica id owned by another user");
            self.broadcaster.send_to(
                &key,
                ServerMessage::Forbidden {
                    reason: ForbiddenReason::ReplicaOwnership,
                },
            );
            return;
        }

        if resync_all {
            self.registry.forget(&replica_id);
        }

        let now = WallClock::now();
        let (status, info) =
            self.registry
                .get_or_create(replica_id, token.user_id.clone(), replica_type, now);
        debug!(library = %self.id, %replica_id, ?status, schema_version, "sync");

        let changes_since = match status {
            RosterStatus::Existing => info.acked.clone(),
            RosterStatus::New | RosterStatus::Truant => None,
        };

        let operations = self.log.get_after(changes_since.as_ref());
        let baselines = self.baselines.get_all_after(changes_since.as_ref());

        // An empty library adopts the first joining replica's history.
        let library_empty =
            changes_since.is_none() && operations.is_empty() && baselines.is_empty();
        let overwrite_local_data =
            (resync_all || status != RosterStatus::Existing) && !library_empty;

        if let Some(conn) = self.broadcaster.get_mut(&key) {
            conn.replica_id = Some(replica_id);
        }

        let global_ack_timestamp = self
            .registry
            .global_ack(now, &self.broadcaster.active_replicas());
        let reply = ServerMessage::SyncResp {
            operations,
            baselines,
            provide_changes_since: changes_since,
            global_ack_timestamp,
            peer_presence: self.presence.snapshot(),
            overwrite_local_data,
        };
        self.broadcaster.send_to(&key, reply);
    }

    /// Step two: the client uploads everything newer than what we told
    /// it we already have. Baselines land before ops.
    fn handle_sync_step2(
        &mut self,
        key: ClientKey,
        token: TokenInfo,
        replica_id: ReplicaId,
        operations: Vec<Operation>,
        baselines: Vec<Baseline>,
        timestamp: Stamp,
    ) {
        if !token.access.can_write() {
            self.broadcaster.send_to(
                &key,
                ServerMessage::Forbidden {
                    reason: ForbiddenReason::ReadOnly,
                },
            );
            return;
        }
        if operations.len() > self.config.limits.max_ops_per_message {
            warn!(
                library = %self.id,
                %replica_id,
                count = operations.len(),
                "oversized step2 upload dropped"
            );
            return;
        }

        let accepted_baselines = self.persist_baselines(baselines);
        let accepted_ops = self.persist_operations(&operations);

        // Ack to the last uploaded op; an op-less upload falls back to
        // the message stamp (see DESIGN.md on why this is accepted).
        let acked = operations
            .iter()
            .map(|op| op.stamp.clone())
            .max()
            .unwrap_or(timestamp);
        let _ = self.registry.update_acknowledged(&replica_id, acked);

        if !accepted_ops.is_empty() || !accepted_baselines.is_empty() {
            let now = WallClock::now();
            let global_ack_timestamp = self
                .registry
                .global_ack(now, &self.broadcaster.active_replicas());
            let rebroadcast = ServerMessage::OpRe {
                operations: accepted_ops,
                baselines: accepted_baselines,
                replica_id,
                global_ack_timestamp,
            };
            self.broadcaster.broadcast(&rebroadcast, Some(&key));
            self.scheduler.record_write(Instant::now(), 1);
        }
        self.maybe_announce_global_ack();
    }

    /// Regular operation delivery from an active replica.
    fn handle_op(
        &mut self,
        key: ClientKey,
        token: TokenInfo,
        replica_id: ReplicaId,
        operations: Vec<Operation>,
    ) {
        if !token.access.can_write() {
            self.broadcaster.send_to(
                &key,
                ServerMessage::Forbidden {
                    reason: ForbiddenReason::ReadOnly,
                },
            );
            return;
        }
        if operations.len() > self.config.limits.max_ops_per_message {
            warn!(
                library = %self.id,
                %replica_id,
                count = operations.len(),
                "oversized op message dropped"
            );
            return;
        }

        let accepted = self.persist_operations(&operations);
        if accepted.is_empty() {
            return;
        }
        self.scheduler
            .record_write(Instant::now(), accepted.len() as u64);

        let now = WallClock::now();
        let global_ack_timestamp = self
            .registry
            .global_ack(now, &self.broadcaster.active_replicas());
        let rebroadcast = ServerMessage::OpRe {
            operations: accepted,
            baselines: Vec::new(),
            replica_id,
            global_ack_timestamp,
        };
        self.broadcaster.broadcast(&rebroadcast, Some(&key));
    }

    fn handle_ack(&mut self, replica_id: ReplicaId, timestamp: Stamp) {
        if let Err(err) = self.registry.update_acknowledged(&replica_id, timestamp) {
            warn!(library = %self.id, %err, "ack from unregistered replica");
            return;
        }
        self.maybe_announce_global_ack();
    }

    fn handle_presence_update(
        &mut self,
        key: ClientKey,
        token: TokenInfo,
        replica_id: ReplicaId,
        presence: serde_json::Value,
    ) {
        let state = PresenceState {
            id: token.user_id,
            replica_id,
            presence,
            profile: token.profile,
        };
        self.presence.update(state.clone());
        // Including the sender: clients want their own loaded profile back.
        let message = ServerMessage::PresenceChanged {
            replica_id,
            user_info: state,
        };
        self.broadcaster.broadcast(&message, None);
    }

    fn handle_disconnect(&mut self, key: ClientKey) {
        let Some(conn) = self.broadcaster.remove(&key) else {
            return;
        };
        let user_id = conn.token.user_id;
        let Some(replica_id) = conn.replica_id else {
            return;
        };
        if self.broadcaster.connections_for_user(&user_id) == 0
            && self.presence.remove_user(&user_id).is_some()
        {
            let message = ServerMessage::PresenceOffline {
                replica_id,
                user_id,
            };
            self.broadcaster.broadcast(&message, None);
        }
    }

    /// Upsert uploaded baselines that advance what we have. Returns the
    /// accepted ones for rebroadcast.
    fn persist_baselines(&mut self, baselines: Vec<Baseline>) -> Vec<Baseline> {
        let mut accepted = Vec::new();
        for baseline in baselines {
            match self.baselines.get(&baseline.oid) {
                Some(existing) if existing.stamp >= baseline.stamp => {
                    debug!(oid = %baseline.oid, "ignoring baseline at or behind ours");
                }
                _ => {
                    self.baselines.upsert(baseline.clone());
                    accepted.push(baseline);
                }
            }
        }
        accepted
    }

    /// Insert ops, dropping anything already compacted past. Returns the
    /// newly inserted ops (duplicates were rebroadcast on first arrival).
    fn persist_operations(&mut self, operations: &[Operation]) -> Vec<Operation> {
        let mut fresh = Vec::with_capacity(operations.len());
        for op in operations {
            if let Some(baseline) = self.baselines.get(&op.oid)
                && op.stamp <= baseline.stamp
            {
                warn!(oid = %op.oid, stamp = %op.stamp, "dropping op at or below baseline");
                continue;
            }
            if self.log.insert_all(std::slice::from_ref(op)) == 1 {
                fresh.push(op.clone());
            }
        }
        fresh
    }

    /// If the ack floor moved, tell everyone and schedule a fold.
    fn maybe_announce_global_ack(&mut self) {
        let now = WallClock::now();
        let ack = self
            .registry
            .global_ack(now, &self.broadcaster.active_replicas());
        let Some(ack) = ack else { return };
        if self.last_announced_ack.as_ref() == Some(&ack) {
            return;
        }
        self.last_announced_ack = Some(ack.clone());
        self.broadcaster
            .broadcast(&ServerMessage::GlobalAck { timestamp: ack }, None);
        self.scheduler.record_write(Instant::now(), 0);
    }

    fn snapshot(&self) -> LibrarySnapshot {
        LibrarySnapshot {
            operations: self.log.get_after(None),
            baselines: self.baselines.get_all_after(None),
            replicas: self.registry.rows().to_vec(),
            presence: self.presence.snapshot(),
            connections: self.broadcaster.len(),
        }
    }

    /// Run one coalesced rebase pass if the scheduler says it is due.
    pub fn maybe_rebase(&mut self, now: Instant) {
        if !self.scheduler.due(now) {
            return;
        }
        self.scheduler.complete();

        let wall = WallClock::now();
        let active = self.broadcaster.active_replicas();
        let Some(ack) = self.registry.global_ack(wall, &active) else {
            return;
        };

        match run_rebase(&mut self.log, &mut self.baselines, &ack) {
            Ok(stats) if stats.folded > 0 => {
                debug!(library = %self.id, folded = stats.folded, "rebased");
                // Compaction hint so peers fold their local logs too.
                self.broadcaster
                    .broadcast(&ServerMessage::GlobalAck { timestamp: ack }, None);
            }
            Ok(_) => {}
            Err(err) => warn!(library = %self.id, %err, "rebase pass failed"),
        }

        // Presence entries owned by truant replicas go away with the pass.
        let registry = &self.registry;
        let swept = self.presence.sweep(|replica| {
            registry
                .get(replica)
                .is_some_and(|row| !row.is_truant_at(wall, registry.truancy_ms()))
        });
        for state in swept {
            let message = ServerMessage::PresenceOffline {
                replica_id: state.replica_id,
                user_id: state.id,
            };
            self.broadcaster.broadcast(&message, None);
        }
    }
}
