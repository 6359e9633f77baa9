//! The client engine: a single-threaded, cooperative state machine.
//!
//! Local writes commit to the local store first and are optimistic;
//! the network is strictly behind. On (re)connect the engine runs the
//! two-step sync, then streams ops, acks what it has applied, folds its
//! log on global-ack hints, and relays presence. Connection loss moves
//! it to Offline with everything intact; reconnection backs off
//! exponentially with jitter.

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::authority::{ClientConn, TransportClosed};
use crate::config::Config;
use crate::core::{
    Baseline, HlcClock, MaterializeError, Oid, OidAllocator, OidError, OpKind, Operation,
    ReplicaId, ReplicaType, Stamp, Value, ensure_acyclic,
};
use crate::protocol::{ClientMessage, ForbiddenReason, PresenceState, ServerMessage};

use super::buffer::BatchBuffer;
use super::store::{LocalStore, SnapshotCache};

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Offline,
    Syncing,
    Active,
}

/// What the host application learns from a `pump`.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// These roots' materialised snapshots changed; re-run queries.
    DocumentsChanged { roots: Vec<Oid> },
    /// A write bounced off a read-only token and was rolled back.
    WriteRejected,
    /// Our replica id belonged to someone else; we rotated and must
    /// reconnect (with a full resync).
    ReplicaRotated { new_replica_id: ReplicaId },
    PresenceChanged { state: PresenceState },
    PresenceOffline { replica_id: ReplicaId, user_id: String },
    /// The connection died; the engine is Offline and buffering.
    WentOffline,
}

#[derive(Debug)]
pub struct ReplicaEngine {
    config: Config,
    replica_id: ReplicaId,
    replica_type: ReplicaType,
    schema_version: u32,
    clock: HlcClock,
    alloc: OidAllocator,
    store: LocalStore,
    cache: SnapshotCache,
    state: ConnState,
    conn: Option<ClientConn>,
    resync_requested: bool,
    /// Highest stamp applied from the authority; what acks report.
    highest_applied: Option<Stamp>,
    last_ack_sent: Option<Stamp>,
    last_ack_at: Option<Instant>,
    last_heartbeat_at: Option<Instant>,
    /// What we last transmitted, for forbidden-write rollback.
    last_sent_ops: Vec<Operation>,
    pending_presence: Option<serde_json::Value>,
    backoff_attempt: u32,
}

impl ReplicaEngine {
    /// Fresh replica with empty local storage.
    pub fn new(config: Config, replica_type: ReplicaType, schema_version: u32) -> Self {
        let replica_id = ReplicaId::generate();
        Self::with_store(
            config,
            replica_type,
            replica_id,
            LocalStore::new(schema_version),
            schema_version,
        )
        .expect("fresh store cannot mismatch")
    }

    /// Open over existing local storage. Refuses to start when the
    /// storage was written at a different schema version; a migration
    /// has to run first.
    pub fn open(
        config: Config,
        replica_type: ReplicaType,
        replica_id: ReplicaId,
        store: LocalStore,
        schema_version: u32,
    ) -> Result<Self, EngineError> {
        Self::with_store(config, replica_type, replica_id, store, schema_version)
    }

    fn with_store(
        config: Config,
        replica_type: ReplicaType,
        replica_id: ReplicaId,
        store: LocalStore,
        schema_version: u32,
    ) -> Result<Self, EngineError> {
        if store.schema_version() != schema_version {
            return Err(EngineError::SchemaMismatch {
                storage: store.schema_version(),
                engine: schema_version,
            });
        }
        Ok(Self {
            config,
            replica_id,
            replica_type,
            schema_version,
            clock: HlcClock::new(replica_id),
            alloc: OidAllocator::new(replica_id),
            store,
            cache: SnapshotCache::new(),
            state: ConnState::Offline,
            conn: None,
            resync_requested: false,
            highest_applied: None,
            last_ack_sent: None,
            last_ack_at: None,
            last_heartbeat_at: None,
            last_sent_ops: Vec::new(),
            pending_presence: None,
            backoff_attempt: 0,
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Ask for a full resync on the next connect: local canonical data
    /// is replaced by the authority's, the unsent buffer survives.
    pub fn request_resync_all(&mut self) {
        self.resync_requested = true;
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Start collecting a batch of writes.
    pub fn batch(&mut self) -> Batch<'_> {
        Batch {
            engine: self,
            buffer: BatchBuffer::new(),
        }
    }

    /// Materialised snapshot of a document.
    pub fn document(&mut self, root: &Oid) -> Result<Value, EngineError> {
        Ok(self.cache.get_or_materialize(root, &self.store)?)
    }

    pub fn subscribe(&mut self, root: Oid) {
        self.cache.subscribe(root);
    }

    pub fn unsubscribe(&mut self, root: &Oid) {
        self.cache.unsubscribe(root);
    }

    /// Offline housekeeping: fold the whole local log into baselines.
    pub fn compact_local(&mut self) {
        self.store.compact_all();
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Attach a fresh connection and start the sync handshake.
    pub fn connect(&mut self, conn: ClientConn) {
        self.conn = Some(conn);
        self.state = ConnState::Syncing;
        let message = ClientMessage::Sync {
            replica_id: self.replica_id,
            replica_type: self.replica_type,
            resync_all: self.resync_requested,
            schema_version: self.schema_version,
            timestamp: self.clock.tick(),
        };
        info!(replica = %self.replica_id, resync = self.resync_requested, "connecting");
        self.send(message);
    }

    pub fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.disconnect();
        }
        self.go_offline();
    }

    /// How long to wait before the next reconnect attempt.
    pub fn next_backoff(&mut self) -> Duration {
        let base = self.config.sync.backoff_base_ms;
        let cap = self.config.sync.backoff_cap_ms;
        let exp = base
            .saturating_mul(1u64 << self.backoff_attempt.min(16))
            .min(cap);
        self.backoff_attempt = self.backoff_attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        Duration::from_millis(exp + jitter)
    }

    // ------------------------------------------------------------------
    // The pump: drain inbound, do periodic duties
    // ------------------------------------------------------------------

    /// Drain and process everything the authority sent, then handle
    /// periodic duties (acks, heartbeats). Cooperative: call this from
    /// the host's event loop.
    pub fn pump(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        loop {
            let Some(conn) = &self.conn else { break };
            match conn.try_recv() {
                Ok(Some(message)) => self.handle_server_message(message, &mut events),
                Ok(None) => break,
                Err(TransportClosed) => {
                    self.go_offline();
                    events.push(EngineEvent::WentOffline);
                    break;
                }
            }
        }

        if self.state == ConnState::Active {
            let now = Instant::now();
            self.maybe_ack(now);
            self.maybe_heartbeat(now);
        }
        events
    }

    /// Force out a pending ack regardless of the interval (tests and
    /// graceful shutdown).
    pub fn flush_ack(&mut self) {
        if self.state != ConnState::Active {
            return;
        }
        if let Some(applied) = self.highest_applied.clone()
            && self.last_ack_sent.as_ref() != Some(&applied)
        {
            let message = ClientMessage::Ack {
                replica_id: self.replica_id,
                timestamp: applied.clone(),
            };
            self.last_ack_sent = Some(applied);
            self.last_ack_at = Some(Instant::now());
            self.send(message);
        }
    }

    /// Publish ephemeral presence (cursor position, selection, ...).
    pub fn update_presence(&mut self, presence: serde_json::Value) {
        if self.state == ConnState::Active {
            let message = ClientMessage::PresenceUpdate {
                replica_id: self.replica_id,
                presence,
                timestamp: self.clock.tick(),
            };
            self.send(message);
        } else {
            self.pending_presence = Some(presence);
        }
    }

    // ------------------------------------------------------------------
    // Inbound handling
    // ------------------------------------------------------------------

    fn handle_server_message(&mut self, message: ServerMessage, events: &mut Vec<EngineEvent>) {
        match message {
            ServerMessage::SyncResp {
                operations,
                baselines,
                provide_changes_since,
                global_ack_timestamp,
                peer_presence,
                overwrite_local_data,
            } => {
                self.handle_sync_resp(
                    operations,
                    baselines,
                    provide_changes_since,
                    global_ack_timestamp,
                    overwrite_local_data,
                    events,
                );
                for state in peer_presence {
                    events.push(EngineEvent::PresenceChanged { state });
                }
            }
            ServerMessage::OpRe {
                operations,
                baselines,
                global_ack_timestamp,
                ..
            } => {
                let roots = self.ingest_remote(baselines, operations);
                if let Some(ack) = global_ack_timestamp {
                    self.store.compact_below(&ack);
                }
                if !roots.is_empty() {
                    self.cache.invalidate(&roots);
                    events.push(EngineEvent::DocumentsChanged { roots });
                }
            }
            ServerMessage::GlobalAck { timestamp } => {
                self.store.compact_below(&timestamp);
            }
            ServerMessage::PresenceChanged { user_info, .. } => {
                events.push(EngineEvent::PresenceChanged { state: user_info });
            }
            ServerMessage::PresenceOffline {
                replica_id,
                user_id,
            } => {
                events.push(EngineEvent::PresenceOffline {
                    replica_id,
                    user_id: user_id.as_str().to_string(),
                });
            }
            ServerMessage::HeartbeatResponse => {}
            ServerMessage::Forbidden { reason } => self.handle_forbidden(reason, events),
        }
    }

    fn handle_sync_resp(
        &mut self,
        operations: Vec<Operation>,
        baselines: Vec<Baseline>,
        provide_changes_since: Option<Stamp>,
        global_ack_timestamp: Option<Stamp>,
        overwrite_local_data: bool,
        events: &mut Vec<EngineEvent>,
    ) {
        debug!(
            replica = %self.replica_id,
            ops = operations.len(),
            baselines = baselines.len(),
            overwrite = overwrite_local_data,
            "sync-resp"
        );
        for op in &operations {
            self.clock.observe(&op.stamp);
            self.note_applied(&op.stamp);
        }
        for baseline in &baselines {
            self.clock.observe(&baseline.stamp);
            self.note_applied(&baseline.stamp);
        }

        let roots = if overwrite_local_data {
            self.store.overwrite_with(baselines, operations);
            // Everything may have changed; subscribers recompute.
            let mut roots = Vec::new();
            let (all_baselines, all_ops) = self.store.changes_after(None);
            roots.extend(all_baselines.iter().map(|b| b.oid.root_oid()));
            roots.extend(all_ops.iter().map(|op| op.oid.root_oid()));
            roots.sort();
            roots.dedup();
            roots
        } else {
            self.ingest_remote(baselines, operations)
        };

        // Step two: upload everything newer than what the authority has.
        // A read-only replica has nothing it may contribute (the
        // authority refuses its uploads), so it skips straight to active.
        if !self.replica_type.is_read_only() {
            let (up_baselines, up_ops) = self.store.changes_after(provide_changes_since.as_ref());
            let _ = self.store.take_pending();
            self.last_sent_ops = up_ops.clone();
            let step2 = ClientMessage::SyncStep2 {
                replica_id: self.replica_id,
                operations: up_ops.clone(),
                baselines: up_baselines.clone(),
                timestamp: self.clock.tick(),
            };
            self.send(step2);
            if self.conn.is_none() {
                // send failed; we are offline again
                events.push(EngineEvent::WentOffline);
                return;
            }
            // Transmitted state counts as applied: acks cover our own
            // sent ops so the global floor can advance past them.
            for op in &up_ops {
                self.note_applied(&op.stamp);
            }
            for baseline in &up_baselines {
                self.note_applied(&baseline.stamp);
            }
        }

        self.state = ConnState::Active;
        self.resync_requested = false;
        self.backoff_attempt = 0;

        if let Some(ack) = global_ack_timestamp {
            self.store.compact_below(&ack);
        }
        if let Some(presence) = self.pending_presence.take() {
            self.update_presence(presence);
        }
        self.flush_ack();

        if !roots.is_empty() {
            self.cache.invalidate(&roots);
            events.push(EngineEvent::DocumentsChanged { roots });
        }
    }

    /// Baselines first, then ops, then invalidation - the order the
    /// protocol requires.
    fn ingest_remote(&mut self, baselines: Vec<Baseline>, operations: Vec<Operation>) -> Vec<Oid> {
        let mut roots = Vec::new();
        for baseline in baselines {
            self.clock.observe(&baseline.stamp);
            self.note_applied(&baseline.stamp);
            if let Some(root) = self.store.upsert_baseline(baseline) {
                roots.push(root);
            }
        }
        for op in &operations {
            self.clock.observe(&op.stamp);
            self.note_applied(&op.stamp);
        }
        roots.extend(self.store.apply_remote(&operations));
        roots.sort();
        roots.dedup();
        roots
    }

    fn handle_forbidden(&mut self, reason: ForbiddenReason, events: &mut Vec<EngineEvent>) {
        match reason {
            ForbiddenReason::ReadOnly => {
                warn!(replica = %self.replica_id, "write rejected: read-only token");
                let rejected = std::mem::take(&mut self.last_sent_ops);
                self.store.purge(&rejected);
                let roots: Vec<Oid> = rejected.iter().map(|op| op.oid.root_oid()).collect();
                self.cache.invalidate(&roots);
                events.push(EngineEvent::WriteRejected);
            }
            ForbiddenReason::ReplicaOwnership => {
                let fresh = ReplicaId::generate();
                warn!(
                    old = %self.replica_id,
                    new = %fresh,
                    "replica id owned by another user; rotating"
                );
                self.replica_id = fresh;
                self.clock = HlcClock::new(fresh);
                self.alloc = OidAllocator::new(fresh);
                self.resync_requested = true;
                self.disconnect();
                events.push(EngineEvent::ReplicaRotated {
                    new_replica_id: fresh,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn note_applied(&mut self, stamp: &Stamp) {
        if self
            .highest_applied
            .as_ref()
            .is_none_or(|applied| stamp > applied)
        {
            self.highest_applied = Some(stamp.clone());
        }
    }

    fn maybe_ack(&mut self, now: Instant) {
        let interval = Duration::from_millis(self.config.sync.ack_interval_ms);
        let due = self
            .last_ack_at
            .is_none_or(|last| now.duration_since(last) >= interval);
        if due {
            self.flush_ack();
        }
    }

    fn maybe_heartbeat(&mut self, now: Instant) {
        let interval = Duration::from_millis(self.config.sync.heartbeat_interval_ms);
        let due = self
            .last_heartbeat_at
            .is_none_or(|last| now.duration_since(last) >= interval);
        if due {
            self.last_heartbeat_at = Some(now);
            let message = ClientMessage::Heartbeat {
                replica_id: self.replica_id,
                timestamp: self.clock.tick(),
            };
            self.send(message);
        }
    }

    fn commit_ops(&mut self, ops: Vec<Operation>) -> Vec<Oid> {
        let roots: Vec<Oid> = ops.iter().map(|op| op.oid.root_oid()).collect();
        self.store.commit_batch(ops);
        self.cache.invalidate(&roots);

        if self.state == ConnState::Active {
            let pending = self.store.take_pending();
            if !pending.is_empty() {
                self.last_sent_ops = pending.clone();
                let message = ClientMessage::Op {
                    replica_id: self.replica_id,
                    operations: pending.clone(),
                    timestamp: self.clock.tick(),
                };
                self.send(message);
                if self.conn.is_some() {
                    for op in &pending {
                        self.note_applied(&op.stamp);
                    }
                }
            }
        }
        roots
    }

    fn send(&mut self, message: ClientMessage) {
        let Some(conn) = &self.conn else { return };
        if conn.send(message).is_err() {
            self.go_offline();
        }
    }

    fn go_offline(&mut self) {
        if self.state != ConnState::Offline {
            info!(replica = %self.replica_id, "offline");
        }
        self.conn = None;
        self.state = ConnState::Offline;
        self.store.requeue_sent();
        self.last_sent_ops.clear();
    }
}

/// A batch of writes. Ops supersede inside the batch as they are added
/// and the whole batch commits atomically against local storage.
pub struct Batch<'a> {
    engine: &'a mut ReplicaEngine,
    buffer: BatchBuffer,
}

impl Batch<'_> {
    /// Create a document with an initial snapshot; returns its OID.
    pub fn create(&mut self, collection: &str, snapshot: Value) -> Result<Oid, EngineError> {
        let oid = self.engine.alloc.allocate_root(collection)?;
        ensure_acyclic(&self.engine.store.view(), &oid, &snapshot)?;
        let stamp = self.engine.clock.tick();
        self.buffer
            .push(Operation::new(oid.clone(), stamp, OpKind::Initialize { snapshot }));
        Ok(oid)
    }

    /// Create a nested sub-object under a root.
    pub fn create_child(
        &mut self,
        root: &Oid,
        field_path: &str,
        snapshot: Value,
    ) -> Result<Oid, EngineError> {
        let oid = self.engine.alloc.allocate_child(root, field_path)?;
        ensure_acyclic(&self.engine.store.view(), &oid, &snapshot)?;
        let stamp = self.engine.clock.tick();
        self.buffer
            .push(Operation::new(oid.clone(), stamp, OpKind::Initialize { snapshot }));
        Ok(oid)
    }

    pub fn set(&mut self, oid: &Oid, field: &str, value: Value) -> Result<(), EngineError> {
        ensure_acyclic(&self.engine.store.view(), oid, &value)?;
        let stamp = self.engine.clock.tick();
        self.buffer.push(Operation::new(
            oid.clone(),
            stamp,
            OpKind::Set {
                field: field.to_string(),
                value,
            },
        ));
        Ok(())
    }

    pub fn delete(&mut self, oid: &Oid, field: &str) {
        let stamp = self.engine.clock.tick();
        self.buffer.push(Operation::new(
            oid.clone(),
            stamp,
            OpKind::Delete {
                field: field.to_string(),
            },
        ));
    }

    pub fn list_insert(&mut self, oid: &Oid, index: usize, value: Value) -> Result<(), EngineError> {
        ensure_acyclic(&self.engine.store.view(), oid, &value)?;
        let stamp = self.engine.clock.tick();
        self.buffer.push(Operation::new(
            oid.clone(),
            stamp,
            OpKind::ListInsert { index, value },
        ));
        Ok(())
    }

    pub fn list_move(&mut self, oid: &Oid, from: usize, to: usize) {
        let stamp = self.engine.clock.tick();
        self.buffer
            .push(Operation::new(oid.clone(), stamp, OpKind::ListMove { from, to }));
    }

    pub fn list_delete(&mut self, oid: &Oid, index: usize) {
        let stamp = self.engine.clock.tick();
        self.buffer
            .push(Operation::new(oid.clone(), stamp, OpKind::ListDelete { index }));
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Commit to local storage (and the wire, when online). Returns the
    /// affected root OIDs.
    pub fn commit(self) -> Vec<Oid> {
        let ops = self.buffer.into_ops();
        if ops.is_empty() {
            return Vec::new();
        }
        self.engine.commit_ops(ops)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("local storage is at schema version {storage}, engine expects {engine}")]
    SchemaMismatch { storage: u32, engine: u32 },
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    Oid(#[from] OidError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn engine() -> ReplicaEngine {
        ReplicaEngine::new(Config::default(), ReplicaType::Realtime, 1)
    }

    #[test]
    fn schema_mismatch_refuses_to_open() {
        let store = LocalStore::new(1);
        let err = ReplicaEngine::open(
            Config::default(),
            ReplicaType::Realtime,
            ReplicaId::generate(),
            store,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { storage: 1, engine: 2 }));
    }

    #[test]
    fn offline_writes_commit_locally() {
        let mut engine = engine();
        let mut batch = engine.batch();
        let oid = batch.create("items", Value::object()).unwrap();
        batch.set(&oid, "content", Value::from("milk")).unwrap();
        let roots = batch.commit();
        assert_eq!(roots, vec![oid.clone()]);

        let doc = engine.document(&oid).unwrap();
        assert_eq!(doc.get("content"), Some(&Value::from("milk")));
        assert_eq!(engine.state(), ConnState::Offline);
        assert_eq!(engine.store().pending_count(), 2);
    }

    #[test]
    fn rapid_sets_in_a_batch_collapse() {
        let mut engine = engine();
        let mut batch = engine.batch();
        let oid = batch.create("items", Value::object()).unwrap();
        for i in 0..10 {
            batch
                .set(&oid, "content", Value::from(format!("{i} apples")))
                .unwrap();
        }
        batch.commit();
        // initialize + one surviving set
        assert_eq!(engine.store().pending_count(), 2);
    }

    #[test]
    fn cycle_is_rejected_at_write_time() {
        let mut engine = engine();
        let mut batch = engine.batch();
        let a = batch.create("docs", Value::object()).unwrap();
        let b = batch.create("docs", Value::object()).unwrap();
        batch.commit();

        let mut batch = engine.batch();
        batch.set(&a, "next", Value::Ref(b.clone())).unwrap();
        batch.commit();

        let mut batch = engine.batch();
        let err = batch.set(&b, "back", Value::Ref(a.clone())).unwrap_err();
        assert!(matches!(err, EngineError::Materialize(_)));
    }

    #[test]
    fn local_compaction_empties_the_log() {
        let mut engine = engine();
        let mut batch = engine.batch();
        let oid = batch.create("items", Value::object()).unwrap();
        batch.set(&oid, "content", Value::from("x")).unwrap();
        batch.commit();

        engine.compact_local();
        assert_eq!(engine.store().log_len(), 0);
        let doc = engine.document(&oid).unwrap();
        assert_eq!(doc.get("content"), Some(&Value::from("x")));
    }

    #[test]
    fn backoff_grows_and_resets() {
        let mut engine = engine();
        let first = engine.next_backoff();
        let second = engine.next_backoff();
        assert!(second >= first);
    }
}
