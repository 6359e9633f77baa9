//! Client-side storage: the local log and baselines, the unsent
//! outbound queue, and the subscriber-counted snapshot cache.
//!
//! Every local write lands here before anything touches the network,
//! which is why connection loss never loses data.

use std::collections::HashMap;

use tracing::debug;

use crate::authority::rebase::run_rebase;
use crate::core::{Baseline, MaterializeError, Oid, Operation, Stamp, Value, materialize};
use crate::store::{BaselineStore, OperationLog, StoreView};

use super::buffer::supersede;

/// Send-state of a queued outbound operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Sent,
}

#[derive(Debug)]
struct OutboundOp {
    op: Operation,
    state: SendState,
}

#[derive(Debug)]
pub struct LocalStore {
    schema_version: u32,
    log: OperationLog,
    baselines: BaselineStore,
    outbound: Vec<OutboundOp>,
}

impl LocalStore {
    pub fn new(schema_version: u32) -> Self {
        Self {
            schema_version,
            log: OperationLog::new(),
            baselines: BaselineStore::new(),
            outbound: Vec::new(),
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn view(&self) -> StoreView<'_> {
        StoreView {
            log: &self.log,
            baselines: &self.baselines,
        }
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn baseline(&self, oid: &Oid) -> Option<Baseline> {
        self.baselines.get(oid)
    }

    /// Commit a batch: supersede still-unsent queue entries, append to
    /// the local log, and queue for transmission. Atomic from the
    /// engine's point of view (single-threaded ownership).
    pub fn commit_batch(&mut self, ops: Vec<Operation>) {
        for op in &ops {
            // Superseding reaches into the queue, but only entries that
            // have not left the device.
            let mut pending: Vec<Operation> = self
                .outbound
                .iter()
                .filter(|entry| entry.state == SendState::Pending)
                .map(|entry| entry.op.clone())
                .collect();
            let before = pending.len();
            supersede(&mut pending, op);
            if pending.len() != before {
                let keep: Vec<(Oid, Stamp)> = pending.iter().map(Operation::key).collect();
                let dropped: Vec<Operation> = self
                    .outbound
                    .iter()
                    .filter(|entry| {
                        entry.state == SendState::Pending && !keep.contains(&entry.op.key())
                    })
                    .map(|entry| entry.op.clone())
                    .collect();
                self.log.drop_ops(&dropped);
                self.outbound.retain(|entry| {
                    entry.state != SendState::Pending || keep.contains(&entry.op.key())
                });
            }
        }

        self.log.insert_all(&ops);
        for op in ops {
            self.outbound.push(OutboundOp {
                op,
                state: SendState::Pending,
            });
        }
    }

    /// Drain the queue for transmission, marking entries sent.
    pub fn take_pending(&mut self) -> Vec<Operation> {
        let mut out = Vec::new();
        for entry in &mut self.outbound {
            if entry.state == SendState::Pending {
                entry.state = SendState::Sent;
                out.push(entry.op.clone());
            }
        }
        out
    }

    /// Put transmitted-but-unacknowledged ops back to pending (the
    /// connection died before the authority confirmed anything).
    pub fn requeue_sent(&mut self) {
        for entry in &mut self.outbound {
            entry.state = SendState::Pending;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.outbound
            .iter()
            .filter(|entry| entry.state == SendState::Pending)
            .count()
    }

    /// Remove rejected ops entirely (a forbidden write rolls back).
    pub fn purge(&mut self, ops: &[Operation]) {
        let keys: Vec<(Oid, Stamp)> = ops.iter().map(Operation::key).collect();
        self.log.drop_ops(ops);
        self.outbound.retain(|entry| !keys.contains(&entry.op.key()));
    }

    /// Insert remote ops; returns the root OIDs whose snapshots changed.
    pub fn apply_remote(&mut self, ops: &[Operation]) -> Vec<Oid> {
        let mut fresh = Vec::new();
        for op in ops {
            if let Some(baseline) = self.baselines.get(&op.oid)
                && op.stamp <= baseline.stamp
            {
                continue;
            }
            if self.log.insert_all(std::slice::from_ref(op)) == 1 {
                fresh.push(op.oid.root_oid());
            }
        }
        fresh.sort();
        fresh.dedup();
        fresh
    }

    /// Adopt a remote baseline unless ours is already as new.
    pub fn upsert_baseline(&mut self, baseline: Baseline) -> Option<Oid> {
        match self.baselines.get(&baseline.oid) {
            Some(existing) if existing.stamp >= baseline.stamp => None,
            _ => {
                let root = baseline.oid.root_oid();
                // Ops the new baseline already covers are redundant now.
                let covered: Vec<Operation> = self
                    .log
                    .get_for_oid(&baseline.oid, None)
                    .into_iter()
                    .filter(|op| op.stamp <= baseline.stamp)
                    .collect();
                self.log.drop_ops(&covered);
                self.baselines.upsert(baseline);
                Some(root)
            }
        }
    }

    /// Replace local canonical state with the server's, keeping only the
    /// unsent outbound buffer (which re-lands in the fresh log).
    pub fn overwrite_with(&mut self, baselines: Vec<Baseline>, ops: Vec<Operation>) {
        let retained: Vec<Operation> = self
            .outbound
            .iter()
            .filter(|entry| entry.state == SendState::Pending)
            .map(|entry| entry.op.clone())
            .collect();
        debug!(
            retained = retained.len(),
            "overwriting local data from authority"
        );

        self.log = OperationLog::new();
        self.baselines = BaselineStore::new();
        self.outbound
            .retain(|entry| entry.state == SendState::Pending);

        for baseline in baselines {
            self.baselines.upsert(baseline);
        }
        self.log.insert_all(&ops);
        self.log.insert_all(&retained);
    }

    /// Everything we hold that is newer than `since`, for step two.
    pub fn changes_after(&self, since: Option<&Stamp>) -> (Vec<Baseline>, Vec<Operation>) {
        (
            self.baselines.get_all_after(since),
            self.log.get_after(since),
        )
    }

    /// Fold the local log below `horizon` into local baselines, then
    /// prune queue entries whose ops no longer exist.
    pub fn compact_below(&mut self, horizon: &Stamp) {
        if let Err(err) = run_rebase(&mut self.log, &mut self.baselines, horizon) {
            debug!(%err, "local compaction skipped");
            return;
        }
        let log = &self.log;
        self.outbound.retain(|entry| log.contains(&entry.op.key()));
    }

    /// Fold the entire local log (offline housekeeping: a lone replica
    /// is its own consensus).
    pub fn compact_all(&mut self) {
        let Some(max) = self.log.max_stamp() else {
            return;
        };
        let horizon = Stamp::new(max.wall_ms, max.counter + 1, max.replica);
        self.compact_below(&horizon);
    }

    /// Highest stamp present anywhere in canonical storage.
    pub fn max_stamp(&self) -> Option<Stamp> {
        let from_log = self.log.max_stamp();
        let from_baselines = self
            .baselines
            .get_all_after(None)
            .into_iter()
            .map(|b| b.stamp)
            .max();
        match (from_log, from_baselines) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Materialised documents, reference-counted by subscribers.
///
/// Entities are canonical per OID: every subscriber to the same root
/// observes the same materialised value, and the last unsubscribe
/// evicts the entry.
#[derive(Default, Debug)]
pub struct SnapshotCache {
    entries: HashMap<Oid, CacheEntry>,
}

#[derive(Debug)]
struct CacheEntry {
    subscribers: usize,
    value: Option<Value>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, root: Oid) {
        self.entries
            .entry(root)
            .or_insert(CacheEntry {
                subscribers: 0,
                value: None,
            })
            .subscribers += 1;
    }

    pub fn unsubscribe(&mut self, root: &Oid) {
        if let Some(entry) = self.entries.get_mut(root) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                self.entries.remove(root);
            }
        }
    }

    pub fn subscribed(&self, root: &Oid) -> bool {
        self.entries.contains_key(root)
    }

    /// Drop cached values for the given roots; they recompute on next read.
    pub fn invalidate(&mut self, roots: &[Oid]) {
        for root in roots {
            if let Some(entry) = self.entries.get_mut(root) {
                entry.value = None;
            }
        }
    }

    pub fn get_or_materialize(
        &mut self,
        root: &Oid,
        store: &LocalStore,
    ) -> Result<Value, MaterializeError> {
        if let Some(entry) = self.entries.get(root)
            && let Some(value) = &entry.value
        {
            return Ok(value.clone());
        }
        let value = materialize(&store.view(), root)?;
        if let Some(entry) = self.entries.get_mut(root) {
            entry.value = Some(value.clone());
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OpKind, ReplicaId};
    use uuid::Uuid;

    fn stamp(n: u64) -> Stamp {
        Stamp::new(n, 0, ReplicaId::new(Uuid::from_bytes([1u8; 16])))
    }

    fn oid(s: &str) -> Oid {
        Oid::parse(s).unwrap()
    }

    fn set(o: &Oid, wall: u64, field: &str, value: &str) -> Operation {
        Operation::new(
            o.clone(),
            stamp(wall),
            OpKind::Set {
                field: field.into(),
                value: Value::from(value),
            },
        )
    }

    #[test]
    fn commit_supersedes_across_the_unsent_queue() {
        let item = oid("items/aa");
        let mut store = LocalStore::new(1);
        store.commit_batch(vec![set(&item, 1, "f", "old")]);
        store.commit_batch(vec![set(&item, 2, "f", "new")]);
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.log_len(), 1);
    }

    #[test]
    fn sent_ops_are_immutable() {
        let item = oid("items/aa");
        let mut store = LocalStore::new(1);
        store.commit_batch(vec![set(&item, 1, "f", "sent")]);
        let sent = store.take_pending();
        assert_eq!(sent.len(), 1);

        store.commit_batch(vec![set(&item, 2, "f", "later")]);
        // The sent op stays in the log; only the new one is pending.
        assert_eq!(store.log_len(), 2);
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn overwrite_keeps_the_unsent_buffer() {
        let mine = oid("items/aa");
        let theirs = oid("items/bb");
        let mut store = LocalStore::new(1);
        store.commit_batch(vec![set(&mine, 5, "f", "local")]);

        store.overwrite_with(Vec::new(), vec![set(&theirs, 1, "g", "server")]);
        assert_eq!(store.log_len(), 2);
        assert_eq!(store.pending_count(), 1);
        let (_, ops) = store.changes_after(None);
        assert!(ops.iter().any(|op| op.oid == mine));
    }

    #[test]
    fn compact_all_empties_the_log_into_baselines() {
        let item = oid("items/aa");
        let mut store = LocalStore::new(1);
        store.commit_batch(vec![set(&item, 1, "f", "x"), set(&item, 2, "g", "y")]);
        store.compact_all();
        assert_eq!(store.log_len(), 0);
        assert_eq!(store.pending_count(), 0);
        let baseline = store.baseline(&item).unwrap();
        assert_eq!(baseline.snapshot.get("f"), Some(&Value::from("x")));
        assert_eq!(baseline.snapshot.get("g"), Some(&Value::from("y")));
    }

    #[test]
    fn remote_baseline_prunes_covered_ops() {
        let item = oid("items/aa");
        let mut store = LocalStore::new(1);
        store.apply_remote(&[set(&item, 1, "f", "old"), set(&item, 9, "f", "new")]);

        let mut snapshot = Value::object();
        crate::core::apply_op(
            &mut snapshot,
            &OpKind::Set {
                field: "f".into(),
                value: Value::from("folded"),
            },
        );
        store.upsert_baseline(Baseline::new(item.clone(), snapshot, stamp(5)));
        // The op at 1 is covered, the op at 9 still applies on top.
        assert_eq!(store.log_len(), 1);
        let view = store.view();
        let value = crate::core::object_state(&view, &item);
        assert_eq!(value.get("f"), Some(&Value::from("new")));
    }

    #[test]
    fn snapshot_cache_refcounts_and_evicts() {
        let item = oid("items/aa");
        let mut store = LocalStore::new(1);
        store.commit_batch(vec![set(&item, 1, "f", "x")]);

        let mut cache = SnapshotCache::new();
        cache.subscribe(item.clone());
        cache.subscribe(item.clone());
        let value = cache.get_or_materialize(&item, &store).unwrap();
        assert_eq!(value.get("f"), Some(&Value::from("x")));

        cache.unsubscribe(&item);
        assert!(cache.subscribed(&item));
        cache.unsubscribe(&item);
        assert!(!cache.subscribed(&item));
    }
}
