//! Log compaction ("rebase"): fold acknowledged prefixes of the
//! operation log into baselines and drop them.
//!
//! An op qualifies when its stamp is strictly below the global ack -
//! every live, write-capable replica has acknowledged strictly later
//! state - and within each OID only a contiguous prefix is folded.

use std::time::{Duration, Instant};

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::core::{Oid, Operation, Stamp};
use crate::store::{BaselineError, BaselineStore, OperationLog};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebaseStats {
    pub folded: usize,
    pub skipped: usize,
    pub objects: usize,
}

/// Fold everything below `global_ack` into baselines and drop it.
///
/// Fold-then-drop per object runs under the owning library task's
/// exclusive access, which is the transaction boundary here.
pub fn run_rebase(
    log: &mut OperationLog,
    baselines: &mut BaselineStore,
    global_ack: &Stamp,
) -> Result<RebaseStats, BaselineError> {
    let candidates = log.get_before(global_ack);
    if candidates.is_empty() {
        return Ok(RebaseStats::default());
    }

    let mut buckets: BTreeMap<Oid, Vec<Operation>> = BTreeMap::new();
    for op in candidates {
        buckets.entry(op.oid.clone()).or_default().push(op);
    }

    let mut stats = RebaseStats::default();
    for (oid, ops) in buckets {
        // Hard-stop guard: the bucket arrived stamp-ascending, so any
        // inversion means the log's index is inconsistent; stop folding
        // this object rather than baking a wrong order into the baseline.
        let mut prefix = Vec::with_capacity(ops.len());
        let mut last: Option<&Stamp> = None;
        for op in &ops {
            if last.is_some_and(|l| &op.stamp <= l) {
                warn!(oid = %oid, stamp = %op.stamp, "out-of-prefix op, skipping rest of object");
                break;
            }
            last = Some(&op.stamp);
            prefix.push(op.clone());
        }
        stats.skipped += ops.len() - prefix.len();

        // Anything at or below the existing baseline was folded by an
        // earlier pass; a duplicate delivery can resurface it.
        if let Some(existing) = baselines.get(&oid) {
            let before = prefix.len();
            prefix.retain(|op| op.stamp > existing.stamp);
            if prefix.len() != before {
                warn!(oid = %oid, "dropping ops at or below existing baseline stamp");
                log.drop_ops(&ops[..before - prefix.len()]);
            }
        }
        if prefix.is_empty() {
            continue;
        }

        baselines.apply_operations(&oid, &prefix)?;
        log.drop_ops(&prefix);
        stats.folded += prefix.len();
        stats.objects += 1;
    }

    debug!(
        folded = stats.folded,
        objects = stats.objects,
        skipped = stats.skipped,
        ack = %global_ack,
        "rebase pass complete"
    );
    Ok(stats)
}

/// Coalesces rebase triggers with debounce, max interval, and max ops.
///
/// Writes mark the library dirty; the library task asks for the next
/// deadline and runs a single pass when it fires, however many writes
/// arrived in between.
pub struct RebaseScheduler {
    debounce: Duration,
    max_interval: Duration,
    max_ops: u64,
    dirty: bool,
    dirty_since: Option<Instant>,
    last_write_at: Option<Instant>,
    pending_ops: u64,
}

impl RebaseScheduler {
    pub fn new(debounce: Duration, max_interval: Duration, max_ops: u64) -> Self {
        Self {
            debounce,
            max_interval,
            max_ops,
            dirty: false,
            dirty_since: None,
            last_write_at: None,
            pending_ops: 0,
        }
    }

    pub fn record_write(&mut self, now: Instant, ops: u64) {
        self.pending_ops = self.pending_ops.saturating_add(ops);
        if !self.dirty {
            self.dirty = true;
            self.dirty_since = Some(now);
        }
        self.last_write_at = Some(now);
    }

    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        if !self.dirty {
            return None;
        }
        let last_write = self.last_write_at?;
        let dirty_since = self.dirty_since.unwrap_or(last_write);
        let debounce_deadline = last_write + self.debounce;
        let max_deadline = dirty_since + self.max_interval;
        let mut deadline = debounce_deadline.min(max_deadline);
        if self.pending_ops >= self.max_ops {
            deadline = now;
        }
        Some(deadline)
    }

    pub fn due(&self, now: Instant) -> bool {
        self.deadline(now).is_some_and(|deadline| deadline <= now)
    }

    /// A pass ran; clear the dirty state.
    pub fn complete(&mut self) {
        self.dirty = false;
        self.dirty_since = None;
        self.last_write_at = None;
        self.pending_ops = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OpKind, ReplicaId, Value};
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
    fn folds_everything_below_the_ack() {
        let a = Oid::parse("items/aa").unwrap();
        let b = Oid::parse("items/bb").unwrap();
        let mut log = OperationLog::new();
        let mut baselines = BaselineStore::new();
        log.insert_all(&[
            set(&a, 1, "f", "1"),
            set(&a, 2, "f", "2"),
            set(&b, 3, "g", "3"),
            set(&a, 9, "f", "late"),
        ]);

        let stats = run_rebase(&mut log, &mut baselines, &stamp(5)).unwrap();
        assert_eq!(stats.folded, 3);
        assert_eq!(stats.objects, 2);

        // The late op survives; everything else became baseline.
        assert_eq!(log.len(), 1);
        let base_a = baselines.get(&a).unwrap();
        assert_eq!(base_a.stamp, stamp(2));
        assert_eq!(base_a.snapshot.get("f"), Some(&Value::from("2")));
        assert_eq!(baselines.get(&b).unwrap().stamp, stamp(3));
    }

    #[test]
    fn pass_with_nothing_to_do_is_empty() {
        let mut log = OperationLog::new();
        let mut baselines = BaselineStore::new();
        let stats = run_rebase(&mut log, &mut baselines, &stamp(5)).unwrap();
        assert_eq!(stats, RebaseStats::default());
    }

    #[test]
    fn ops_below_existing_baseline_are_discarded_not_folded() {
        let a = Oid::parse("items/aa").unwrap();
        let mut log = OperationLog::new();
        let mut baselines = BaselineStore::new();
        baselines
            .apply_operations(&a, &[set(&a, 5, "f", "current")])
            .unwrap();

        // A duplicate delivery resurfaced an already-compacted op.
        log.insert_all(&[set(&a, 2, "f", "stale")]);
        let stats = run_rebase(&mut log, &mut baselines, &stamp(8)).unwrap();
        assert_eq!(stats.folded, 0);
        assert!(log.is_empty());
        assert_eq!(
            baselines.get(&a).unwrap().snapshot.get("f"),
            Some(&Value::from("current"))
        );
    }

    #[test]
    fn scheduler_debounces_and_caps() {
        let mut scheduler = RebaseScheduler::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            3,
        );
        let base = Instant::now();
        assert!(scheduler.deadline(base).is_none());

        scheduler.record_write(base, 1);
        assert_eq!(scheduler.deadline(base), Some(base + Duration::from_millis(10)));

        // Another write pushes the debounce out...
        scheduler.record_write(base + Duration::from_millis(5), 1);
        assert_eq!(
            scheduler.deadline(base + Duration::from_millis(5)),
            Some(base + Duration::from_millis(15))
        );

        // ...but max_ops forces immediate.
        scheduler.record_write(base + Duration::from_millis(6), 1);
        assert!(scheduler.due(base + Duration::from_millis(6)));

        scheduler.complete();
        assert!(scheduler.deadline(base + Duration::from_millis(7)).is_none());
    }

    #[test]
    fn scheduler_max_interval_caps_repeated_debounce() {
        let mut scheduler = RebaseScheduler::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            1_000,
        );
        let base = Instant::now();
        scheduler.record_write(base, 1);
        scheduler.record_write(base + Duration::from_millis(35), 1);
        assert_eq!(
            scheduler.deadline(base + Duration::from_millis(35)),
            Some(base + Duration::from_millis(40))
        );
    }
}
