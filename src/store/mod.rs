//! Storage components shared by the authority and the client engine.
//!
//! Both sides keep an operation log and a baseline store; the durable
//! backend behind them is a collaborator, so these are in-memory
//! structures with the backend's key discipline.

pub mod baselines;
pub mod oplog;

pub use baselines::{BaselineError, BaselineStore};
pub use oplog::OperationLog;

use crate::core::{Baseline, ObjectSource, Oid, Operation, Stamp};

/// Read view over one side's log + baselines, for materialisation.
pub struct StoreView<'a> {
    pub log: &'a OperationLog,
    pub baselines: &'a BaselineStore,
}

impl ObjectSource for StoreView<'_> {
    fn baseline(&self, oid: &Oid) -> Option<Baseline> {
        self.baselines.get(oid)
    }

    fn ops_for(&self, oid: &Oid, after: Option<&Stamp>) -> Vec<Operation> {
        self.log.get_for_oid(oid, after)
    }
}
