//! Pending-operation buffering and superseding.
//!
//! Before a batch commits, and while ops sit unsent in the outbound
//! queue, a newer op replaces older pending ops with the same effect:
//! rapid UI-driven edits (a slider emitting a hundred sets) collapse to
//! one op on the wire. Transmitted ops are immutable; superseding only
//! ever touches what has not left the device.

use crate::core::{EffectKey, Operation};

/// Remove from `pending` every op the incoming one supersedes.
///
/// - same oid + same field: earlier set/delete drops (a delete also
///   absorbs earlier sets on the field, since the keys match)
/// - initialize: absorbs everything pending for its object
/// - list edits: never supersede, order is meaning
pub fn supersede(pending: &mut Vec<Operation>, incoming: &Operation) {
    match incoming.effect_key() {
        EffectKey::Object => pending.retain(|op| op.oid != incoming.oid),
        EffectKey::Field(field) => pending.retain(|op| {
            op.oid != incoming.oid || op.effect_key() != EffectKey::Field(field.clone())
        }),
        EffectKey::Positional => {}
    }
}

/// Operations collected inside one batch, superseded as they arrive.
#[derive(Default)]
pub struct BatchBuffer {
    ops: Vec<Operation>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        supersede(&mut self.ops, &op);
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Operation> {
        self.ops
    }
}
