//! Core domain types for folio
//!
//! Module hierarchy follows type dependency order:
//! - time: HLC primitives (Layer 0)
//! - identity: ReplicaId, UserId, LibraryId, tokens (Layer 1)
//! - oid: object identifiers and allocation (Layer 2)
//! - value: snapshot value tree (Layer 3)
//! - op: operations and effect keys (Layer 4)
//! - baseline: compacted snapshots (Layer 5)
//! - replica: registry rows and truancy (Layer 6)
//! - apply: op folding and materialisation (Layer 7)
//! - clock: the HLC generator

pub mod apply;
pub mod baseline;
pub mod clock;
pub mod identity;
pub mod oid;
pub mod op;
pub mod replica;
pub mod time;
pub mod value;

pub use apply::{
    MaterializeError, ObjectSource, apply_all, apply_op, ensure_acyclic, materialize, object_state,
};
pub use baseline::Baseline;
pub use clock::HlcClock;
pub use identity::{Access, ClientKey, InvalidId, LibraryId, ReplicaId, TokenInfo, UserId};
pub use oid::{Oid, OidAllocator, OidError};
pub use op::{EffectKey, OpKind, Operation};
pub use replica::{ReplicaInfo, ReplicaType};
pub use time::{Stamp, StampParseError, WallClock, WallClockSource};
pub use value::{Value, ValueError};
