#![forbid(unsafe_code)]

//! folio: a local-first persistence and synchronization engine for
//! collaborative document libraries.
//!
//! Replicas edit locally without coordination; a per-library authority
//! keeps a totally-ordered operation log, rebroadcasts deliveries, and
//! compacts acknowledged history into per-object baselines. Conflict
//! resolution is last-writer-wins by hybrid logical clock at the field
//! level; convergence is eventual.

pub mod authority;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod replica;
pub mod store;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at crate root for convenience
pub use crate::authority::{AuthorityServer, ClientConn, Library, LibraryEvent, LibrarySnapshot};
pub use crate::config::Config;
pub use crate::core::{
    Access, Baseline, ClientKey, HlcClock, LibraryId, Oid, OidAllocator, OpKind, Operation,
    ReplicaId, ReplicaInfo, ReplicaType, Stamp, TokenInfo, UserId, Value, WallClock,
};
pub use crate::protocol::{ClientMessage, ForbiddenReason, PresenceState, ServerMessage};
pub use crate::replica::{Batch, ConnState, EngineEvent, ReplicaEngine};
