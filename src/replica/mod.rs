//! The client engine and its local state.
//!
//! - buffer: batch collection and op superseding
//! - store: local log/baselines, outbound queue, snapshot cache
//! - engine: the connection state machine and write API

pub mod buffer;
pub mod engine;
pub mod store;

pub use buffer::{BatchBuffer, supersede};
pub use engine::{Batch, ConnState, EngineError, EngineEvent, ReplicaEngine};
pub use store::{LocalStore, SendState, SnapshotCache};
