//! The authority: per-library coordination, compaction, and fan-out.
//!
//! - registry: replica roster and the global ack floor
//! - presence: ephemeral who-is-here state
//! - broadcast: per-connection fan-out with lag handling
//! - rebase: log compaction pass and its coalescing scheduler
//! - library: the per-library message handlers
//! - server: dispatcher and per-library task threads

pub mod broadcast;
pub mod library;
pub mod presence;
pub mod rebase;
pub mod registry;
pub mod server;

pub use broadcast::{BroadcastError, Broadcaster, Connection, DropReason};
pub use library::{Library, LibraryEvent, LibrarySnapshot};
pub use presence::PresenceMap;
pub use rebase::{RebaseScheduler, RebaseStats, run_rebase};
pub use registry::{RegistryError, ReplicaRegistry, RosterStatus};
pub use server::{AuthorityServer, ClientConn, TransportClosed};
