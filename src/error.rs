use thiserror::Error;

use crate::authority::{BroadcastError, RegistryError, TransportClosed};
use crate::core::{InvalidId, MaterializeError, OidError, StampParseError, ValueError};
use crate::replica::EngineError;
use crate::store::BaselineError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the canonical per-module
/// errors, with retry/effect classification for callers that need to
/// decide what to do next.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Oid(#[from] OidError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Stamp(#[from] StampParseError),

    #[error(transparent)]
    Id(#[from] InvalidId),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error(transparent)]
    Baseline(#[from] BaselineError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Transport(#[from] TransportClosed),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            // Malformed inputs and schema problems never fix themselves.
            Error::Oid(_) | Error::Value(_) | Error::Stamp(_) | Error::Id(_) => {
                Transience::Permanent
            }
            Error::Materialize(_) => Transience::Permanent,
            Error::Baseline(_) | Error::Registry(_) => Transience::Permanent,
            // Capacity pressure and dead transports may clear up.
            Error::Broadcast(_) | Error::Transport(_) => Transience::Retryable,
            Error::Engine(e) => match e {
                EngineError::SchemaMismatch { .. } => Transience::Permanent,
                EngineError::Materialize(_) | EngineError::Oid(_) => Transience::Permanent,
            },
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Oid(_) | Error::Value(_) | Error::Stamp(_) | Error::Id(_) => Effect::None,
            Error::Materialize(_) | Error::Engine(_) => Effect::None,
            Error::Baseline(_) | Error::Registry(_) => Effect::None,
            Error::Broadcast(_) => Effect::None,
            Error::Transport(_) => Effect::Unknown,
        }
    }
}
