//! The hybrid logical clock: every stamp a replica emits is strictly
//! greater than everything it has produced or observed before.

use std::time::{SystemTime, UNIX_EPOCH};

use super::identity::ReplicaId;
use super::time::Stamp;

/// Stamp generator for one replica.
///
/// Wall time when it moves forward, a logical counter when it does not
/// (same millisecond, or a clock that jumped backward). The replica id
/// rides in every stamp as the cross-replica tiebreak.
#[derive(Debug)]
pub struct HlcClock {
    replica: ReplicaId,
    wall_ms: u64,
    counter: u32,
}

impl HlcClock {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            wall_ms: Self::now_ms(),
            counter: 0,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Next stamp; strictly greater than every prior tick and every
    /// stamp passed to `observe`, regardless of the wall clock.
    pub fn tick(&mut self) -> Stamp {
        let now = Self::now_ms();
        if now > self.wall_ms {
            self.wall_ms = now;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        Stamp::new(self.wall_ms, self.counter, self.replica)
    }

    /// Fold a remote stamp in so the next tick lands above it. Called
    /// for every stamp that arrives over the wire.
    pub fn observe(&mut self, remote: &Stamp) {
        if remote.wall_ms > self.wall_ms {
            self.wall_ms = remote.wall_ms;
            self.counter = remote.counter;
        } else if remote.wall_ms == self.wall_ms && remote.counter > self.counter {
            self.counter = remote.counter;
        }

        let now = Self::now_ms();
        if now > self.wall_ms {
            self.wall_ms = now;
            self.counter = 0;
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}
