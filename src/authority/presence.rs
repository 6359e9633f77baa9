//! Ephemeral presence: who is here right now, with what cursor/profile.
//!
//! Purely in-memory, keyed by user. Nothing here touches the operation
//! log; a restart of the authority empties the room.

use std::collections::BTreeMap;

use crate::core::{ReplicaId, UserId};
use crate::protocol::PresenceState;

#[derive(Default)]
pub struct PresenceMap {
    by_user: BTreeMap<UserId, PresenceState>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence update; the newest replica to speak for a user
    /// owns the entry.
    pub fn update(&mut self, state: PresenceState) {
        self.by_user.insert(state.id.clone(), state);
    }

    pub fn get(&self, user_id: &UserId) -> Option<&PresenceState> {
        self.by_user.get(user_id)
    }

    /// Everyone currently present, for the sync-resp peer list.
    pub fn snapshot(&self) -> Vec<PresenceState> {
        self.by_user.values().cloned().collect()
    }

    /// Remove a user's entry (their last replica left). Returns the
    /// removed entry so the caller can announce `presence-offline`.
    pub fn remove_user(&mut self, user_id: &UserId) -> Option<PresenceState> {
        self.by_user.remove(user_id)
    }

    /// Sweep entries owned by replicas that are no longer welcome
    /// (truant or disconnected). Returns what was removed.
    pub fn sweep<F>(&mut self, mut keep_replica: F) -> Vec<PresenceState>
    where
        F: FnMut(&ReplicaId) -> bool,
    {
        let stale: Vec<UserId> = self
            .by_user
            .iter()
            .filter(|(_, state)| !keep_replica(&state.replica_id))
            .map(|(user, _)| user.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|user| self.by_user.remove(&user))
            .collect()
    }
}
