//! Message fan-out to connected clients of one library.
//!
//! Each connection gets a bounded queue; a connection that cannot keep
//! up is dropped with a recorded reason rather than stalling the
//! library task. Excluding the sender is by connection identity
//! (ClientKey), never by replica id.

use std::collections::{BTreeMap, BTreeSet};

use crossbeam::channel::{Sender, TrySendError};
use thiserror::Error;

use crate::core::{ClientKey, ReplicaId, TokenInfo, UserId};
use crate::protocol::ServerMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    SubscriberLagged,
    Disconnected,
}

/// One live connection's send side plus who is behind it.
pub struct Connection {
    pub sender: Sender<ServerMessage>,
    pub token: TokenInfo,
    /// Set once the connection has introduced itself via `sync`.
    pub replica_id: Option<ReplicaId>,
}

pub struct Broadcaster {
    connections: BTreeMap<ClientKey, Connection>,
    max_connections: usize,
}

impl Broadcaster {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            max_connections,
        }
    }

    pub fn register(&mut self, key: ClientKey, conn: Connection) -> Result<(), BroadcastError> {
        if self.connections.len() >= self.max_connections {
            return Err(BroadcastError::ConnectionLimitReached {
                max_connections: self.max_connections,
            });
        }
        self.connections.insert(key, conn);
        Ok(())
    }

    pub fn remove(&mut self, key: &ClientKey) -> Option<Connection> {
        self.connections.remove(key)
    }

    pub fn get(&self, key: &ClientKey) -> Option<&Connection> {
        self.connections.get(key)
    }

    pub fn get_mut(&mut self, key: &ClientKey) -> Option<&mut Connection> {
        self.connections.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Replica ids that currently hold a connection (post-handshake).
    pub fn active_replicas(&self) -> BTreeSet<ReplicaId> {
        self.connections
            .values()
            .filter_map(|conn| conn.replica_id)
            .collect()
    }

    /// How many live connections this user holds.
    pub fn connections_for_user(&self, user_id: &UserId) -> usize {
        self.connections
            .values()
            .filter(|conn| &conn.token.user_id == user_id)
            .count()
    }

    /// Send to one connection. A full or closed queue drops it.
    pub fn send_to(&mut self, key: &ClientKey, message: ServerMessage) -> Vec<Dropped> {
        let mut dropped = Vec::new();
        if let Some(conn) = self.connections.get(key) {
            match conn.sender.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped.push((*key, DropReason::SubscriberLagged)),
                Err(TrySendError::Disconnected(_)) => {
                    dropped.push((*key, DropReason::Disconnected))
                }
            }
        }
        self.reap(&mut dropped);
        dropped
    }

    /// Fan out to every connection, optionally excluding one sender.
    pub fn broadcast(
        &mut self,
        message: &ServerMessage,
        except: Option<&ClientKey>,
    ) -> Vec<Dropped> {
        let mut dropped = Vec::new();
        for (key, conn) in &self.connections {
            if except == Some(key) {
                continue;
            }
            match conn.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped.push((*key, DropReason::SubscriberLagged)),
                Err(TrySendError::Disconnected(_)) => {
                    dropped.push((*key, DropReason::Disconnected))
                }
            }
        }
        self.reap(&mut dropped);
        dropped
    }

    fn reap(&mut self, dropped: &mut Vec<Dropped>) {
        for (key, reason) in dropped.iter() {
            tracing::debug!(client = %key, ?reason, "dropping connection");
            self.connections.remove(key);
        }
    }
}

pub type Dropped = (ClientKey, DropReason);

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("connection limit reached ({max_connections})")]
    ConnectionLimitReached { max_connections: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;

    fn token(user: &str) -> TokenInfo {
        TokenInfo::read_write(UserId::new(user).unwrap())
    }

    fn register_pair(
        broadcaster: &mut Broadcaster,
        user: &str,
        capacity: usize,
    ) -> (ClientKey, crossbeam::channel::Receiver<ServerMessage>) {
        let key = ClientKey::generate();
        let (tx, rx) = crossbeam::channel::bounded(capacity);
        broadcaster
            .register(
                key,
                Connection {
                    sender: tx,
                    token: token(user),
                    replica_id: None,
                },
            )
            .unwrap();
        (key, rx)
    }

    #[test]
    fn broadcast_excludes_the_sender_by_key() {
        let mut broadcaster = Broadcaster::new(8);
        let (a, rx_a) = register_pair(&mut broadcaster, "ada", 8);
        let (_b, rx_b) = register_pair(&mut broadcaster, "brin", 8);

        let dropped = broadcaster.broadcast(&ServerMessage::HeartbeatResponse, Some(&a));
        assert!(dropped.is_empty());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn lagging_connection_is_dropped() {
        let mut broadcaster = Broadcaster::new(8);
        let (key, _rx) = register_pair(&mut broadcaster, "ada", 1);

        broadcaster.broadcast(&ServerMessage::HeartbeatResponse, None);
        let dropped = broadcaster.broadcast(&ServerMessage::HeartbeatResponse, None);
        assert_eq!(dropped, vec![(key, DropReason::SubscriberLagged)]);
        assert!(broadcaster.is_empty());
    }

    #[test]
    fn connection_limit_is_enforced() {
        let mut broadcaster = Broadcaster::new(1);
        register_pair(&mut broadcaster, "ada", 1);
        let (tx, _rx) = crossbeam::channel::bounded(1);
        let err = broadcaster.register(
            ClientKey::generate(),
            Connection {
                sender: tx,
                token: token("brin"),
                replica_id: None,
            },
        );
        assert!(matches!(
            err,
            Err(BroadcastError::ConnectionLimitReached { .. })
        ));
    }
}
