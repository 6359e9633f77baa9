//! Authority process plumbing.
//!
//! One dispatcher (the `connect` path) routes each incoming connection
//! to its library's task thread; each library task owns its `Library`
//! exclusively and drains a single inbox. Different libraries run in
//! parallel, one library never races itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::core::{ClientKey, LibraryId, TokenInfo};
use crate::protocol::{ClientMessage, ServerMessage};

use super::library::{Library, LibraryEvent};

/// Idle wake interval for a library task with no scheduled work.
const IDLE_TICK: Duration = Duration::from_millis(250);

pub struct AuthorityServer {
    config: Config,
    libraries: Mutex<HashMap<LibraryId, LibraryHandle>>,
}

struct LibraryHandle {
    inbox: Sender<LibraryEvent>,
    join: JoinHandle<()>,
}

impl AuthorityServer {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            libraries: Mutex::new(HashMap::new()),
        })
    }

    /// Accept a connection into a library. The library task is created
    /// on first access and lives until shutdown.
    pub fn connect(&self, library: &LibraryId, token: TokenInfo) -> ClientConn {
        let inbox = self.library_inbox(library);
        let key = ClientKey::generate();
        let (out_tx, out_rx) =
            crossbeam::channel::bounded(self.config.limits.max_queued_messages);
        // A dropped library task just means the conn behaves as closed.
        let _ = inbox.send(LibraryEvent::Connect {
            key,
            token,
            sender: out_tx,
        });
        ClientConn {
            key,
            inbox,
            incoming: out_rx,
            live: true,
        }
    }

    /// Admin/status view of one library's current state. `None` when the
    /// library has no running task.
    pub fn inspect(&self, library: &LibraryId) -> Option<super::library::LibrarySnapshot> {
        let inbox = {
            let libraries = self.libraries.lock().unwrap_or_else(|e| e.into_inner());
            libraries.get(library)?.inbox.clone()
        };
        let (tx, rx) = crossbeam::channel::bounded(1);
        inbox.send(LibraryEvent::Inspect { respond: tx }).ok()?;
        rx.recv_timeout(Duration::from_secs(5)).ok()
    }

    /// Stop every library task and wait for them.
    pub fn shutdown(&self) {
        let handles: Vec<LibraryHandle> = {
            let mut libraries = self.libraries.lock().unwrap_or_else(|e| e.into_inner());
            libraries.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.inbox.send(LibraryEvent::Shutdown);
            let _ = handle.join.join();
        }
    }

    fn library_inbox(&self, library: &LibraryId) -> Sender<LibraryEvent> {
        let mut libraries = self.libraries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = libraries.get(library) {
            return handle.inbox.clone();
        }

        let (tx, rx) = crossbeam::channel::unbounded();
        let lib = Library::new(library.clone(), self.config.clone());
        let join = thread::Builder::new()
            .name(format!("library-{library}"))
            .spawn(move || run_library(lib, rx))
            .expect("spawn library task");
        libraries.insert(
            library.clone(),
            LibraryHandle {
                inbox: tx.clone(),
                join,
            },
        );
        tx
    }
}

fn run_library(mut lib: Library, inbox: Receiver<LibraryEvent>) {
    loop {
        let now = Instant::now();
        let timeout = lib
            .next_deadline(now)
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(IDLE_TICK);

        match inbox.recv_timeout(timeout) {
            Ok(event) => {
                if !lib.handle(event) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        lib.maybe_rebase(Instant::now());
    }
    info!(library = %lib.id(), "library task stopped");
}

/// One client's end of a connection: typed send/receive plus explicit
/// disconnect. Dropping the handle counts as a disconnect (the library
/// sees connection loss either way).
#[derive(Debug)]
pub struct ClientConn {
    key: ClientKey,
    inbox: Sender<LibraryEvent>,
    incoming: Receiver<ServerMessage>,
    live: bool,
}

impl ClientConn {
    pub fn key(&self) -> ClientKey {
        self.key
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), TransportClosed> {
        self.inbox
            .send(LibraryEvent::Message {
                key: self.key,
                message,
            })
            .map_err(|_| TransportClosed)
    }

    /// `Ok(None)` means no message right now; `Err` means the library
    /// side is gone and the connection is dead.
    pub fn try_recv(&self) -> Result<Option<ServerMessage>, TransportClosed> {
        match self.incoming.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(crossbeam::channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam::channel::TryRecvError::Disconnected) => Err(TransportClosed),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ServerMessage>, TransportClosed> {
        match self.incoming.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportClosed),
        }
    }

    pub fn disconnect(mut self) {
        self.notify_disconnect();
    }

    fn notify_disconnect(&mut self) {
        if self.live {
            self.live = false;
            let _ = self.inbox.send(LibraryEvent::Disconnect { key: self.key });
        }
    }
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        self.notify_disconnect();
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("transport closed")]
pub struct TransportClosed;
