//! In-process harness: one authority server plus however many engines a
//! scenario needs, all wired over channel transports.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use folio::replica::EngineEvent;
use folio::{
    AuthorityServer, Config, LibraryId, LibrarySnapshot, ReplicaEngine, ReplicaType, TokenInfo,
    UserId,
};

/// Timings tuned for tests: immediate acks, no surprise heartbeats, and
/// rebase parked unless a scenario opts in.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.sync.ack_interval_ms = 0;
    config.sync.heartbeat_interval_ms = 60_000;
    config.sync.truancy_ms = 60_000;
    config.rebase.debounce_ms = 3_600_000;
    config.rebase.max_interval_ms = 3_600_000;
    config
}

pub struct Harness {
    pub server: Arc<AuthorityServer>,
    pub library: LibraryId,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        folio::telemetry::init(&config.logging);
        Self {
            server: AuthorityServer::new(config.clone()),
            library: LibraryId::parse("test-library").unwrap(),
            config,
        }
    }

    pub fn engine(&self, replica_type: ReplicaType) -> ReplicaEngine {
        ReplicaEngine::new(self.config.clone(), replica_type, 1)
    }

    pub fn connect_rw(&self, engine: &mut ReplicaEngine, user: &str) {
        self.connect_with(engine, TokenInfo::read_write(UserId::new(user).unwrap()));
    }

    pub fn connect_with(&self, engine: &mut ReplicaEngine, token: TokenInfo) {
        let conn = self.server.connect(&self.library, token);
        engine.connect(conn);
    }

    /// Pump every engine for a while so in-flight traffic lands.
    pub fn settle(&self, engines: &mut [&mut ReplicaEngine]) {
        for _ in 0..40 {
            for engine in engines.iter_mut() {
                engine.pump();
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Pump until the authority's state satisfies the predicate.
    pub fn wait_for<F>(&self, engines: &mut [&mut ReplicaEngine], pred: F) -> LibrarySnapshot
    where
        F: Fn(&LibrarySnapshot) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            for engine in engines.iter_mut() {
                engine.pump();
            }
            if let Some(snapshot) = self.server.inspect(&self.library)
                && pred(&snapshot)
            {
                return snapshot;
            }
            if Instant::now() > deadline {
                panic!(
                    "authority never reached expected state: {:?}",
                    self.server.inspect(&self.library)
                );
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Pump one engine for `ms` milliseconds, collecting its events.
pub fn pump_for(engine: &mut ReplicaEngine, ms: u64) -> Vec<EngineEvent> {
    let deadline = Instant::now() + Duration::from_millis(ms);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        events.extend(engine.pump());
        thread::sleep(Duration::from_millis(5));
    }
    events
}

/// Pump one engine until it emits an event matching the predicate.
pub fn pump_until<F>(engine: &mut ReplicaEngine, pred: F) -> Vec<EngineEvent>
where
    F: Fn(&EngineEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events = Vec::new();
    loop {
        events.extend(engine.pump());
        if events.iter().any(&pred) {
            return events;
        }
        if Instant::now() > deadline {
            panic!("engine never emitted the expected event: {events:?}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}
