//! Configuration: timing knobs, limits, and logging.
//!
//! Everything defaults sensibly; a deployment overrides via TOML and
//! the log filter additionally via `FOLIO_LOG`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub rebase: RebaseConfig,
    pub limits: Limits,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }
}

/// Replica/authority timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Silence past this excludes a replica from compaction consensus.
    pub truancy_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub ack_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            truancy_ms: 5 * 60 * 1000,
            heartbeat_interval_ms: 15_000,
            ack_interval_ms: 1_000,
            backoff_base_ms: 250,
            backoff_cap_ms: 30_000,
        }
    }
}

/// Rebase (compaction) coalescing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebaseConfig {
    pub debounce_ms: u64,
    pub max_interval_ms: u64,
    /// Pending ops past this trigger an immediate pass.
    pub max_ops: u64,
}

impl RebaseConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

impl Default for RebaseConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            max_interval_ms: 1_000,
            max_ops: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_ops_per_message: usize,
    pub max_connections: usize,
    /// Per-connection outbound queue depth before a laggard is dropped.
    pub max_queued_messages: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_ops_per_message: 10_000,
            max_connections: 1_024,
            max_queued_messages: 1_024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub format: LogFormat,
    /// EnvFilter directive, e.g. "folio=debug"; `FOLIO_LOG` overrides.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            format: LogFormat::Compact,
            filter: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
}
