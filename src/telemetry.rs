//! Tracing subscriber setup from LoggingConfig.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

const ENV_FILTER_VAR: &str = "FOLIO_LOG";

/// Install the global subscriber. Safe to call more than once; later
/// calls are no-ops (useful from tests).
pub fn init(config: &LoggingConfig) {
    if !config.stdout {
        return;
    }

    let filter = EnvFilter::try_from_env(ENV_FILTER_VAR).unwrap_or_else(|_| {
        config
            .filter
            .as_deref()
            .map(EnvFilter::new)
            .unwrap_or_else(|| EnvFilter::new("info"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.format {
        LogFormat::Pretty => builder.pretty().finish().try_init(),
        LogFormat::Compact => builder.compact().finish().try_init(),
        LogFormat::Json => builder.json().finish().try_init(),
    };
    // Err means a subscriber is already installed; that is fine.
    let _ = result;
}
