//! Bootstrap utilities for processes embedding the engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the SQLSTASH_LOG environment variable.
///
/// Defaults to "info" level if SQLSTASH_LOG is not set. Library code never
/// calls this; it belongs in `main` or a test harness. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
