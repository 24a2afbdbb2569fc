//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::error::{ErrorKind, StorageError};

/// Backoff for re-establishing the LISTEN connection.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn listener_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff for the initial database connection at startup.
///
/// - Min delay: 200ms
/// - Max delay: 10s
/// - Max attempts: 15
pub fn connect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(15)
        .with_jitter()
}

/// Determines if a storage error is worth retrying.
///
/// Only connectivity failures qualify. Conflicts need a fresh read by the
/// caller and validation errors never succeed on retry.
pub fn is_retryable(err: &StorageError) -> bool {
    err.kind() == ErrorKind::BackendUnavailable
}
