//! Process wiring helpers: tracing setup, backoff policies, metrics.

pub mod bootstrap;
pub mod metrics;
pub mod retry;
