//! Shared entity store integration tests.
//!
//! Tests the store and watch contracts against every supported database.
//! Each driver module imports these test functions and runs them.

pub mod entity_store_tests;
pub mod watch_tests;
