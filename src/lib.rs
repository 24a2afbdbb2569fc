//! sqlstash - versioned, watchable entity storage on a relational database.
//!
//! Provides Kubernetes-style Create/Get/List/Update/Delete/Watch semantics
//! over opaque entities stored in Postgres or SQLite:
//!
//! - [`storage`]: transactional CRUD with append-only history, per-kind
//!   resource version counters, label index and the folder MPTT index.
//! - [`watch`]: change feeds (polling or Postgres LISTEN/NOTIFY), the
//!   fan-out broadcaster and predicate-aware watch sessions.
//! - [`access_policy`]: rule normalisation for access policies.

pub mod access_policy;
pub mod config;
pub mod error;
pub mod storage;
pub mod utils;
pub mod watch;

pub use config::Config;
pub use error::{ErrorKind, Status, StorageError};
pub use storage::{EntityStore, Key};
pub use watch::{WatchEvent, WatchEventType, WatchRequest, Watcher};
