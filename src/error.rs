//! Storage error taxonomy.
//!
//! Every failure surfaced by the engine is a [`StorageError`]. Callers that
//! need to report errors outward convert them into a [`Status`], which
//! carries a coarse [`ErrorKind`] and a message free of raw SQL.

use std::fmt;

use serde::Serialize;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("entity not found: {key}")]
    NotFound { key: String },

    #[error("entity already exists: {key}")]
    AlreadyExists { key: String },

    #[error("optimistic lock failed for {key}: expected version {expected}, current {actual}")]
    OptimisticLockFailed {
        key: String,
        expected: i64,
        actual: i64,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("watch terminated by listener shutdown")]
    WatchTerminated,

    #[error("{op} {key}: {source}")]
    Operation {
        op: &'static str,
        key: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a storage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    OptimisticLockFailed,
    BadRequest,
    BackendUnavailable,
    WatchTerminated,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::OptimisticLockFailed => "optimistic_lock_failed",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::WatchTerminated => "watch_terminated",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured status handed to callers instead of raw database errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    /// Wrap a mid-transaction failure with the operation name and key.
    ///
    /// Errors that already describe the key (not found, conflicts, ...) are
    /// returned unchanged so callers can still match on them.
    pub fn in_operation(self, op: &'static str, key: impl fmt::Display) -> Self {
        match self {
            StorageError::Database(_) | StorageError::Json(_) => StorageError::Operation {
                op,
                key: key.to_string(),
                source: Box::new(self),
            },
            other => other,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            StorageError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            StorageError::OptimisticLockFailed { .. } => ErrorKind::OptimisticLockFailed,
            StorageError::InvalidKey(_)
            | StorageError::InvalidSelector(_)
            | StorageError::BadRequest(_) => ErrorKind::BadRequest,
            StorageError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            StorageError::WatchTerminated => ErrorKind::WatchTerminated,
            StorageError::Operation { source, .. } => source.kind(),
            StorageError::Database(e) => {
                if is_connection_error(e) {
                    ErrorKind::BackendUnavailable
                } else {
                    ErrorKind::Internal
                }
            }
            StorageError::Json(_) => ErrorKind::Internal,
        }
    }

    /// True for failures a caller can resolve by re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::OptimisticLockFailed
    }

    /// Convert into the caller-facing status object.
    pub fn to_status(&self) -> Status {
        let message = match self {
            StorageError::Operation { op, key, source } => match source.as_ref() {
                StorageError::Database(_) => format!("{op} {key}: database operation failed"),
                other => format!("{op} {key}: {other}"),
            },
            StorageError::Database(_) => "database operation failed".to_string(),
            other => other.to_string(),
        };
        Status {
            kind: self.kind(),
            message,
        }
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}

/// Returns true when a database error is a unique-constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation),
        _ => false,
    }
}
