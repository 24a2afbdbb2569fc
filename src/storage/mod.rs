//! Relational entity storage.
//!
//! Entities live in a "latest row" table backed by an append-only history.
//! Every write is stamped with the next version of its (group, resource)
//! counter. Postgres and SQLite are supported; the dialect is picked from
//! the connection URL and only [`db`] knows which driver is in use.

pub mod codec;
pub mod db;
pub mod dialect;
pub mod entity;
pub mod folder;
pub mod key;
pub mod labels;
pub mod list;
pub mod maintenance;
pub mod resource_version;
pub mod schema;
pub mod selector;
pub mod store;

pub use db::{DbPool, Tx};
pub use dialect::Dialect;
pub use entity::{
    compute_etag, Action, Entity, EntityMeta, EntityVersionInfo, WriteRequest, WriteResult,
    WriteStatus,
};
pub use folder::{FolderIndex, FolderInfo};
pub use key::{Key, KeyPrefix};
pub use list::{ContinueToken, ListRequest, ListResponse};
pub use resource_version::{KindVersionRow, ResourceStats};
pub use selector::{
    LabelSelector, Operator, Requirement, SelectionPredicate, SortBy, SortColumn, FOLDER_LABEL,
    LIST_DELETED_LABEL, SORT_BY_LABEL,
};
pub use store::{DeleteRequest, EntityStore};

pub use crate::error::{Result, StorageError};
