//! In-memory entity model.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::key::Key;
use crate::error::Result;

/// The operation that produced a stored version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Zero value carried by an empty entity.
    #[default]
    Unknown,
    Created,
    Updated,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Unknown => "unknown",
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "created" => Action::Created,
            "updated" => Action::Updated,
            "deleted" => Action::Deleted,
            _ => Action::Unknown,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata envelope stored beside the opaque body.
///
/// `BTreeMap`s keep the serialized form stable so the ETag only changes
/// when the content does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityMeta {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Searchable fields, denormalized into their own column.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub folder: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub slug: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl EntityMeta {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// A stored object at one resource version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub subresource: String,
    /// Assigned at creation, never changes.
    pub guid: String,
    pub resource_version: i64,
    /// Version this one replaced; 0 for a create.
    pub previous_version: i64,
    pub action: Action,
    pub body: Vec<u8>,
    pub meta: EntityMeta,
    pub status: Vec<u8>,
    pub errors: Vec<String>,
    pub etag: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: i64,
    pub updated_by: String,
}

impl Entity {
    /// True for the zero entity returned when a read matches nothing.
    pub fn is_empty(&self) -> bool {
        self.guid.is_empty()
    }

    pub fn key(&self) -> Key {
        Key {
            group: self.group.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            subresource: self.subresource.clone(),
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.meta.labels
    }

    pub fn folder(&self) -> &str {
        &self.meta.folder
    }

    /// Resource version as the opaque decimal string callers see.
    pub fn resource_version_string(&self) -> String {
        self.resource_version.to_string()
    }

    /// Recompute the ETag from the current body, meta and status.
    pub fn compute_etag(&self) -> Result<String> {
        compute_etag(&self.body, &self.meta, &self.status)
    }
}

/// Content hash over body, meta and status.
///
/// Each part is length-prefixed so moving bytes between parts changes
/// the hash.
pub fn compute_etag(body: &[u8], meta: &EntityMeta, status: &[u8]) -> Result<String> {
    let meta_json = serde_json::to_vec(meta)?;
    let mut hasher = Sha256::new();
    for part in [body, meta_json.as_slice(), status] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    Created,
    Updated,
    Deleted,
    /// Content was identical; no new version was issued.
    Unchanged,
}

impl WriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStatus::Created => "created",
            WriteStatus::Updated => "updated",
            WriteStatus::Deleted => "deleted",
            WriteStatus::Unchanged => "unchanged",
        }
    }
}

/// Entity plus the status of the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub entity: Entity,
    pub status: WriteStatus,
}

/// Create or update request.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub key: Key,
    pub body: Vec<u8>,
    pub meta: EntityMeta,
    pub status: Vec<u8>,
    pub errors: Vec<String>,
    /// Expected current version for updates, as the caller's decimal
    /// string. Empty skips the check.
    pub previous_version: String,
    /// Identity recorded in created_by/updated_by.
    pub actor: String,
}

impl WriteRequest {
    pub fn new(key: Key, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, meta: EntityMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_status(mut self, status: impl Into<Vec<u8>>) -> Self {
        self.status = status.into();
        self
    }

    pub fn expecting(mut self, previous_version: impl Into<String>) -> Self {
        self.previous_version = previous_version.into();
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// Summary of one history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityVersionInfo {
    pub resource_version: i64,
    pub previous_version: i64,
    pub action: Action,
    pub etag: String,
    pub size: usize,
    pub updated_at: i64,
    pub updated_by: String,
}

impl From<&Entity> for EntityVersionInfo {
    fn from(entity: &Entity) -> Self {
        Self {
            resource_version: entity.resource_version,
            previous_version: entity.previous_version,
            action: entity.action,
            etag: entity.etag.clone(),
            size: entity.body.len(),
            updated_at: entity.updated_at,
            updated_by: entity.updated_by.clone(),
        }
    }
}
