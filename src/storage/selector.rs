//! Label selectors and selection predicates.
//!
//! Selectors arrive already parsed. Requirements on the reserved
//! `grafana.app/*` keys are not label filters: they are pulled out into
//! native list options (folder, sort order, include deleted). Only
//! equality and `In` are accepted on those keys.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, StorageError};

use super::entity::Entity;

pub const FOLDER_LABEL: &str = "grafana.app/folder";
pub const SORT_BY_LABEL: &str = "grafana.app/sortBy";
pub const LIST_DELETED_LABEL: &str = "grafana.app/listDeleted";

/// Selector operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::In => "in",
            Operator::NotIn => "notin",
            Operator::Exists => "exists",
            Operator::DoesNotExist => "!",
        };
        f.write_str(s)
    }
}

/// One `key op values` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: Operator, values: Vec<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(StorageError::InvalidSelector("empty label key".to_string()));
        }
        let arity_ok = match operator {
            Operator::Equals | Operator::NotEquals => values.len() == 1,
            Operator::In | Operator::NotIn => !values.is_empty(),
            Operator::Exists | Operator::DoesNotExist => values.is_empty(),
        };
        if !arity_ok {
            return Err(StorageError::InvalidSelector(format!(
                "operator {operator} on {key:?} does not accept {} value(s)",
                values.len()
            )));
        }
        Ok(Self {
            key,
            operator,
            values,
        })
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::Equals,
            values: vec![value.into()],
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => value.is_some_and(|v| self.values.contains(v)),
            Operator::NotEquals | Operator::NotIn => {
                value.map_or(true, |v| !self.values.contains(v))
            }
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// Conjunction of requirements. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// `key = value` pairs that can be pushed into SQL.
    pub fn equality_pairs(&self) -> Vec<(&str, &str)> {
        self.requirements
            .iter()
            .filter(|r| r.operator == Operator::Equals)
            .map(|r| (r.key.as_str(), r.values[0].as_str()))
            .collect()
    }

    /// Requirements that SQL does not evaluate.
    pub fn residual(&self) -> LabelSelector {
        LabelSelector {
            requirements: self
                .requirements
                .iter()
                .filter(|r| r.operator != Operator::Equals)
                .cloned()
                .collect(),
        }
    }
}

/// Columns a list may be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Name,
    Title,
    CreatedAt,
    UpdatedAt,
    ResourceVersion,
}

impl SortColumn {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "name" | "metadata.name" => Some(SortColumn::Name),
            "title" => Some(SortColumn::Title),
            "created_at" | "creationTimestamp" => Some(SortColumn::CreatedAt),
            "updated_at" | "updatedTimestamp" => Some(SortColumn::UpdatedAt),
            "resource_version" | "resourceVersion" => Some(SortColumn::ResourceVersion),
            _ => None,
        }
    }
}

/// One sort key; a leading `-` in the selector value means descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortBy {
    pub column: SortColumn,
    pub descending: bool,
}

impl SortBy {
    pub fn parse(raw: &str) -> Result<Self> {
        let (descending, field) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let column = SortColumn::parse(field).ok_or_else(|| {
            StorageError::BadRequest(format!("unsupported sort field {field:?}"))
        })?;
        Ok(Self { column, descending })
    }
}

/// Options carried by reserved selector keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservedOptions {
    /// Restrict to entities in any of these folders.
    pub folders: Vec<String>,
    pub sort: Vec<SortBy>,
    pub include_deleted: bool,
}

/// Split a selector into reserved options and the remaining label filter.
pub fn extract_reserved(selector: &LabelSelector) -> Result<(ReservedOptions, LabelSelector)> {
    let mut options = ReservedOptions::default();
    let mut rest = LabelSelector::default();

    for req in &selector.requirements {
        let reserved = matches!(
            req.key.as_str(),
            FOLDER_LABEL | SORT_BY_LABEL | LIST_DELETED_LABEL
        );
        if !reserved {
            rest.requirements.push(req.clone());
            continue;
        }
        if !matches!(req.operator, Operator::Equals | Operator::In) {
            return Err(StorageError::BadRequest(format!(
                "only = and in are supported for {}, got {}",
                req.key, req.operator
            )));
        }
        match req.key.as_str() {
            FOLDER_LABEL => options.folders.extend(req.values.iter().cloned()),
            SORT_BY_LABEL => {
                for value in &req.values {
                    options.sort.push(SortBy::parse(value)?);
                }
            }
            _ => {
                if req.values.len() != 1 {
                    return Err(StorageError::BadRequest(format!(
                        "{LIST_DELETED_LABEL} takes a single value"
                    )));
                }
                options.include_deleted = match req.values[0].as_str() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(StorageError::BadRequest(format!(
                            "{LIST_DELETED_LABEL} must be true or false, got {other:?}"
                        )))
                    }
                };
            }
        }
    }
    Ok((options, rest))
}

/// What a watcher or list caller wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPredicate {
    pub labels: LabelSelector,
    /// Restrict to entities in any of these folders (empty means any).
    pub folders: Vec<String>,
    /// Restrict to a single name.
    pub name: Option<String>,
}

impl SelectionPredicate {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Build from a raw selector, pulling the folder out of reserved keys.
    pub fn from_selector(selector: &LabelSelector) -> Result<Self> {
        let (reserved, labels) = extract_reserved(selector)?;
        Ok(Self {
            labels,
            folders: reserved.folders,
            name: None,
        })
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.matches_fields(&entity.name, entity.folder(), entity.labels())
    }

    /// Match on the denormalized fields only; used before a full row is
    /// available.
    pub fn matches_fields(
        &self,
        name: &str,
        folder: &str,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        if let Some(wanted) = &self.name {
            if wanted != name {
                return false;
            }
        }
        if !self.folders.is_empty() && !self.folders.iter().any(|f| f == folder) {
            return false;
        }
        self.labels.matches(labels)
    }
}
