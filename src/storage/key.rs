//! Entity keys.
//!
//! A key is `/<group>/<resource>/<namespace>/<name>[/<subresource>]`.
//! The namespace segment may be empty for cluster-scoped resources.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StorageError};

const MAX_SEGMENT_LEN: usize = 253;

/// Parsed, validated entity key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub subresource: String,
}

impl Key {
    pub fn new(
        group: impl Into<String>,
        resource: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            group: group.into(),
            resource: resource.into(),
            namespace: namespace.into(),
            name: name.into(),
            subresource: String::new(),
        };
        key.validate()?;
        Ok(key)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| StorageError::InvalidKey(format!("{raw:?} must start with '/'")))?;
        let parts: Vec<&str> = rest.split('/').collect();
        if !(4..=5).contains(&parts.len()) {
            return Err(StorageError::InvalidKey(format!(
                "{raw:?} must have 4 or 5 segments"
            )));
        }
        let key = Self {
            group: parts[0].to_string(),
            resource: parts[1].to_string(),
            namespace: parts[2].to_string(),
            name: parts[3].to_string(),
            subresource: parts.get(4).copied().unwrap_or_default().to_string(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Check every segment; keys built with struct literals skip this.
    pub fn validate(&self) -> Result<()> {
        validate_segment("group", &self.group, true)?;
        validate_segment("resource", &self.resource, true)?;
        validate_segment("namespace", &self.namespace, false)?;
        validate_segment("name", &self.name, true)?;
        validate_segment("subresource", &self.subresource, false)?;
        Ok(())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            self.group, self.resource, self.namespace, self.name
        )?;
        if !self.subresource.is_empty() {
            write!(f, "/{}", self.subresource)?;
        }
        Ok(())
    }
}

impl FromStr for Key {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Key::parse(s)
    }
}

fn validate_segment(what: &str, value: &str, required: bool) -> Result<()> {
    if value.is_empty() {
        if required {
            return Err(StorageError::InvalidKey(format!("{what} is required")));
        }
        return Ok(());
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(StorageError::InvalidKey(format!(
            "{what} longer than {MAX_SEGMENT_LEN} characters"
        )));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !valid {
        return Err(StorageError::InvalidKey(format!(
            "{what} {value:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Scope of a list or watch: a kind, optionally narrowed to a namespace
/// and a single name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPrefix {
    pub group: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl KeyPrefix {
    pub fn kind(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            namespace: None,
            name: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Parse `/<group>/<resource>[/<namespace>[/<name>]]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| StorageError::InvalidKey(format!("{raw:?} must start with '/'")))?;
        let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(StorageError::InvalidKey(format!(
                "{raw:?} is not a valid key prefix"
            )));
        }
        validate_segment("group", parts[0], true)?;
        validate_segment("resource", parts[1], true)?;
        let namespace = parts.get(2).map(|ns| ns.to_string());
        if let Some(ns) = &namespace {
            validate_segment("namespace", ns, false)?;
        }
        let name = parts.get(3).map(|n| n.to_string());
        if let Some(n) = &name {
            validate_segment("name", n, true)?;
        }
        Ok(Self {
            group: parts[0].to_string(),
            resource: parts[1].to_string(),
            namespace,
            name,
        })
    }

    /// True when `key` falls inside this prefix.
    pub fn contains(&self, key: &Key) -> bool {
        self.matches(&key.group, &key.resource, &key.namespace, &key.name)
    }

    pub fn matches(&self, group: &str, resource: &str, namespace: &str, name: &str) -> bool {
        self.group == group
            && self.resource == resource
            && self.namespace.as_deref().map_or(true, |ns| ns == namespace)
            && self.name.as_deref().map_or(true, |n| n == name)
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.group, self.resource)?;
        if let Some(ns) = &self.namespace {
            write!(f, "/{ns}")?;
            if let Some(name) = &self.name {
                write!(f, "/{name}")?;
            }
        }
        Ok(())
    }
}
