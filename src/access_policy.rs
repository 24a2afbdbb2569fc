//! Access policy rule normalisation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const VERB_ALL: &str = "*";
pub const VERB_READ: &str = "read";
pub const VERB_WRITE: &str = "write";
pub const TARGET_PERMISSIONS: &str = "permissions";

/// One grant: `verb` on `kind`, optionally narrowed to a `target`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessRule {
    pub kind: String,
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl AccessRule {
    pub fn new(kind: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            verb: verb.into(),
            target: None,
        }
    }

    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    fn grants_everything(&self) -> bool {
        self.verb == VERB_ALL
            || (self.verb == VERB_WRITE && self.target.as_deref() == Some(TARGET_PERMISSIONS))
    }
}

/// Collapse a rule set to its smallest equivalent form.
///
/// Per kind: a `*` verb, or `write` on `permissions`, becomes a single
/// `{kind, "*"}`. A `read` is dropped where a `write` on the same target
/// exists. The result is sorted, and reducing it again is a no-op.
pub fn reduce_rules(rules: &[AccessRule]) -> Vec<AccessRule> {
    let mut by_kind: BTreeMap<&str, Vec<&AccessRule>> = BTreeMap::new();
    for rule in rules {
        by_kind.entry(rule.kind.as_str()).or_default().push(rule);
    }

    let mut reduced = Vec::new();
    for (kind, rules) in by_kind {
        if rules.iter().any(|r| r.grants_everything()) {
            reduced.push(AccessRule::new(kind, VERB_ALL));
            continue;
        }

        let written: BTreeSet<Option<&str>> = rules
            .iter()
            .filter(|r| r.verb == VERB_WRITE)
            .map(|r| r.target.as_deref())
            .collect();
        let kept: BTreeSet<&AccessRule> = rules
            .into_iter()
            .filter(|r| !(r.verb == VERB_READ && written.contains(&r.target.as_deref())))
            .collect();
        reduced.extend(kept.into_iter().cloned());
    }
    reduced
}
