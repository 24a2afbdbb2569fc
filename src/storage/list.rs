//! List requests, continuation tokens and the list queries.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sea_query::{Alias, Cond, Expr, Order, Query, SelectStatement};
use serde::{Deserialize, Serialize};

use super::codec::select_entity;
use super::entity::Entity;
use super::key::KeyPrefix;
use super::schema::{Entity as E, EntityHistory, EntityLabels, ENTITY_COLUMNS};
use super::selector::{extract_reserved, LabelSelector, SortBy, SortColumn};
use crate::error::{Result, StorageError};

/// Page size used when the caller does not set one.
pub const DEFAULT_LIMIT: u32 = 500;

/// A paged list over the live table, the trash, or the kind as it was at
/// an earlier version.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: KeyPrefix,
    pub selector: LabelSelector,
    /// Maximum items per page; 0 means [`DEFAULT_LIMIT`].
    pub limit: u32,
    /// Opaque token from the previous page.
    pub continue_token: String,
    /// List the kind as of this version; 0 lists the latest state.
    pub resource_version: i64,
}

impl ListRequest {
    pub fn new(prefix: KeyPrefix) -> Self {
        Self {
            prefix,
            ..Default::default()
        }
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn continuing(mut self, token: impl Into<String>) -> Self {
        self.continue_token = token.into();
        self
    }

    pub fn at_version(mut self, resource_version: i64) -> Self {
        self.resource_version = resource_version;
        self
    }

    pub fn effective_limit(&self) -> u64 {
        if self.limit == 0 {
            DEFAULT_LIMIT as u64
        } else {
            self.limit as u64
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, Default)]
pub struct ListResponse {
    pub items: Vec<Entity>,
    /// Empty on the last page.
    pub next_page_token: String,
    /// Kind version read before the items, or the requested version when
    /// listing at a revision. A watch started from here misses nothing.
    pub resource_version: i64,
}

/// Resume point encoded into the continuation token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueToken {
    /// First row of the next page under name ordering.
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Rows to skip under explicit sort ordering.
    #[serde(default)]
    pub offset: u64,
    /// Version a revision list is pinned to.
    #[serde(default, skip_serializing_if = "is_latest")]
    pub resource_version: i64,
}

fn is_latest(resource_version: &i64) -> bool {
    *resource_version == 0
}

impl ContinueToken {
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &str) -> Result<Option<Self>> {
        if raw.is_empty() {
            return Ok(None);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| StorageError::BadRequest("malformed continue token".to_string()))?;
        let token = serde_json::from_slice(&bytes)
            .map_err(|_| StorageError::BadRequest("malformed continue token".to_string()))?;
        Ok(Some(token))
    }
}

/// A list request resolved into query parameters.
#[derive(Debug, Clone)]
pub struct ListPlan {
    pub prefix: KeyPrefix,
    pub folders: Vec<String>,
    pub sort: Vec<SortBy>,
    pub include_deleted: bool,
    pub labels: LabelSelector,
    pub limit: u64,
    pub token: Option<ContinueToken>,
    /// Pinned version; 0 for the latest state.
    pub resource_version: i64,
}

impl ListPlan {
    pub fn from_request(req: &ListRequest) -> Result<Self> {
        let (reserved, labels) = extract_reserved(&req.selector)?;
        let token = ContinueToken::decode(&req.continue_token)?;
        let resource_version = pinned_version(req.resource_version, token.as_ref())?;
        if resource_version > 0 && reserved.include_deleted {
            return Err(StorageError::BadRequest(
                "deleted objects cannot be listed at a resource version".to_string(),
            ));
        }
        Ok(Self {
            prefix: req.prefix.clone(),
            folders: reserved.folders,
            sort: reserved.sort,
            include_deleted: reserved.include_deleted,
            labels,
            limit: req.effective_limit(),
            token,
            resource_version,
        })
    }

    /// True when the plan reads history rather than the live table.
    pub fn reads_history(&self) -> bool {
        self.include_deleted || self.resource_version > 0
    }

    fn sorted_by_name(&self) -> bool {
        self.sort.is_empty()
    }

    /// Token for the next page, given the row that overflowed this one.
    pub fn next_token(&self, overflow: &Entity) -> Result<String> {
        let token = if self.sorted_by_name() {
            ContinueToken {
                name: overflow.name.clone(),
                namespace: overflow.namespace.clone(),
                offset: 0,
                resource_version: self.resource_version,
            }
        } else {
            let offset = self.token.as_ref().map(|t| t.offset).unwrap_or(0);
            ContinueToken {
                offset: offset + self.limit,
                resource_version: self.resource_version,
                ..Default::default()
            }
        };
        token.encode()
    }

    /// Query over the live table, fetching one row past the limit.
    pub fn live_query(&self) -> SelectStatement {
        let mut select = select_entity(E::Table);
        select
            .and_where(Expr::col(E::Group).eq(self.prefix.group.as_str()))
            .and_where(Expr::col(E::Resource).eq(self.prefix.resource.as_str()))
            .and_where(Expr::col(E::Subresource).eq(""));
        if let Some(ns) = &self.prefix.namespace {
            select.and_where(Expr::col(E::Namespace).eq(ns.as_str()));
        }
        if let Some(name) = &self.prefix.name {
            select.and_where(Expr::col(E::Name).eq(name.as_str()));
        }
        if !self.folders.is_empty() {
            select.and_where(Expr::col(E::Folder).is_in(self.folders.iter().map(String::as_str)));
        }
        for (label, value) in self.labels.equality_pairs() {
            select.and_where(
                Expr::col(E::Guid).in_subquery(
                    Query::select()
                        .column(EntityLabels::Guid)
                        .from(EntityLabels::Table)
                        .and_where(Expr::col(EntityLabels::Label).eq(label))
                        .and_where(Expr::col(EntityLabels::Value).eq(value))
                        .to_owned(),
                ),
            );
        }
        self.apply_order_and_page(&mut select);
        select
    }

    /// Latest `Deleted` history row of keys with no live row.
    ///
    /// Labels are not indexed for history rows, so the caller filters and
    /// pages these in memory.
    pub fn trash_query(&self) -> SelectStatement {
        let live_keys = Query::select()
            .column(E::Key)
            .from(E::Table)
            .to_owned();
        let mut select = self.history_query(None);
        select
            .and_where(Expr::col((history_alias(), E::Action)).eq("deleted"))
            .and_where(Expr::col((history_alias(), E::Key)).not_in_subquery(live_keys));
        select
    }

    /// The newest history row of every key at or before the pinned
    /// version, skipping keys whose row at that point was a delete.
    ///
    /// Paged in memory like the trash.
    pub fn revision_query(&self) -> SelectStatement {
        let mut select = self.history_query(Some(self.resource_version));
        select.and_where(Expr::col((history_alias(), E::Action)).ne("deleted"));
        select
    }

    fn history_query(&self, at: Option<i64>) -> SelectStatement {
        let h = history_alias();
        let mut latest = Query::select();
        latest
            .expr(Expr::col((EntityHistory::Table, E::ResourceVersion)).max())
            .from(EntityHistory::Table)
            .and_where(Expr::col((EntityHistory::Table, E::Key)).equals((h.clone(), E::Key)));
        if let Some(rv) = at {
            latest.and_where(Expr::col((EntityHistory::Table, E::ResourceVersion)).lte(rv));
        }

        let mut select = Query::select();
        select
            .columns(ENTITY_COLUMNS.map(|c| (h.clone(), c)))
            .from_as(EntityHistory::Table, h.clone())
            .and_where(Expr::col((h.clone(), E::Group)).eq(self.prefix.group.as_str()))
            .and_where(Expr::col((h.clone(), E::Resource)).eq(self.prefix.resource.as_str()))
            .and_where(Expr::col((h.clone(), E::Subresource)).eq(""))
            .and_where(Expr::col((h.clone(), E::ResourceVersion)).in_subquery(latest));
        if let Some(ns) = &self.prefix.namespace {
            select.and_where(Expr::col((h.clone(), E::Namespace)).eq(ns.as_str()));
        }
        if let Some(name) = &self.prefix.name {
            select.and_where(Expr::col((h.clone(), E::Name)).eq(name.as_str()));
        }
        if !self.folders.is_empty() {
            select.and_where(
                Expr::col((h.clone(), E::Folder)).is_in(self.folders.iter().map(String::as_str)),
            );
        }
        for sort in &self.sort {
            select.order_by((h.clone(), sort_column(sort.column)), order(sort));
        }
        select
            .order_by((h.clone(), E::Name), Order::Asc)
            .order_by((h, E::Namespace), Order::Asc);
        select
    }

    /// Page an already ordered history result in memory, applying the
    /// label selector first.
    pub fn page_in_memory(&self, mut rows: Vec<Entity>) -> Result<(Vec<Entity>, String)> {
        rows.retain(|e| self.labels.matches(e.labels()));
        let start = match &self.token {
            None => 0,
            Some(t) if self.sorted_by_name() => rows
                .iter()
                .position(|e| {
                    (e.name.as_str(), e.namespace.as_str())
                        >= (t.name.as_str(), t.namespace.as_str())
                })
                .unwrap_or(rows.len()),
            Some(t) => (t.offset as usize).min(rows.len()),
        };
        let mut page: Vec<Entity> = rows
            .into_iter()
            .skip(start)
            .take(self.limit as usize + 1)
            .collect();
        let token = if page.len() as u64 > self.limit {
            let overflow = page.pop();
            match overflow {
                Some(row) => self.next_token(&row)?,
                None => String::new(),
            }
        } else {
            String::new()
        };
        Ok((page, token))
    }

    fn apply_order_and_page(&self, select: &mut SelectStatement) {
        if self.sorted_by_name() {
            if let Some(token) = &self.token {
                select.cond_where(
                    Cond::any()
                        .add(Expr::col(E::Name).gt(token.name.as_str()))
                        .add(
                            Cond::all()
                                .add(Expr::col(E::Name).eq(token.name.as_str()))
                                .add(Expr::col(E::Namespace).gte(token.namespace.as_str())),
                        ),
                );
            }
        } else {
            for sort in &self.sort {
                select.order_by(sort_column(sort.column), order(sort));
            }
            if let Some(token) = &self.token {
                select.offset(token.offset);
            }
        }
        select
            .order_by(E::Name, Order::Asc)
            .order_by(E::Namespace, Order::Asc)
            .limit(self.limit + 1);
    }
}

fn history_alias() -> Alias {
    Alias::new("h")
}

/// Reconcile the requested version with the one a continue token carries.
fn pinned_version(requested: i64, token: Option<&ContinueToken>) -> Result<i64> {
    if requested < 0 {
        return Err(StorageError::BadRequest(format!(
            "invalid resource version {requested}"
        )));
    }
    let carried = token.map(|t| t.resource_version).unwrap_or(0);
    match (requested, carried) {
        (0, carried) => Ok(carried),
        (requested, carried) if token.is_none() || requested == carried => Ok(requested),
        (requested, carried) => Err(StorageError::BadRequest(format!(
            "resource version {requested} does not match continue token version {carried}"
        ))),
    }
}

fn sort_column(column: SortColumn) -> E {
    match column {
        SortColumn::Name => E::Name,
        SortColumn::Title => E::Title,
        SortColumn::CreatedAt => E::CreatedAt,
        SortColumn::UpdatedAt => E::UpdatedAt,
        SortColumn::ResourceVersion => E::ResourceVersion,
    }
}

fn order(sort: &SortBy) -> Order {
    if sort.descending {
        Order::Desc
    } else {
        Order::Asc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dialect::Dialect;
    use crate::storage::selector::{Requirement, FOLDER_LABEL, LIST_DELETED_LABEL, SORT_BY_LABEL};

    fn entity(name: &str) -> Entity {
        Entity {
            name: name.into(),
            namespace: "ns".into(),
            guid: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_token_round_trip_and_rejects_garbage() {
        let token = ContinueToken {
            name: "b".into(),
            namespace: "ns".into(),
            offset: 0,
            resource_version: 0,
        };
        let raw = token.encode().unwrap();
        assert_eq!(ContinueToken::decode(&raw).unwrap(), Some(token));
        assert_eq!(ContinueToken::decode("").unwrap(), None);
        assert!(matches!(
            ContinueToken::decode("%%%"),
            Err(StorageError::BadRequest(_))
        ));
    }

    #[test]
    fn test_live_query_pushes_filters() {
        let req = ListRequest::new(KeyPrefix::kind("g", "widgets").in_namespace("ns"))
            .with_selector(
                LabelSelector::everything()
                    .with(Requirement::equals("env", "prod"))
                    .with(Requirement::equals(FOLDER_LABEL, "f1")),
            )
            .with_limit(2);
        let plan = ListPlan::from_request(&req).unwrap();
        let sql = Dialect::Sqlite.build(&plan.live_query()).text;

        assert!(sql.contains("\"entity_labels\""));
        assert!(sql.contains("\"folder\" IN"));
        assert!(sql.contains("ORDER BY \"name\" ASC"));
        assert!(sql.ends_with("LIMIT ?"));
    }

    #[test]
    fn test_sorted_plan_pages_by_offset() {
        let req = ListRequest::new(KeyPrefix::kind("g", "widgets"))
            .with_selector(
                LabelSelector::everything().with(Requirement::equals(SORT_BY_LABEL, "-title")),
            )
            .with_limit(10);
        let plan = ListPlan::from_request(&req).unwrap();
        let raw = plan.next_token(&entity("x")).unwrap();
        let token = ContinueToken::decode(&raw).unwrap().unwrap();
        assert_eq!(token.offset, 10);

        let next = ListPlan::from_request(&req.clone().continuing(raw)).unwrap();
        let sql = Dialect::Postgres.build(&next.live_query()).text;
        assert!(sql.contains("ORDER BY \"title\" DESC"));
        assert!(sql.contains("OFFSET"));
    }

    #[test]
    fn test_page_in_memory() {
        let req = ListRequest::new(KeyPrefix::kind("g", "widgets")).with_limit(2);
        let plan = ListPlan::from_request(&req).unwrap();
        let rows = vec![entity("a"), entity("b"), entity("c")];

        let (page, token) = plan.page_in_memory(rows.clone()).unwrap();
        assert_eq!(page.len(), 2);
        assert!(!token.is_empty());

        let next = ListPlan::from_request(&req.continuing(token)).unwrap();
        let (page, token) = next.page_in_memory(rows).unwrap();
        assert_eq!(page.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(), vec!["c"]);
        assert!(token.is_empty());
    }

    #[test]
    fn test_revision_token_carries_version() {
        let req = ListRequest::new(KeyPrefix::kind("g", "widgets"))
            .with_limit(1)
            .at_version(4);
        let plan = ListPlan::from_request(&req).unwrap();
        assert!(plan.reads_history());
        let raw = plan.next_token(&entity("b")).unwrap();
        assert_eq!(ContinueToken::decode(&raw).unwrap().unwrap().resource_version, 4);

        // The token alone pins the version.
        let next = ListPlan::from_request(
            &ListRequest::new(KeyPrefix::kind("g", "widgets")).continuing(raw.clone()),
        )
        .unwrap();
        assert_eq!(next.resource_version, 4);

        let err = ListPlan::from_request(&req.clone().at_version(5).continuing(raw)).unwrap_err();
        assert!(matches!(err, StorageError::BadRequest(_)));
    }

    #[test]
    fn test_revision_plan_rejects_bad_versions() {
        let prefix = KeyPrefix::kind("g", "widgets");
        assert!(matches!(
            ListPlan::from_request(&ListRequest::new(prefix.clone()).at_version(-1)),
            Err(StorageError::BadRequest(_))
        ));
        let trash = ListRequest::new(prefix)
            .with_selector(
                LabelSelector::everything().with(Requirement::equals(LIST_DELETED_LABEL, "true")),
            )
            .at_version(3);
        assert!(matches!(
            ListPlan::from_request(&trash),
            Err(StorageError::BadRequest(_))
        ));
    }

    #[test]
    fn test_revision_query_bounds_history() {
        let req = ListRequest::new(KeyPrefix::kind("g", "widgets").in_namespace("ns"))
            .at_version(7);
        let plan = ListPlan::from_request(&req).unwrap();
        let sql = Dialect::Postgres.build(&plan.revision_query()).text;
        assert!(sql.contains("MAX(\"entity_history\".\"resource_version\")"));
        assert!(sql.contains("\"entity_history\".\"resource_version\" <= $"));
        assert!(sql.contains("\"h\".\"action\" <> $"));
        assert!(!sql.contains("NOT IN"));
    }
}
