//! Per-(group, resource) resource version counter.
//!
//! Every write takes the next value from its kind's counter inside the
//! writer's transaction. The locked read serializes writers of the same
//! kind until commit, so versions are issued gapless and in commit order.

use sea_query::{Alias, Expr, OnConflict, Order, Query, SelectStatement};
use tracing::debug;

use super::db::{DbPool, Tx};
use super::schema::{Entity as E, KindVersion};
use crate::error::{is_unique_violation, Result, StorageError};

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    resource_version: i64,
}

/// Latest issued version of one kind.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct KindVersionRow {
    pub group: String,
    pub resource: String,
    pub resource_version: i64,
}

/// Live object count of one kind in one namespace.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ResourceStats {
    pub namespace: String,
    pub group: String,
    pub resource: String,
    pub count: i64,
    /// Latest version of the kind.
    pub resource_version: i64,
}

/// Issue the next resource version for `(group, resource)`.
///
/// The first write of a kind lazily creates its row at 1. When two
/// writers race on that insert, the loser re-runs the locked read once
/// and increments the winner's row.
pub async fn next_version(tx: &mut Tx, group: &str, resource: &str, now: i64) -> Result<i64> {
    if let Some(version) = increment_existing(tx, group, resource, now).await? {
        return Ok(version);
    }

    let insert = Query::insert()
        .into_table(KindVersion::Table)
        .columns([
            KindVersion::Group,
            KindVersion::Resource,
            KindVersion::ResourceVersion,
            KindVersion::CreatedAt,
            KindVersion::UpdatedAt,
        ])
        .values_panic([
            group.into(),
            resource.into(),
            1i64.into(),
            now.into(),
            now.into(),
        ])
        .on_conflict(
            OnConflict::columns([KindVersion::Group, KindVersion::Resource])
                .do_nothing()
                .to_owned(),
        )
        .to_owned();

    let inserted = match tx.execute(&insert).await {
        Ok(rows) => rows,
        Err(StorageError::Database(e)) if is_unique_violation(&e) => 0,
        Err(e) => return Err(e),
    };
    if inserted == 1 {
        debug!(group, resource, "initialized resource version counter");
        return Ok(1);
    }

    // Someone else initialized the counter between our read and insert.
    increment_existing(tx, group, resource, now)
        .await?
        .ok_or_else(|| {
            StorageError::BackendUnavailable(format!(
                "resource version counter for {group}/{resource} vanished"
            ))
        })
}

async fn increment_existing(
    tx: &mut Tx,
    group: &str,
    resource: &str,
    now: i64,
) -> Result<Option<i64>> {
    let dialect = tx.dialect();
    let mut select = Query::select()
        .column(KindVersion::ResourceVersion)
        .from(KindVersion::Table)
        .and_where(Expr::col(KindVersion::Group).eq(group))
        .and_where(Expr::col(KindVersion::Resource).eq(resource))
        .to_owned();
    dialect.lock_for_update(&mut select);

    let Some(row) = tx.fetch_optional::<VersionRow, _>(&select).await? else {
        return Ok(None);
    };
    let next = row.resource_version + 1;

    let update = Query::update()
        .table(KindVersion::Table)
        .value(KindVersion::ResourceVersion, next)
        .value(KindVersion::UpdatedAt, now)
        .and_where(Expr::col(KindVersion::Group).eq(group))
        .and_where(Expr::col(KindVersion::Resource).eq(resource))
        .to_owned();
    tx.execute(&update).await?;
    Ok(Some(next))
}

/// Latest version of one kind without locking; 0 when nothing was written.
pub async fn current_version(db: &DbPool, group: &str, resource: &str) -> Result<i64> {
    let select = Query::select()
        .column(KindVersion::ResourceVersion)
        .from(KindVersion::Table)
        .and_where(Expr::col(KindVersion::Group).eq(group))
        .and_where(Expr::col(KindVersion::Resource).eq(resource))
        .to_owned();
    Ok(db
        .fetch_optional::<VersionRow, _>(&select)
        .await?
        .map(|row| row.resource_version)
        .unwrap_or(0))
}

/// Every counter row.
pub async fn latest_versions(db: &DbPool) -> Result<Vec<KindVersionRow>> {
    let select = Query::select()
        .columns([
            KindVersion::Group,
            KindVersion::Resource,
            KindVersion::ResourceVersion,
        ])
        .from(KindVersion::Table)
        .to_owned();
    db.fetch_all(&select).await
}

fn stats_query(namespace: Option<&str>, min_count: i64) -> SelectStatement {
    let count = Expr::col((E::Table, E::Guid)).count();
    let mut select = Query::select();
    select
        .column((E::Table, E::Namespace))
        .column((E::Table, E::Group))
        .column((E::Table, E::Resource))
        .expr_as(count.clone(), Alias::new("count"))
        .expr_as(
            Expr::col((KindVersion::Table, KindVersion::ResourceVersion)).max(),
            Alias::new("resource_version"),
        )
        .from(E::Table)
        .inner_join(
            KindVersion::Table,
            Expr::col((KindVersion::Table, KindVersion::Group))
                .equals((E::Table, E::Group))
                .and(
                    Expr::col((KindVersion::Table, KindVersion::Resource))
                        .equals((E::Table, E::Resource)),
                ),
        )
        .and_where(Expr::col((E::Table, E::Subresource)).eq(""));
    if let Some(ns) = namespace {
        select.and_where(Expr::col((E::Table, E::Namespace)).eq(ns));
    }
    select
        .group_by_col((E::Table, E::Namespace))
        .group_by_col((E::Table, E::Group))
        .group_by_col((E::Table, E::Resource))
        .and_having(Expr::expr(count).gt(min_count))
        .order_by((E::Table, E::Namespace), Order::Asc)
        .order_by((E::Table, E::Group), Order::Asc)
        .order_by((E::Table, E::Resource), Order::Asc);
    select
}

/// Live object counts per namespace and kind, keeping only rows with more
/// than `min_count` objects.
pub async fn resource_stats(
    db: &DbPool,
    namespace: Option<&str>,
    min_count: i64,
) -> Result<Vec<ResourceStats>> {
    db.fetch_all(&stats_query(namespace, min_count)).await
}
