//! Label index rows.

use std::collections::BTreeMap;

use sea_query::{Expr, Query};

use super::db::Tx;
use super::schema::EntityLabels;
use crate::error::Result;

/// Index every label of a new entity.
pub async fn insert_labels(
    tx: &mut Tx,
    guid: &str,
    labels: &BTreeMap<String, String>,
) -> Result<()> {
    if labels.is_empty() {
        return Ok(());
    }
    let mut insert = Query::insert();
    insert
        .into_table(EntityLabels::Table)
        .columns([EntityLabels::Guid, EntityLabels::Label, EntityLabels::Value]);
    for (label, value) in labels {
        insert.values_panic([guid.into(), label.as_str().into(), value.as_str().into()]);
    }
    tx.execute(&insert).await?;
    Ok(())
}

/// Bring the index for `guid` from `old` to `new`.
///
/// Removed labels and labels whose value changed are deleted; new and
/// changed ones are inserted.
pub async fn update_labels(
    tx: &mut Tx,
    guid: &str,
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> Result<()> {
    let (stale, fresh) = diff_labels(old, new);
    if !stale.is_empty() {
        let delete = Query::delete()
            .from_table(EntityLabels::Table)
            .and_where(Expr::col(EntityLabels::Guid).eq(guid))
            .and_where(Expr::col(EntityLabels::Label).is_in(stale))
            .to_owned();
        tx.execute(&delete).await?;
    }
    insert_labels(tx, guid, &fresh).await
}

/// Drop all label rows of `guid`.
pub async fn delete_labels(tx: &mut Tx, guid: &str) -> Result<()> {
    let delete = Query::delete()
        .from_table(EntityLabels::Table)
        .and_where(Expr::col(EntityLabels::Guid).eq(guid))
        .to_owned();
    tx.execute(&delete).await?;
    Ok(())
}

/// Label names to delete and entries to insert.
pub(crate) fn diff_labels(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> (Vec<String>, BTreeMap<String, String>) {
    let stale = old
        .iter()
        .filter(|(k, v)| new.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    let fresh = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (stale, fresh)
}
