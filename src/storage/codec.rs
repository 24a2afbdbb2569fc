//! Mapping between [`Entity`] and table rows.
//!
//! Maps and lists are stored as JSON text columns. The meta column holds
//! the whole [`EntityMeta`]; labels, fields and folder/title/slug are
//! denormalized copies kept for querying.

use std::collections::BTreeMap;

use sea_query::{
    Expr, Iden, InsertStatement, Order, Query, SelectStatement, SimpleExpr, UpdateStatement,
};

use super::entity::{Action, Entity, EntityMeta};
use super::schema::{Entity as E, ENTITY_COLUMNS};
use crate::error::Result;

/// One row of `entity` or `entity_history`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntityRow {
    pub guid: String,
    pub key: String,
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub subresource: String,
    pub resource_version: i64,
    pub previous_version: i64,
    pub action: String,
    pub body: Vec<u8>,
    pub meta: String,
    pub status: Vec<u8>,
    pub folder: String,
    pub etag: String,
    pub labels: String,
    pub fields: String,
    pub errors: String,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: i64,
    pub updated_by: String,
}

impl EntityRow {
    pub fn into_entity(self) -> Result<Entity> {
        let mut meta: EntityMeta = decode_json_or_default(&self.meta)?;
        // Older rows may predate a meta field; the denormalized columns win
        // when the envelope is silent.
        if meta.labels.is_empty() {
            meta.labels = decode_json_or_default(&self.labels)?;
        }
        if meta.fields.is_empty() {
            meta.fields = decode_json_or_default(&self.fields)?;
        }
        if meta.folder.is_empty() {
            meta.folder = self.folder;
        }
        if meta.title.is_empty() {
            meta.title = self.title;
        }
        if meta.slug.is_empty() {
            meta.slug = self.slug;
        }
        if meta.description.is_empty() {
            meta.description = self.description;
        }
        Ok(Entity {
            group: self.group,
            resource: self.resource,
            namespace: self.namespace,
            name: self.name,
            subresource: self.subresource,
            guid: self.guid,
            resource_version: self.resource_version,
            previous_version: self.previous_version,
            action: Action::parse(&self.action),
            body: self.body,
            meta,
            status: self.status,
            errors: decode_json_or_default(&self.errors)?,
            etag: self.etag,
            created_at: self.created_at,
            created_by: self.created_by,
            updated_at: self.updated_at,
            updated_by: self.updated_by,
        })
    }
}

/// Decode a JSON column, treating empty and `null` as the default value.
pub fn decode_json_or_default<T>(raw: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(trimmed)?)
}

fn encode_map(map: &BTreeMap<String, String>) -> Result<String> {
    Ok(serde_json::to_string(map)?)
}

/// Column values for an insert, in [`ENTITY_COLUMNS`] order.
pub fn entity_values(entity: &Entity) -> Result<Vec<SimpleExpr>> {
    let meta = &entity.meta;
    Ok(vec![
        entity.guid.clone().into(),
        entity.key().to_string().into(),
        entity.group.clone().into(),
        entity.resource.clone().into(),
        entity.namespace.clone().into(),
        entity.name.clone().into(),
        entity.subresource.clone().into(),
        entity.resource_version.into(),
        entity.previous_version.into(),
        entity.action.as_str().into(),
        entity.body.clone().into(),
        serde_json::to_string(meta)?.into(),
        entity.status.clone().into(),
        meta.folder.clone().into(),
        entity.etag.clone().into(),
        encode_map(&meta.labels)?.into(),
        encode_map(&meta.fields)?.into(),
        serde_json::to_string(&entity.errors)?.into(),
        meta.title.clone().into(),
        meta.slug.clone().into(),
        meta.description.clone().into(),
        entity.created_at.into(),
        entity.created_by.clone().into(),
        entity.updated_at.into(),
        entity.updated_by.clone().into(),
    ])
}

/// `INSERT` of the full row into `table`.
pub fn insert_entity<T: Iden + 'static>(table: T, entity: &Entity) -> Result<InsertStatement> {
    Ok(Query::insert()
        .into_table(table)
        .columns(ENTITY_COLUMNS)
        .values_panic(entity_values(entity)?)
        .to_owned())
}

/// `UPDATE` of every mutable live-table column, keyed by guid.
pub fn update_entity(entity: &Entity) -> Result<UpdateStatement> {
    let values = entity_values(entity)?;
    let mut stmt = Query::update();
    stmt.table(E::Table);
    for (column, value) in ENTITY_COLUMNS.into_iter().zip(values) {
        if matches!(column, E::Guid | E::Key | E::CreatedAt | E::CreatedBy) {
            continue;
        }
        stmt.value(column, value);
    }
    stmt.and_where(Expr::col(E::Guid).eq(entity.guid.as_str()));
    Ok(stmt)
}

/// `SELECT` of all entity columns from `table`.
pub fn select_entity<T: Iden + 'static>(table: T) -> SelectStatement {
    Query::select()
        .columns(ENTITY_COLUMNS)
        .from(table)
        .to_owned()
}

/// History rows of one key, newest first.
pub fn select_history_for_key<T: Iden + 'static>(table: T, key: &str) -> SelectStatement {
    select_entity(table)
        .and_where(Expr::col(E::Key).eq(key))
        .order_by(E::ResourceVersion, Order::Desc)
        .to_owned()
}
