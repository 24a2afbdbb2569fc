//! Database schema definitions using sea-query.
//!
//! Table identifiers for type-safe query building, plus `migrate()` which
//! creates everything idempotently. On Postgres it also installs, or
//! removes, the history trigger that publishes change notifications.

use sea_query::{ColumnDef, Iden, Index, IndexCreateStatement, Table, TableCreateStatement};
use sha2::{Digest, Sha256};
use tracing::info;

use super::db::DbPool;
use super::dialect::Dialect;
use crate::error::{Result, StorageError};

/// Live entity table: the latest version of every key.
#[derive(Iden, Clone, Copy)]
pub enum Entity {
    Table,
    Guid,
    Key,
    Group,
    Resource,
    Namespace,
    Name,
    Subresource,
    ResourceVersion,
    PreviousVersion,
    Action,
    Body,
    Meta,
    Status,
    Folder,
    Etag,
    Labels,
    Fields,
    Errors,
    Title,
    Slug,
    Description,
    CreatedAt,
    CreatedBy,
    UpdatedAt,
    UpdatedBy,
}

/// Append-only history; same columns as [`Entity`].
#[derive(Iden, Clone, Copy)]
pub enum EntityHistory {
    Table,
}

/// Per-(group, resource) resource version counter.
#[derive(Iden, Clone, Copy)]
pub enum KindVersion {
    Table,
    Group,
    Resource,
    ResourceVersion,
    CreatedAt,
    UpdatedAt,
}

/// Label index.
#[derive(Iden, Clone, Copy)]
pub enum EntityLabels {
    Table,
    Guid,
    Label,
    Value,
}

/// Folder MPTT index.
#[derive(Iden, Clone, Copy)]
pub enum EntityFolder {
    Table,
    Guid,
    Namespace,
    Uid,
    ParentUid,
    Title,
    SlugPath,
    Depth,
    Lft,
    Rgt,
    Detached,
}

/// Columns shared by the live and history tables, in select order.
pub const ENTITY_COLUMNS: [Entity; 25] = [
    Entity::Guid,
    Entity::Key,
    Entity::Group,
    Entity::Resource,
    Entity::Namespace,
    Entity::Name,
    Entity::Subresource,
    Entity::ResourceVersion,
    Entity::PreviousVersion,
    Entity::Action,
    Entity::Body,
    Entity::Meta,
    Entity::Status,
    Entity::Folder,
    Entity::Etag,
    Entity::Labels,
    Entity::Fields,
    Entity::Errors,
    Entity::Title,
    Entity::Slug,
    Entity::Description,
    Entity::CreatedAt,
    Entity::CreatedBy,
    Entity::UpdatedAt,
    Entity::UpdatedBy,
];

fn entity_table<T: Iden + 'static>(table: T, history: bool) -> TableCreateStatement {
    let mut stmt = Table::create();
    stmt.table(table)
        .if_not_exists()
        .col(ColumnDef::new(Entity::Guid).string().not_null())
        .col(ColumnDef::new(Entity::Key).string().not_null())
        .col(ColumnDef::new(Entity::Group).string().not_null())
        .col(ColumnDef::new(Entity::Resource).string().not_null())
        .col(ColumnDef::new(Entity::Namespace).string().not_null())
        .col(ColumnDef::new(Entity::Name).string().not_null())
        .col(ColumnDef::new(Entity::Subresource).string().not_null().default(""))
        .col(ColumnDef::new(Entity::ResourceVersion).big_integer().not_null())
        .col(ColumnDef::new(Entity::PreviousVersion).big_integer().not_null().default(0))
        .col(ColumnDef::new(Entity::Action).string().not_null())
        .col(ColumnDef::new(Entity::Body).blob().not_null())
        .col(ColumnDef::new(Entity::Meta).text().not_null())
        .col(ColumnDef::new(Entity::Status).blob().not_null())
        .col(ColumnDef::new(Entity::Folder).string().not_null().default(""))
        .col(ColumnDef::new(Entity::Etag).string().not_null())
        .col(ColumnDef::new(Entity::Labels).text().not_null())
        .col(ColumnDef::new(Entity::Fields).text().not_null())
        .col(ColumnDef::new(Entity::Errors).text().not_null())
        .col(ColumnDef::new(Entity::Title).string().not_null().default(""))
        .col(ColumnDef::new(Entity::Slug).string().not_null().default(""))
        .col(ColumnDef::new(Entity::Description).text().not_null().default(""))
        .col(ColumnDef::new(Entity::CreatedAt).big_integer().not_null())
        .col(ColumnDef::new(Entity::CreatedBy).string().not_null())
        .col(ColumnDef::new(Entity::UpdatedAt).big_integer().not_null())
        .col(ColumnDef::new(Entity::UpdatedBy).string().not_null());
    if history {
        stmt.primary_key(
            Index::create()
                .col(Entity::Key)
                .col(Entity::ResourceVersion),
        );
    } else {
        stmt.primary_key(Index::create().col(Entity::Guid));
    }
    stmt.to_owned()
}

fn tables() -> Vec<TableCreateStatement> {
    vec![
        entity_table(Entity::Table, false),
        entity_table(EntityHistory::Table, true),
        Table::create()
            .table(KindVersion::Table)
            .if_not_exists()
            .col(ColumnDef::new(KindVersion::Group).string().not_null())
            .col(ColumnDef::new(KindVersion::Resource).string().not_null())
            .col(ColumnDef::new(KindVersion::ResourceVersion).big_integer().not_null())
            .col(ColumnDef::new(KindVersion::CreatedAt).big_integer().not_null())
            .col(ColumnDef::new(KindVersion::UpdatedAt).big_integer().not_null())
            .primary_key(
                Index::create()
                    .col(KindVersion::Group)
                    .col(KindVersion::Resource),
            )
            .to_owned(),
        Table::create()
            .table(EntityLabels::Table)
            .if_not_exists()
            .col(ColumnDef::new(EntityLabels::Guid).string().not_null())
            .col(ColumnDef::new(EntityLabels::Label).string().not_null())
            .col(ColumnDef::new(EntityLabels::Value).string().not_null())
            .primary_key(
                Index::create()
                    .col(EntityLabels::Guid)
                    .col(EntityLabels::Label),
            )
            .to_owned(),
        Table::create()
            .table(EntityFolder::Table)
            .if_not_exists()
            .col(ColumnDef::new(EntityFolder::Guid).string().not_null().primary_key())
            .col(ColumnDef::new(EntityFolder::Namespace).string().not_null())
            .col(ColumnDef::new(EntityFolder::Uid).string().not_null())
            .col(ColumnDef::new(EntityFolder::ParentUid).string().not_null())
            .col(ColumnDef::new(EntityFolder::Title).string().not_null())
            .col(ColumnDef::new(EntityFolder::SlugPath).text().not_null())
            .col(ColumnDef::new(EntityFolder::Depth).big_integer().not_null())
            .col(ColumnDef::new(EntityFolder::Lft).big_integer().not_null())
            .col(ColumnDef::new(EntityFolder::Rgt).big_integer().not_null())
            .col(ColumnDef::new(EntityFolder::Detached).boolean().not_null())
            .to_owned(),
    ]
}

fn indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .if_not_exists()
            .name("uq_entity_key")
            .table(Entity::Table)
            .col(Entity::Key)
            .unique()
            .to_owned(),
        Index::create()
            .if_not_exists()
            .name("idx_entity_list")
            .table(Entity::Table)
            .col(Entity::Group)
            .col(Entity::Resource)
            .col(Entity::Namespace)
            .col(Entity::Name)
            .to_owned(),
        Index::create()
            .if_not_exists()
            .name("idx_entity_history_rv")
            .table(EntityHistory::Table)
            .col(Entity::Group)
            .col(Entity::Resource)
            .col(Entity::ResourceVersion)
            .to_owned(),
        Index::create()
            .if_not_exists()
            .name("idx_entity_history_guid")
            .table(EntityHistory::Table)
            .col(Entity::Guid)
            .col(Entity::ResourceVersion)
            .to_owned(),
        Index::create()
            .if_not_exists()
            .name("idx_entity_labels_value")
            .table(EntityLabels::Table)
            .col(EntityLabels::Label)
            .col(EntityLabels::Value)
            .to_owned(),
        Index::create()
            .if_not_exists()
            .name("idx_entity_folder_tree")
            .table(EntityFolder::Table)
            .col(EntityFolder::Namespace)
            .col(EntityFolder::Lft)
            .to_owned(),
    ]
}

/// Longest accepted notification channel prefix.
pub const MAX_CHANNEL_PREFIX_LEN: usize = 31;

/// Hex characters of the namespace digest appended to the prefix. Together
/// with the prefix this stays within the 63 byte identifier limit.
const CHANNEL_DIGEST_LEN: usize = 32;

/// Postgres rejects notification payloads of 8000 bytes or more.
const MAX_PAYLOAD_BYTES: usize = 8000;

/// Reject prefixes that would not yield a valid, bounded channel name.
pub fn validate_channel_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || prefix.len() > MAX_CHANNEL_PREFIX_LEN {
        return Err(StorageError::BadRequest(format!(
            "channel prefix must be 1 to {MAX_CHANNEL_PREFIX_LEN} bytes, got {prefix:?}"
        )));
    }
    if !prefix.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(StorageError::BadRequest(format!(
            "channel prefix {prefix:?} may only contain letters, digits and '_'"
        )));
    }
    Ok(())
}

/// Notification channel for a namespace: the prefix plus a digest of the
/// namespace, so any namespace maps to a name of bounded length.
///
/// The trigger computes the same name in SQL.
pub fn notify_channel(prefix: &str, namespace: &str) -> String {
    let digest = hex::encode(Sha256::digest(namespace.as_bytes()));
    format!("{prefix}{}", &digest[..CHANNEL_DIGEST_LEN])
}

/// Postgres trigger publishing one notification per history insert.
///
/// The payload carries enough fields for a listener to decide relevance
/// without a round trip; `labels` is sent as a JSON string. When labels or
/// folder would push the payload over the size limit both are sent as null
/// and the listener relies on the history row it loads anyway.
pub fn notify_trigger_sql(channel_prefix: &str) -> String {
    let prefix = channel_prefix.replace('\'', "''");
    format!(
        r#"
CREATE OR REPLACE FUNCTION sqlstash_notify_history() RETURNS trigger AS $$
DECLARE
    channel text;
    payload text;
BEGIN
    channel := '{prefix}' || left(encode(sha256(convert_to(NEW."namespace", 'UTF8')), 'hex'), {CHANNEL_DIGEST_LEN});
    payload := json_build_object(
        'guid', NEW."guid",
        'group', NEW."group",
        'resource', NEW."resource",
        'name', NEW."name",
        'namespace', NEW."namespace",
        'resource_version', NEW."resource_version",
        'folder', NEW."folder",
        'labels', NEW."labels"
    )::text;
    IF octet_length(payload) >= {MAX_PAYLOAD_BYTES} THEN
        payload := json_build_object(
            'guid', NEW."guid",
            'group', NEW."group",
            'resource', NEW."resource",
            'name', NEW."name",
            'namespace', NEW."namespace",
            'resource_version', NEW."resource_version",
            'folder', NULL,
            'labels', NULL
        )::text;
    END IF;
    PERFORM pg_notify(channel, payload);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS sqlstash_history_notify ON "entity_history";
CREATE TRIGGER sqlstash_history_notify
    AFTER INSERT ON "entity_history"
    FOR EACH ROW EXECUTE FUNCTION sqlstash_notify_history();
"#
    )
}

/// Removes the trigger left behind by an earlier notify deployment.
const DROP_NOTIFY_TRIGGER_SQL: &str = r#"
DROP TRIGGER IF EXISTS sqlstash_history_notify ON "entity_history";
DROP FUNCTION IF EXISTS sqlstash_notify_history();
"#;

/// Create tables and indexes if missing.
///
/// On Postgres, `notify_prefix` decides the history trigger: with a prefix
/// it is installed, without one it is removed so writes pay no
/// notification cost.
pub async fn migrate(db: &DbPool, notify_prefix: Option<&str>) -> Result<()> {
    if let Some(prefix) = notify_prefix {
        validate_channel_prefix(prefix)?;
    }
    let dialect = db.dialect();
    for table in tables() {
        db.execute_raw(&dialect.build_schema(&table)).await?;
    }
    for index in indexes() {
        db.execute_raw(&dialect.build_schema(&index)).await?;
    }
    if dialect == Dialect::Postgres {
        match notify_prefix {
            Some(prefix) => db.execute_raw(&notify_trigger_sql(prefix)).await?,
            None => db.execute_raw(DROP_NOTIFY_TRIGGER_SQL).await?,
        };
    }
    info!(
        driver = dialect.name(),
        notify = notify_prefix.is_some(),
        "schema ready"
    );
    Ok(())
}
