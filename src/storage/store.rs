//! Entity store: transactional writes, reads, lists and history.
//!
//! Every write runs in one transaction that touches, in order: the label
//! index, the kind's version counter, the live row, the history log and,
//! for folder writes, the namespace's folder index. The counter bump comes
//! as late as possible so its row lock is held briefly.

use std::time::{Duration, Instant};

use backon::Retryable;
use sea_query::{Expr, Order, Query};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::{insert_entity, select_entity, select_history_for_key, update_entity, EntityRow};
use super::db::{DbPool, Tx};
use super::dialect::Dialect;
use super::entity::{
    compute_etag, Action, Entity, EntityVersionInfo, WriteRequest, WriteResult, WriteStatus,
};
use super::folder::{self, FolderIndex};
use super::key::Key;
use super::labels;
use super::maintenance::{self, PruneQueue};
use super::list::{ListPlan, ListRequest, ListResponse};
use super::resource_version::{self, KindVersionRow, ResourceStats};
use super::schema::{self, Entity as E, EntityHistory};
use crate::config::{Config, FolderConfig, HistoryConfig, WatchStrategy};
use crate::error::{is_unique_violation, Result, StorageError};
use crate::utils::metrics::StorageMetrics;
use crate::utils::retry::{connect_backoff, is_retryable};

/// Delete request.
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    pub key: Key,
    /// Expected current version; empty skips the check.
    pub previous_version: String,
    pub actor: String,
}

impl DeleteRequest {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            ..Default::default()
        }
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

/// The storage engine.
#[derive(Clone, Debug)]
pub struct EntityStore {
    db: DbPool,
    folders: FolderConfig,
    history: HistoryConfig,
    /// Notification channel prefix when the notify watch strategy is on.
    notify_prefix: Option<String>,
    pruner: Option<PruneQueue>,
    metrics: StorageMetrics,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parse the caller's expected version. Empty means "don't check".
fn parse_expected(raw: &str) -> Result<Option<i64>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<i64>()
        .map(Some)
        .map_err(|_| StorageError::BadRequest(format!("invalid resource version {raw:?}")))
}

fn check_expected(key: &Key, expected: Option<i64>, actual: i64) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(StorageError::OptimisticLockFailed {
            key: key.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

impl EntityStore {
    /// Build the store and, inside a tokio runtime, spawn its history
    /// maintenance task.
    pub fn new(db: DbPool, config: &Config, metrics: StorageMetrics) -> Self {
        let pruner = maintenance::spawn(db.clone(), &config.history, metrics.clone());
        Self {
            pruner,
            db,
            folders: config.folders.clone(),
            history: config.history.clone(),
            notify_prefix: (config.watch.strategy == WatchStrategy::Notify)
                .then(|| config.watch.channel_prefix.clone()),
            metrics,
        }
    }

    /// Connect with backoff, run migrations and build the store.
    pub async fn connect(config: &Config, metrics: StorageMetrics) -> Result<Self> {
        let db = (|| async move { DbPool::connect(&config.database).await })
            .retry(connect_backoff())
            .when(is_retryable)
            .notify(|err: &StorageError, dur: Duration| {
                warn!(error = %err, delay = ?dur, "database connection failed, retrying");
            })
            .await?;
        let store = Self::new(db, config, metrics);
        store.migrate().await?;
        info!(driver = store.db.dialect().name(), "entity store ready");
        Ok(store)
    }

    /// Create tables and indexes. On Postgres the notify trigger is kept
    /// in step with the configured watch strategy.
    pub async fn migrate(&self) -> Result<()> {
        schema::migrate(&self.db, self.notify_prefix.as_deref()).await
    }

    /// True when writes publish Postgres notifications.
    pub fn notifies(&self) -> bool {
        self.notify_prefix.is_some() && self.db.dialect() == Dialect::Postgres
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    pub fn metrics(&self) -> &StorageMetrics {
        &self.metrics
    }

    pub fn folder_index(&self) -> FolderIndex {
        FolderIndex::new(self.db.clone())
    }

    fn schedule_prune(&self, key: &Key) {
        if let Some(pruner) = &self.pruner {
            pruner.push(key.to_string());
        }
    }

    fn is_folder(&self, key: &Key) -> bool {
        key.subresource.is_empty() && self.folders.is_folder_kind(&key.group, &key.resource)
    }

    /// Store a new entity at the next version of its kind.
    #[tracing::instrument(skip(self, req), fields(key = %req.key))]
    pub async fn create(&self, req: WriteRequest) -> Result<WriteResult> {
        let started = Instant::now();
        req.key.validate()?;

        let now = now_millis();
        let key = req.key;
        let mut entity = Entity {
            group: key.group.clone(),
            resource: key.resource.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            subresource: key.subresource.clone(),
            guid: Uuid::new_v4().to_string(),
            resource_version: 0,
            previous_version: 0,
            action: Action::Created,
            body: req.body,
            meta: req.meta,
            status: req.status,
            errors: req.errors,
            etag: String::new(),
            created_at: now,
            created_by: req.actor.clone(),
            updated_at: now,
            updated_by: req.actor,
        };
        entity.etag = entity.compute_etag()?;

        let mut tx = self.db.begin().await?;
        let result = self.create_in_tx(&mut tx, &key, &mut entity, now).await;
        let result = tx
            .finish(result)
            .await
            .map_err(|e| e.in_operation("create", &key));
        self.metrics
            .record_write("create", outcome(&result, WriteStatus::Created), started);
        result?;
        self.schedule_prune(&key);

        debug!(resource_version = entity.resource_version, guid = %entity.guid, "created");
        Ok(WriteResult {
            entity,
            status: WriteStatus::Created,
        })
    }

    async fn create_in_tx(
        &self,
        tx: &mut Tx,
        key: &Key,
        entity: &mut Entity,
        now: i64,
    ) -> Result<()> {
        if self.lock_live_row(tx, key).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        }

        labels::insert_labels(tx, &entity.guid, &entity.meta.labels).await?;
        entity.resource_version =
            resource_version::next_version(tx, &entity.group, &entity.resource, now).await?;

        match tx.execute(&insert_entity(E::Table, entity)?).await {
            Ok(_) => {}
            Err(StorageError::Database(e)) if is_unique_violation(&e) => {
                return Err(StorageError::AlreadyExists {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e),
        }
        tx.execute(&insert_entity(EntityHistory::Table, entity)?)
            .await?;

        if self.is_folder(key) {
            folder::rebuild_namespace(tx, &self.folders, &key.namespace).await?;
        }
        Ok(())
    }

    /// Replace body, meta and status of an existing entity.
    ///
    /// Identical content yields [`WriteStatus::Unchanged`] with the current
    /// row and no new version.
    #[tracing::instrument(skip(self, req), fields(key = %req.key))]
    pub async fn update(&self, req: WriteRequest) -> Result<WriteResult> {
        let started = Instant::now();
        req.key.validate()?;
        let expected = parse_expected(&req.previous_version)?;
        let key = req.key.clone();

        let mut tx = self.db.begin().await?;
        let result = self.update_in_tx(&mut tx, req, expected).await;
        let result = tx
            .finish(result)
            .await
            .map_err(|e| e.in_operation("update", &key));
        self.metrics.record_write(
            "update",
            match &result {
                Ok(r) => r.status.as_str(),
                Err(_) => "error",
            },
            started,
        );
        let result = result?;
        if result.status != WriteStatus::Unchanged {
            self.schedule_prune(&key);
        }
        debug!(
            resource_version = result.entity.resource_version,
            status = result.status.as_str(),
            "updated"
        );
        Ok(result)
    }

    async fn update_in_tx(
        &self,
        tx: &mut Tx,
        req: WriteRequest,
        expected: Option<i64>,
    ) -> Result<WriteResult> {
        let key = req.key;
        let old = self
            .lock_live_row(tx, &key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        check_expected(&key, expected, old.resource_version)?;

        let etag = compute_etag(&req.body, &req.meta, &req.status)?;
        if etag == old.etag && req.errors == old.errors {
            return Ok(WriteResult {
                entity: old,
                status: WriteStatus::Unchanged,
            });
        }

        let now = now_millis();
        let mut entity = Entity {
            group: old.group.clone(),
            resource: old.resource.clone(),
            namespace: old.namespace.clone(),
            name: old.name.clone(),
            subresource: old.subresource.clone(),
            guid: old.guid.clone(),
            resource_version: 0,
            previous_version: old.resource_version,
            action: Action::Updated,
            body: req.body,
            meta: req.meta,
            status: req.status,
            errors: req.errors,
            etag,
            created_at: old.created_at,
            created_by: old.created_by.clone(),
            updated_at: now,
            updated_by: req.actor,
        };

        labels::update_labels(tx, &entity.guid, &old.meta.labels, &entity.meta.labels).await?;
        entity.resource_version =
            resource_version::next_version(tx, &entity.group, &entity.resource, now).await?;
        tx.execute(&update_entity(&entity)?).await?;
        tx.execute(&insert_entity(EntityHistory::Table, &entity)?)
            .await?;

        if self.is_folder(&key) {
            folder::rebuild_namespace(tx, &self.folders, &key.namespace).await?;
        }
        Ok(WriteResult {
            entity,
            status: WriteStatus::Updated,
        })
    }

    /// Remove the live row and log a final `Deleted` version.
    ///
    /// Returns the entity as it was before deletion, stamped with the new
    /// resource version.
    #[tracing::instrument(skip(self, req), fields(key = %req.key))]
    pub async fn delete(&self, req: DeleteRequest) -> Result<WriteResult> {
        let started = Instant::now();
        req.key.validate()?;
        let expected = parse_expected(&req.previous_version)?;
        let key = req.key.clone();

        let mut tx = self.db.begin().await?;
        let result = self.delete_in_tx(&mut tx, &key, expected, &req.actor).await;
        let result = tx
            .finish(result)
            .await
            .map_err(|e| e.in_operation("delete", &key));
        self.metrics
            .record_write("delete", outcome(&result, WriteStatus::Deleted), started);
        let entity = result?;
        self.schedule_prune(&key);

        debug!(resource_version = entity.resource_version, "deleted");
        Ok(WriteResult {
            entity,
            status: WriteStatus::Deleted,
        })
    }

    async fn delete_in_tx(
        &self,
        tx: &mut Tx,
        key: &Key,
        expected: Option<i64>,
        actor: &str,
    ) -> Result<Entity> {
        let old = self
            .lock_live_row(tx, key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        check_expected(key, expected, old.resource_version)?;

        let delete = Query::delete()
            .from_table(E::Table)
            .and_where(Expr::col(E::Guid).eq(old.guid.as_str()))
            .to_owned();
        tx.execute(&delete).await?;
        labels::delete_labels(tx, &old.guid).await?;

        let now = now_millis();
        let mut entity = old;
        entity.previous_version = entity.resource_version;
        entity.resource_version =
            resource_version::next_version(tx, &entity.group, &entity.resource, now).await?;
        entity.action = Action::Deleted;
        entity.updated_at = now;
        if !actor.is_empty() {
            entity.updated_by = actor.to_string();
        }
        tx.execute(&insert_entity(EntityHistory::Table, &entity)?)
            .await?;

        if self.is_folder(key) {
            folder::rebuild_namespace(tx, &self.folders, &key.namespace).await?;
        }
        Ok(entity)
    }

    async fn lock_live_row(&self, tx: &mut Tx, key: &Key) -> Result<Option<Entity>> {
        let mut select = select_entity(E::Table)
            .and_where(Expr::col(E::Key).eq(key.to_string()))
            .to_owned();
        tx.dialect().lock_for_update(&mut select);
        tx.fetch_optional::<EntityRow, _>(&select)
            .await?
            .map(EntityRow::into_entity)
            .transpose()
    }

    /// Read the live row, or the history row at `resource_version`.
    ///
    /// `None` and `Some(0)` both mean latest; a negative version is a bad
    /// request. Returns an empty entity when nothing matches.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn read(&self, key: &Key, resource_version: Option<i64>) -> Result<Entity> {
        key.validate()?;
        let select = match resource_version.unwrap_or(0) {
            0 => select_entity(E::Table)
                .and_where(Expr::col(E::Key).eq(key.to_string()))
                .to_owned(),
            rv if rv > 0 => select_entity(EntityHistory::Table)
                .and_where(Expr::col(E::Key).eq(key.to_string()))
                .and_where(Expr::col(E::ResourceVersion).eq(rv))
                .to_owned(),
            rv => {
                return Err(StorageError::BadRequest(format!(
                    "invalid resource version {rv}"
                )))
            }
        };
        match self.db.fetch_optional::<EntityRow, _>(&select).await? {
            Some(row) => row.into_entity(),
            None => Ok(Entity::default()),
        }
    }

    /// Like [`read`](Self::read) on the live table, but missing is an error.
    pub async fn get(&self, key: &Key) -> Result<Entity> {
        let entity = self.read(key, None).await?;
        if entity.is_empty() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(entity)
    }

    /// One page of live entities, of deleted ones with
    /// `grafana.app/listDeleted=true`, or of the kind as it was at
    /// `req.resource_version`.
    ///
    /// Label equality is evaluated in SQL. Other label requirements are left
    /// to the caller, except for history lists where everything is filtered
    /// here.
    #[tracing::instrument(skip(self, req), fields(prefix = %req.prefix))]
    pub async fn list(&self, req: &ListRequest) -> Result<ListResponse> {
        let plan = ListPlan::from_request(req)?;
        let current =
            resource_version::current_version(&self.db, &plan.prefix.group, &plan.prefix.resource)
                .await?;
        if plan.resource_version > current {
            return Err(StorageError::BadRequest(format!(
                "resource version {} is newer than the latest version {current}",
                plan.resource_version
            )));
        }

        if plan.reads_history() {
            let query = if plan.include_deleted {
                plan.trash_query()
            } else {
                plan.revision_query()
            };
            let rows: Vec<EntityRow> = self.db.fetch_all(&query).await?;
            let entities = rows
                .into_iter()
                .map(EntityRow::into_entity)
                .collect::<Result<Vec<_>>>()?;
            let (items, next_page_token) = plan.page_in_memory(entities)?;
            return Ok(ListResponse {
                items,
                next_page_token,
                resource_version: if plan.include_deleted {
                    current
                } else {
                    plan.resource_version
                },
            });
        }
        let resource_version = current;

        let rows: Vec<EntityRow> = self.db.fetch_all(&plan.live_query()).await?;
        let mut items = rows
            .into_iter()
            .map(EntityRow::into_entity)
            .collect::<Result<Vec<_>>>()?;
        let mut next_page_token = String::new();
        if items.len() as u64 > plan.limit {
            if let Some(overflow) = items.pop() {
                next_page_token = plan.next_token(&overflow)?;
            }
        }
        debug!(items = items.len(), more = !next_page_token.is_empty(), "listed");
        Ok(ListResponse {
            items,
            next_page_token,
            resource_version,
        })
    }

    /// Every recorded version of `key`, newest first.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn history(&self, key: &Key) -> Result<Vec<EntityVersionInfo>> {
        key.validate()?;
        let rows: Vec<EntityRow> = self
            .db
            .fetch_all(&select_history_for_key(EntityHistory::Table, &key.to_string()))
            .await?;
        rows.into_iter()
            .map(|row| row.into_entity().map(|e| EntityVersionInfo::from(&e)))
            .collect()
    }

    /// History rows of one kind after `since`, oldest first.
    pub async fn history_since(
        &self,
        group: &str,
        resource: &str,
        since: i64,
        limit: u64,
    ) -> Result<Vec<Entity>> {
        let select = select_entity(EntityHistory::Table)
            .and_where(Expr::col(E::Group).eq(group))
            .and_where(Expr::col(E::Resource).eq(resource))
            .and_where(Expr::col(E::ResourceVersion).gt(since))
            .order_by(E::ResourceVersion, Order::Asc)
            .limit(limit)
            .to_owned();
        let rows: Vec<EntityRow> = self.db.fetch_all(&select).await?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    /// The history row written for `guid` at `resource_version`.
    pub async fn history_at(&self, guid: &str, resource_version: i64) -> Result<Option<Entity>> {
        let select = select_entity(EntityHistory::Table)
            .and_where(Expr::col(E::Guid).eq(guid))
            .and_where(Expr::col(E::ResourceVersion).eq(resource_version))
            .to_owned();
        self.db
            .fetch_optional::<EntityRow, _>(&select)
            .await?
            .map(EntityRow::into_entity)
            .transpose()
    }

    /// Latest issued version of every kind.
    pub async fn latest_versions(&self) -> Result<Vec<KindVersionRow>> {
        resource_version::latest_versions(&self.db).await
    }

    /// Latest issued version of one kind; 0 before the first write.
    pub async fn current_version(&self, group: &str, resource: &str) -> Result<i64> {
        resource_version::current_version(&self.db, group, resource).await
    }

    /// True when the database answers a trivial query.
    pub async fn is_healthy(&self) -> bool {
        match self.db.execute_raw("SELECT 1").await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "health check failed");
                false
            }
        }
    }

    /// Drop every history row of `key` except the newest.
    ///
    /// Administrative; refused unless `history.allow_purge` is set.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn purge_history(&self, key: &Key) -> Result<u64> {
        if !self.history.allow_purge {
            return Err(StorageError::BadRequest(
                "history purge is disabled".to_string(),
            ));
        }
        key.validate()?;

        let purged = maintenance::prune_history(&self.db, &key.to_string(), 1)
            .await
            .map_err(|e| e.in_operation("purge_history", key))?;
        self.metrics.record_history_removed("purge", purged);
        info!(purged, "history purged");
        Ok(purged)
    }

    /// Run one garbage collection pass now, whether or not the periodic
    /// one is enabled. Returns the number of deleted keys whose history was
    /// dropped.
    #[tracing::instrument(skip(self))]
    pub async fn collect_garbage(&self) -> Result<u64> {
        maintenance::collect_garbage(&self.db, &self.history.gc, &self.metrics).await
    }

    /// Live object counts per namespace and kind, optionally limited to one
    /// namespace. Only kinds with more than `min_count` objects are listed.
    pub async fn resource_stats(
        &self,
        namespace: Option<&str>,
        min_count: i64,
    ) -> Result<Vec<ResourceStats>> {
        resource_version::resource_stats(&self.db, namespace, min_count).await
    }
}

fn outcome<T>(result: &Result<T>, status: WriteStatus) -> &'static str {
    match result {
        Ok(_) => status.as_str(),
        Err(e) if e.is_conflict() => "conflict",
        Err(_) => "error",
    }
}
