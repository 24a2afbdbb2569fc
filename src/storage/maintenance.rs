//! Background history maintenance.
//!
//! One task per store runs two jobs. The pruner trims the history of
//! recently written keys to the newest `history.max_versions` rows. Keys are
//! debounced, so a burst of writes to one key costs a single prune. Garbage
//! collection periodically drops the whole history of keys deleted longer
//! ago than their kind's retention.
//!
//! The task stops once every store handle is gone.

use std::collections::HashMap;
use std::time::Duration;

use sea_query::{Alias, Expr, Order, Query};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::db::{DbPool, Tx};
use super::resource_version;
use super::schema::{Entity as E, EntityHistory};
use crate::config::{GcConfig, HistoryConfig};
use crate::error::Result;
use crate::utils::metrics::StorageMetrics;

/// Store-side handle feeding written keys to the pruner.
#[derive(Debug, Clone)]
pub struct PruneQueue {
    keys: mpsc::UnboundedSender<String>,
    enabled: bool,
}

impl PruneQueue {
    /// Schedule `key` for pruning. A no-op when pruning is off.
    pub fn push(&self, key: String) {
        if self.enabled && self.keys.send(key).is_err() {
            warn!("history maintenance task is gone");
        }
    }
}

/// Spawn the maintenance task when pruning or collection is configured.
///
/// Returns `None` without a tokio runtime, or when there is nothing to do.
pub fn spawn(db: DbPool, history: &HistoryConfig, metrics: StorageMetrics) -> Option<PruneQueue> {
    if history.max_versions == 0 && !history.gc.enabled {
        return None;
    }
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            warn!("no async runtime; history maintenance disabled");
            return None;
        }
    };
    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    let task = Maintenance {
        db,
        history: history.clone(),
        metrics,
    };
    runtime.spawn(task.run(keys_rx));
    Some(PruneQueue {
        keys: keys_tx,
        enabled: history.max_versions > 0,
    })
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    first: Instant,
    last: Instant,
}

/// Tracks keys waiting to be pruned.
///
/// A key is due once it has been quiet for `min_wait`, or `max_wait` after
/// its first pending write, whichever comes first.
#[derive(Debug)]
struct Debouncer {
    min_wait: Duration,
    max_wait: Duration,
    pending: HashMap<String, Pending>,
}

impl Debouncer {
    fn new(min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            min_wait,
            max_wait,
            pending: HashMap::new(),
        }
    }

    fn touch(&mut self, key: String, now: Instant) {
        self.pending
            .entry(key)
            .and_modify(|p| p.last = now)
            .or_insert(Pending {
                first: now,
                last: now,
            });
    }

    fn due_at(&self, pending: &Pending) -> Instant {
        (pending.last + self.min_wait).min(pending.first + self.max_wait)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| self.due_at(p)).min()
    }

    /// Remove and return every due key, sorted.
    fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| self.due_at(p) <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.pending.remove(key);
        }
        due.sort();
        due
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

struct Maintenance {
    db: DbPool,
    history: HistoryConfig,
    metrics: StorageMetrics,
}

impl Maintenance {
    async fn run(self, mut keys: mpsc::UnboundedReceiver<String>) {
        let mut debouncer =
            Debouncer::new(self.history.prune_min_wait(), self.history.prune_max_wait());
        let gc_enabled = self.history.gc.enabled;
        let period = self.history.gc.interval();
        let mut gc_tick = tokio::time::interval_at(Instant::now() + period, period);
        gc_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            max_versions = self.history.max_versions,
            gc = gc_enabled,
            "history maintenance started"
        );

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                key = keys.recv() => match key {
                    Some(key) => debouncer.touch(key, Instant::now()),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    for key in debouncer.take_due(Instant::now()) {
                        self.prune(&key).await;
                    }
                }
                _ = gc_tick.tick(), if gc_enabled => {
                    if let Err(e) = collect_garbage(&self.db, &self.history.gc, &self.metrics).await {
                        error!(error = %e, "history garbage collection failed");
                    }
                }
            }
        }
        info!(pending = debouncer.len(), "history maintenance stopped");
    }

    async fn prune(&self, key: &str) {
        let keep = u64::from(self.history.max_versions);
        match prune_history(&self.db, key, keep).await {
            Ok(0) => {}
            Ok(rows) => {
                debug!(key, rows, "pruned history");
                self.metrics.record_history_removed("prune", rows);
            }
            Err(e) => error!(key, error = %e, "failed to prune history"),
        }
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    resource_version: i64,
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    key: String,
}

/// Keep the newest `keep` history rows of `key` in one transaction.
pub async fn prune_history(db: &DbPool, key: &str, keep: u64) -> Result<u64> {
    let mut tx = db.begin().await?;
    let result = prune_in_tx(&mut tx, key, keep).await;
    tx.finish(result).await
}

/// Delete every history row of `key` older than the newest `keep`.
///
/// `keep` of 0 is treated as 1; the latest row always survives.
pub async fn prune_in_tx(tx: &mut Tx, key: &str, keep: u64) -> Result<u64> {
    let oldest_kept = Query::select()
        .column(E::ResourceVersion)
        .from(EntityHistory::Table)
        .and_where(Expr::col(E::Key).eq(key))
        .order_by(E::ResourceVersion, Order::Desc)
        .limit(1)
        .offset(keep.max(1) - 1)
        .to_owned();
    let Some(oldest_kept) = tx.fetch_optional::<VersionRow, _>(&oldest_kept).await? else {
        return Ok(0);
    };
    let delete = Query::delete()
        .from_table(EntityHistory::Table)
        .and_where(Expr::col(E::Key).eq(key))
        .and_where(Expr::col(E::ResourceVersion).lt(oldest_kept.resource_version))
        .to_owned();
    tx.execute(&delete).await
}

/// One collection pass over every kind. Returns the number of keys whose
/// history was removed.
pub async fn collect_garbage(db: &DbPool, gc: &GcConfig, metrics: &StorageMetrics) -> Result<u64> {
    let now = chrono::Utc::now().timestamp_millis();
    let batch = u64::from(gc.batch_size.max(1));
    let mut collected = 0;
    for kind in resource_version::latest_versions(db).await? {
        let max_age = gc.max_age(&kind.group, &kind.resource);
        let cutoff = now - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        loop {
            let mut tx = db.begin().await?;
            let result = collect_batch(&mut tx, &kind.group, &kind.resource, cutoff, batch).await;
            let (keys, rows) = tx.finish(result).await?;
            collected += keys;
            if rows > 0 {
                metrics.record_history_removed("gc", rows);
                debug!(
                    group = %kind.group,
                    resource = %kind.resource,
                    keys,
                    rows,
                    "collected deleted history"
                );
            }
            if keys < batch {
                break;
            }
        }
    }
    Ok(collected)
}

/// Drop the history of up to `batch` keys of one kind whose last version
/// is a delete older than `cutoff`. Returns `(keys, rows)`.
async fn collect_batch(
    tx: &mut Tx,
    group: &str,
    resource: &str,
    cutoff: i64,
    batch: u64,
) -> Result<(u64, u64)> {
    let h = Alias::new("h");
    let latest = Query::select()
        .expr(Expr::col((EntityHistory::Table, E::ResourceVersion)).max())
        .from(EntityHistory::Table)
        .and_where(Expr::col((EntityHistory::Table, E::Key)).equals((h.clone(), E::Key)))
        .to_owned();
    let live_keys = Query::select().column(E::Key).from(E::Table).to_owned();
    let candidates = Query::select()
        .column((h.clone(), E::Key))
        .from_as(EntityHistory::Table, h.clone())
        .and_where(Expr::col((h.clone(), E::Group)).eq(group))
        .and_where(Expr::col((h.clone(), E::Resource)).eq(resource))
        .and_where(Expr::col((h.clone(), E::Action)).eq("deleted"))
        .and_where(Expr::col((h.clone(), E::UpdatedAt)).lt(cutoff))
        .and_where(Expr::col((h.clone(), E::ResourceVersion)).in_subquery(latest))
        .and_where(Expr::col((h.clone(), E::Key)).not_in_subquery(live_keys))
        .order_by((h, E::Key), Order::Asc)
        .limit(batch)
        .to_owned();
    let keys: Vec<KeyRow> = tx.fetch_all(&candidates).await?;
    if keys.is_empty() {
        return Ok((0, 0));
    }
    let delete = Query::delete()
        .from_table(EntityHistory::Table)
        .and_where(Expr::col(E::Key).is_in(keys.iter().map(|k| k.key.as_str())))
        .to_owned();
    let rows = tx.execute(&delete).await?;
    Ok((keys.len() as u64, rows))
}
