//! Polling change feed.
//!
//! Tails the history table. Each tick reads the kind version counters and
//! queries history only for kinds that moved past their watermark. A kind
//! that returns a full batch is queried again before the next tick.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::broadcaster::Broadcaster;
use super::{ChangeFeed, SharedEvent, WrittenEvent};
use crate::config::WatchConfig;
use crate::error::Result;
use crate::storage::{EntityStore, KeyPrefix};

struct Poller {
    store: EntityStore,
    broadcaster: Broadcaster<SharedEvent>,
    batch_size: u64,
    watermarks: HashMap<(String, String), i64>,
}

impl Poller {
    async fn seed(&mut self) -> Result<()> {
        for kind in self.store.latest_versions().await? {
            self.watermarks
                .insert((kind.group, kind.resource), kind.resource_version);
        }
        debug!(kinds = self.watermarks.len(), "poller watermarks seeded");
        Ok(())
    }

    /// Publish everything committed since the last tick.
    async fn poll_once(&mut self) -> Result<usize> {
        let mut published = 0;
        for kind in self.store.latest_versions().await? {
            let key = (kind.group, kind.resource);
            let mut mark = self.watermarks.get(&key).copied().unwrap_or(0);
            if kind.resource_version <= mark {
                continue;
            }

            loop {
                let rows = self
                    .store
                    .history_since(&key.0, &key.1, mark, self.batch_size)
                    .await?;
                let fetched = rows.len();
                self.store.metrics().record_poll_batch(fetched);
                for entity in rows {
                    mark = entity.resource_version;
                    self.store
                        .metrics()
                        .record_watch_event(&entity.group, &entity.resource);
                    self.broadcaster
                        .publish(Arc::new(WrittenEvent::new(entity)))?;
                    published += 1;
                }
                self.watermarks.insert(key.clone(), mark);
                if (fetched as u64) < self.batch_size {
                    break;
                }
            }
        }
        Ok(published)
    }
}

/// Change feed that polls the history table on an interval.
pub struct PollingFeed {
    cancel: watch::Sender<bool>,
}

impl PollingFeed {
    /// Seed watermarks at the current versions and spawn the poll loop.
    ///
    /// Writes committed before this returns are never published.
    pub async fn start(
        store: EntityStore,
        broadcaster: Broadcaster<SharedEvent>,
        config: &WatchConfig,
    ) -> Result<Self> {
        let mut poller = Poller {
            store,
            broadcaster,
            batch_size: u64::from(config.poll_batch_size.max(1)),
            watermarks: HashMap::new(),
        };
        poller.seed().await?;

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let interval = config.poll_interval();
        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "poller started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match poller.poll_once().await {
                            Ok(0) => {}
                            Ok(n) => debug!(events = n, "poll published events"),
                            Err(e) => error!(error = %e, "poll failed"),
                        }
                        if !poller.broadcaster.is_running() {
                            break;
                        }
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("poller stopped");
        });

        Ok(Self { cancel: cancel_tx })
    }
}

#[async_trait]
impl ChangeFeed for PollingFeed {
    fn name(&self) -> &'static str {
        "poll"
    }

    // Every kind is polled; scopes are filtered by the sessions.
    async fn register(&self, _prefix: &KeyPrefix) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, _prefix: &KeyPrefix) {}

    fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for PollingFeed {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}
