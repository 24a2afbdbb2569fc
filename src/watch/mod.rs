//! Change notification and watch sessions.
//!
//! A [`ChangeFeed`] (polling or Postgres LISTEN/NOTIFY) turns committed
//! history rows into [`WrittenEvent`]s and publishes them on a shared
//! [`Broadcaster`]. Each [`WatchSession`] subscribes to the broadcaster,
//! filters by its scope and predicate and decodes events for the caller.
//! The rest of the engine never knows which feed is active.

pub mod broadcaster;
pub mod decoder;
pub mod notify;
pub mod poller;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{WatchConfig, WatchStrategy};
use crate::error::{Result, StorageError};
use crate::storage::{Entity, EntityStore, KeyPrefix, LabelSelector};

pub use broadcaster::{Broadcaster, CloseReason, Subscription};
pub use notify::NotifyFeed;
pub use poller::PollingFeed;
pub use session::{CancelHandle, SessionState, WatchSession};

/// Annotation on the bookmark that ends the initial event list.
pub const INITIAL_EVENTS_END_ANNOTATION: &str = "grafana.app/initial-events-end";

/// One committed write as seen by the feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenEvent {
    /// The history row, including its action and previous version.
    pub entity: Entity,
    /// Snapshot before the write, when the feed already has it.
    pub previous: Option<Entity>,
    /// Epoch milliseconds of the write.
    pub timestamp: i64,
}

impl WrittenEvent {
    pub fn new(entity: Entity) -> Self {
        let timestamp = entity.updated_at;
        Self {
            entity,
            previous: None,
            timestamp,
        }
    }
}

/// Events flow through the broadcaster behind an `Arc` so fan-out does
/// not copy bodies.
pub type SharedEvent = Arc<WrittenEvent>;

/// Client-facing event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
}

/// One event delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventType,
    pub entity: Entity,
    /// Snapshot before a modification, when known.
    pub previous: Option<Entity>,
}

impl WatchEvent {
    pub fn new(kind: WatchEventType, entity: Entity) -> Self {
        Self {
            kind,
            entity,
            previous: None,
        }
    }

    pub fn resource_version(&self) -> i64 {
        self.entity.resource_version
    }
}

/// What to watch.
#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    /// Kind, optionally narrowed to a namespace and name.
    pub prefix: KeyPrefix,
    pub selector: LabelSelector,
    /// Deliver every change after this version. `None` starts from now.
    pub since: Option<i64>,
    /// List current objects as `Added` before streaming.
    pub send_initial_events: bool,
    /// Emit a bookmark when the initial list is complete.
    pub allow_bookmarks: bool,
}

impl WatchRequest {
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

    pub fn since(mut self, resource_version: i64) -> Self {
        self.since = Some(resource_version);
        self
    }

    pub fn with_initial_events(mut self, allow_bookmarks: bool) -> Self {
        self.send_initial_events = true;
        self.allow_bookmarks = allow_bookmarks;
        self
    }
}

/// Source of committed writes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    fn name(&self) -> &'static str;

    /// Declare interest in a scope before its watcher starts streaming.
    ///
    /// Returns once the feed will deliver events for the scope.
    async fn register(&self, prefix: &KeyPrefix) -> Result<()>;

    /// Withdraw interest registered with [`register`](Self::register).
    fn unregister(&self, prefix: &KeyPrefix);

    /// Stop producing events.
    fn stop(&self);
}

/// Entry point for watches: owns the feed and the broadcaster.
#[derive(Clone)]
pub struct Watcher {
    store: EntityStore,
    broadcaster: Broadcaster<SharedEvent>,
    feed: Arc<dyn ChangeFeed>,
    config: WatchConfig,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("feed", &self.feed.name())
            .field("broadcaster", &self.broadcaster)
            .finish()
    }
}

impl Watcher {
    /// Start the broadcaster and the feed selected by `config.strategy`.
    pub async fn start(store: EntityStore, config: &WatchConfig) -> Result<Self> {
        let broadcaster = Broadcaster::start(
            config.cache_size,
            config.subscriber_buffer,
            store.metrics().clone(),
        );
        let feed: Arc<dyn ChangeFeed> = match config.strategy {
            WatchStrategy::Poll => {
                Arc::new(PollingFeed::start(store.clone(), broadcaster.clone(), config).await?)
            }
            WatchStrategy::Notify => {
                let pool = store.db().as_postgres().cloned().ok_or_else(|| {
                    StorageError::BadRequest(
                        "the notify watch strategy requires postgres".to_string(),
                    )
                })?;
                if !store.notifies() {
                    return Err(StorageError::BadRequest(
                        "the store was opened without the notify trigger".to_string(),
                    ));
                }
                Arc::new(NotifyFeed::start(
                    pool,
                    store.clone(),
                    broadcaster.clone(),
                    config,
                )?)
            }
        };
        info!(feed = feed.name(), "watcher started");
        Ok(Self::with_feed(store, broadcaster, feed, config))
    }

    /// Assemble from parts, e.g. a custom feed in tests.
    pub fn with_feed(
        store: EntityStore,
        broadcaster: Broadcaster<SharedEvent>,
        feed: Arc<dyn ChangeFeed>,
        config: &WatchConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            feed,
            config: config.clone(),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster<SharedEvent> {
        &self.broadcaster
    }

    /// Open a watch session.
    pub async fn watch(&self, req: WatchRequest) -> Result<WatchSession> {
        WatchSession::start(
            self.store.clone(),
            self.broadcaster.clone(),
            self.feed.clone(),
            self.config.subscriber_buffer,
            req,
        )
        .await
    }

    /// Stop the feed and close every session with `WatchTerminated`.
    pub fn shutdown(&self) {
        self.feed.stop();
        self.broadcaster.shutdown();
        info!(feed = self.feed.name(), "watcher stopped");
    }
}
