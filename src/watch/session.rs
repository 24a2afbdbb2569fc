//! A single watcher.
//!
//! The session task subscribes to the broadcaster, optionally replays the
//! initial state or the history since a version, then streams decoded
//! events to the caller over a bounded channel. Its lifecycle is published
//! on a [`tokio::sync::watch`] channel.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::broadcaster::{Broadcaster, Subscription};
use super::decoder::{decode, initial_events_end, needs_previous};
use super::{ChangeFeed, SharedEvent, WatchEvent, WatchEventType, WatchRequest, WrittenEvent};
use crate::error::{Result, StorageError};
use crate::storage::{EntityStore, ListRequest, SelectionPredicate};

const CATCH_UP_BATCH: u64 = 500;

/// Lifecycle of a watch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Sending initial events or catching up.
    Starting,
    /// Forwarding live events.
    Streaming,
    /// The feed or broadcaster went away; the caller must resync.
    Terminated,
    /// Cancelled by the caller.
    Cancelled,
    /// Failed with an error.
    Error(String),
}

impl SessionState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, SessionState::Starting | SessionState::Streaming)
    }
}

/// Stops a session from anywhere. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Caller's end of a watch.
pub struct WatchSession {
    events: mpsc::Receiver<Result<WatchEvent>>,
    state: watch::Receiver<SessionState>,
    cancel: CancelHandle,
}

impl std::fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSession")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl WatchSession {
    /// Register with the feed, subscribe and spawn the session task.
    pub(crate) async fn start(
        store: EntityStore,
        broadcaster: Broadcaster<SharedEvent>,
        feed: Arc<dyn ChangeFeed>,
        buffer: usize,
        req: WatchRequest,
    ) -> Result<Self> {
        if req.prefix.group.is_empty() || req.prefix.resource.is_empty() {
            return Err(StorageError::InvalidKey(
                "watch needs a group and a resource".to_string(),
            ));
        }
        let mut predicate = SelectionPredicate::from_selector(&req.selector)?;
        predicate.name = req.prefix.name.clone();

        feed.register(&req.prefix).await?;
        let replay = req.since.is_some() && !req.send_initial_events;
        let subscription = match broadcaster.subscribe(replay).await {
            Ok(sub) => sub,
            Err(e) => {
                feed.unregister(&req.prefix);
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::channel(buffer.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let task = SessionTask {
            store,
            feed,
            req,
            predicate,
            subscription,
            events: events_tx,
            state: state_tx,
            cancel: cancel_rx,
            last_rv: 0,
        };
        tokio::spawn(task.run());

        Ok(Self {
            events: events_rx,
            state: state_rx,
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
            },
        })
    }

    /// Next event. `None` once the session has ended; a terminal error is
    /// delivered as the last item.
    pub async fn next(&mut self) -> Option<Result<WatchEvent>> {
        self.events.recv().await
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver for lifecycle changes.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Consume the session as a stream of events. Dropping the stream
    /// cancels the session.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send + 'static>> {
        Box::pin(futures::stream::unfold(self, |mut session| async move {
            session.next().await.map(|item| (item, session))
        }))
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Exit {
    Cancelled,
    Failed(StorageError),
}

impl From<StorageError> for Exit {
    fn from(err: StorageError) -> Self {
        Exit::Failed(err)
    }
}

type Flow = std::result::Result<(), Exit>;

struct SessionTask {
    store: EntityStore,
    feed: Arc<dyn ChangeFeed>,
    req: WatchRequest,
    predicate: SelectionPredicate,
    subscription: Subscription<SharedEvent>,
    events: mpsc::Sender<Result<WatchEvent>>,
    state: watch::Sender<SessionState>,
    cancel: watch::Receiver<bool>,
    /// Newest version of the watched kind already handled.
    last_rv: i64,
}

impl SessionTask {
    async fn run(mut self) {
        let prefix = self.req.prefix.clone();
        debug!(%prefix, subscriber = self.subscription.id(), "watch started");

        let final_state = match self.stream().await {
            Ok(()) | Err(Exit::Cancelled) => SessionState::Cancelled,
            Err(Exit::Failed(err)) => {
                let state = match err {
                    StorageError::WatchTerminated => SessionState::Terminated,
                    ref other => SessionState::Error(other.to_string()),
                };
                warn!(%prefix, error = %err, "watch ended");
                let _ = self.events.try_send(Err(err));
                state
            }
        };
        self.feed.unregister(&prefix);
        info!(%prefix, state = ?final_state, "watch closed");
        let _ = self.state.send(final_state);
    }

    async fn stream(&mut self) -> Flow {
        if self.req.send_initial_events {
            self.send_initial_events().await?;
        } else if let Some(since) = self.req.since {
            self.catch_up(since).await?;
        }
        let _ = self.state.send(SessionState::Streaming);

        loop {
            tokio::select! {
                _ = self.cancel.changed() => return Err(Exit::Cancelled),
                _ = self.events.closed() => return Err(Exit::Cancelled),
                received = self.subscription.recv() => match received {
                    Ok(event) => self.deliver(&event).await?,
                    Err(reason) => return Err(Exit::Failed(reason.into_error())),
                },
            }
        }
    }

    /// List the current state as `Added` events, then stream from the
    /// list's version.
    async fn send_initial_events(&mut self) -> Flow {
        let mut request =
            ListRequest::new(self.req.prefix.clone()).with_selector(self.req.selector.clone());
        let mut list_rv = None;
        loop {
            let page = self.store.list(&request).await?;
            let rv = *list_rv.get_or_insert(page.resource_version);
            for entity in page.items {
                // Rows written after the first page are delivered live.
                if entity.resource_version > rv || !self.predicate.matches(&entity) {
                    continue;
                }
                self.send(WatchEvent::new(WatchEventType::Added, entity)).await?;
            }
            if page.next_page_token.is_empty() {
                break;
            }
            request = request.continuing(page.next_page_token);
        }

        let rv = list_rv.unwrap_or_default();
        self.last_rv = rv;
        if self.req.allow_bookmarks {
            let prefix = &self.req.prefix;
            let bookmark = initial_events_end(
                &prefix.group,
                &prefix.resource,
                prefix.namespace.as_deref().unwrap_or_default(),
                rv,
            );
            self.send(bookmark).await?;
        }
        Ok(())
    }

    /// Deliver every change after `since`, from the replay ring when it
    /// reaches back far enough and from history otherwise.
    async fn catch_up(&mut self, since: i64) -> Flow {
        self.last_rv = since;
        let replay: Vec<SharedEvent> = self
            .subscription
            .take_replay()
            .into_iter()
            .filter(|e| self.same_kind(e))
            .collect();

        let covered = replay
            .first()
            .is_some_and(|e| e.entity.resource_version <= since + 1);
        if !covered {
            debug!(since, "replay ring does not reach back, reading history");
            let group = self.req.prefix.group.clone();
            let resource = self.req.prefix.resource.clone();
            loop {
                let rows = self
                    .store
                    .history_since(&group, &resource, self.last_rv, CATCH_UP_BATCH)
                    .await?;
                let fetched = rows.len() as u64;
                for entity in rows {
                    self.deliver(&WrittenEvent::new(entity)).await?;
                }
                if fetched < CATCH_UP_BATCH {
                    break;
                }
            }
        }

        for event in replay {
            self.deliver(&event).await?;
        }
        Ok(())
    }

    fn same_kind(&self, event: &WrittenEvent) -> bool {
        event.entity.group == self.req.prefix.group
            && event.entity.resource == self.req.prefix.resource
    }

    fn in_scope(&self, event: &WrittenEvent) -> bool {
        let e = &event.entity;
        self.req
            .prefix
            .matches(&e.group, &e.resource, &e.namespace, &e.name)
    }

    async fn deliver(&mut self, event: &WrittenEvent) -> Flow {
        if !self.same_kind(event) || event.entity.resource_version <= self.last_rv {
            return Ok(());
        }
        self.last_rv = event.entity.resource_version;
        if !self.in_scope(event) {
            return Ok(());
        }

        let previous = if needs_previous(event, &self.predicate) {
            let prev = self
                .store
                .read(&event.entity.key(), Some(event.entity.previous_version))
                .await?;
            (!prev.is_empty()).then_some(prev)
        } else {
            None
        };

        match decode(event, previous.as_ref(), &self.predicate) {
            Some(decoded) => self.send(decoded).await,
            None => Ok(()),
        }
    }

    async fn send(&mut self, event: WatchEvent) -> Flow {
        tokio::select! {
            _ = self.cancel.changed() => Err(Exit::Cancelled),
            sent = self.events.send(Ok(event)) => sent.map_err(|_| Exit::Cancelled),
        }
    }
}
