//! Fan-out of one event stream to many subscribers.
//!
//! A single task owns the subscriber set and the replay ring. Everything
//! else talks to it through [`Command`] messages, so the hot path takes no
//! locks. Sends to subscribers never block: a subscriber whose buffer is
//! full is dropped with [`CloseReason::Lagged`] and has to resync.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::utils::metrics::StorageMetrics;

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscriber went away.
    Unsubscribed,
    /// The subscriber fell behind and was dropped.
    Lagged,
    /// The upstream feed lost its connection.
    Terminated,
    /// The broadcaster was shut down.
    Shutdown,
}

impl CloseReason {
    /// The error a watch session reports for this reason.
    pub fn into_error(self) -> StorageError {
        match self {
            CloseReason::Terminated | CloseReason::Shutdown => StorageError::WatchTerminated,
            CloseReason::Lagged => {
                StorageError::BackendUnavailable("watcher fell behind and was dropped".to_string())
            }
            CloseReason::Unsubscribed => StorageError::WatchTerminated,
        }
    }
}

struct Subscribed<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    closed: oneshot::Receiver<CloseReason>,
    replay: Vec<T>,
}

enum Command<T> {
    Subscribe {
        replay: bool,
        reply: oneshot::Sender<Subscribed<T>>,
    },
    Unsubscribe {
        id: u64,
    },
    Publish(T),
    ReadCache {
        reply: oneshot::Sender<Vec<T>>,
    },
    TerminateAll,
    Shutdown,
}

struct SubscriberSlot<T> {
    tx: mpsc::Sender<T>,
    closed: oneshot::Sender<CloseReason>,
}

struct State<T> {
    subscribers: HashMap<u64, SubscriberSlot<T>>,
    cache: VecDeque<T>,
    cache_size: usize,
    buffer: usize,
    next_id: u64,
    metrics: StorageMetrics,
}

impl<T: Clone> State<T> {
    fn subscribe(&mut self, replay: bool) -> Subscribed<T> {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.buffer);
        let (closed_tx, closed_rx) = oneshot::channel();
        self.subscribers.insert(
            id,
            SubscriberSlot {
                tx,
                closed: closed_tx,
            },
        );
        self.metrics.subscriber_added();
        let replay = if replay {
            self.cache.iter().cloned().collect()
        } else {
            Vec::new()
        };
        debug!(id, replayed = replay.len(), "subscriber added");
        Subscribed {
            id,
            rx,
            closed: closed_rx,
            replay,
        }
    }

    fn remove(&mut self, id: u64, reason: CloseReason) {
        if let Some(slot) = self.subscribers.remove(&id) {
            // The reason must be in place before the event channel closes.
            let _ = slot.closed.send(reason);
            self.metrics.subscriber_removed();
            debug!(id, ?reason, "subscriber removed");
        }
    }

    fn publish(&mut self, event: T) {
        if self.cache_size > 0 {
            if self.cache.len() == self.cache_size {
                self.cache.pop_front();
            }
            self.cache.push_back(event.clone());
        }

        let mut dropped = Vec::new();
        for (id, slot) in &self.subscribers {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => dropped.push((*id, CloseReason::Lagged)),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push((*id, CloseReason::Unsubscribed))
                }
            }
        }
        for (id, reason) in dropped {
            if reason == CloseReason::Lagged {
                warn!(id, "dropping slow subscriber");
            }
            self.remove(id, reason);
        }
    }

    fn close_all(&mut self, reason: CloseReason) {
        let ids: Vec<u64> = self.subscribers.keys().copied().collect();
        for id in ids {
            self.remove(id, reason);
        }
    }
}

/// Handle to the broadcaster task. Cheap to clone.
pub struct Broadcaster<T> {
    control: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Broadcaster<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("running", &!self.control.is_closed())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Spawn the broadcaster task.
    ///
    /// `cache_size` events are kept for replay; each subscriber may have
    /// `buffer` undelivered events before it is dropped.
    pub fn start(cache_size: usize, buffer: usize, metrics: StorageMetrics) -> Self {
        let (control, mut commands) = mpsc::unbounded_channel::<Command<T>>();
        let mut state = State {
            subscribers: HashMap::new(),
            cache: VecDeque::with_capacity(cache_size),
            cache_size,
            buffer: buffer.max(1),
            next_id: 0,
            metrics,
        };

        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    Command::Subscribe { replay, reply } => {
                        let subscribed = state.subscribe(replay);
                        let id = subscribed.id;
                        if reply.send(subscribed).is_err() {
                            state.remove(id, CloseReason::Unsubscribed);
                        }
                    }
                    Command::Unsubscribe { id } => state.remove(id, CloseReason::Unsubscribed),
                    Command::Publish(event) => state.publish(event),
                    Command::ReadCache { reply } => {
                        let _ = reply.send(state.cache.iter().cloned().collect());
                    }
                    Command::TerminateAll => {
                        info!(subscribers = state.subscribers.len(), "terminating all subscribers");
                        state.close_all(CloseReason::Terminated);
                    }
                    Command::Shutdown => break,
                }
            }
            state.close_all(CloseReason::Shutdown);
            debug!("broadcaster stopped");
        });

        Self { control }
    }

    /// Register a subscriber, optionally receiving the cached events.
    pub async fn subscribe(&self, replay: bool) -> Result<Subscription<T>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { replay, reply })?;
        let subscribed = rx.await.map_err(|_| closed())?;
        Ok(Subscription {
            id: subscribed.id,
            rx: subscribed.rx,
            closed: subscribed.closed,
            replay: subscribed.replay,
            control: self.control.clone(),
        })
    }

    /// Hand one event to every subscriber.
    pub fn publish(&self, event: T) -> Result<()> {
        self.send(Command::Publish(event))
    }

    /// Snapshot of the replay ring, oldest first.
    pub async fn read_cache(&self) -> Result<Vec<T>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReadCache { reply })?;
        rx.await.map_err(|_| closed())
    }

    /// Close every subscriber with [`CloseReason::Terminated`].
    pub fn terminate_all(&self) {
        let _ = self.control.send(Command::TerminateAll);
    }

    /// Stop the task; remaining subscribers see [`CloseReason::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.control.send(Command::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.control.is_closed()
    }

    fn send(&self, command: Command<T>) -> Result<()> {
        self.control.send(command).map_err(|_| closed())
    }
}

fn closed() -> StorageError {
    StorageError::WatchTerminated
}

/// One subscriber's end. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    closed: oneshot::Receiver<CloseReason>,
    replay: Vec<T>,
    control: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Events that were cached when the subscription started.
    pub fn take_replay(&mut self) -> Vec<T> {
        std::mem::take(&mut self.replay)
    }

    /// Next live event, or why the subscription ended.
    pub async fn recv(&mut self) -> std::result::Result<T, CloseReason> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None => Err(self.closed.try_recv().unwrap_or(CloseReason::Shutdown)),
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let _ = self.control.send(Command::Unsubscribe { id: self.id });
    }
}
