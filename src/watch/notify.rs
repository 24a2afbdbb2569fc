//! Postgres LISTEN/NOTIFY change feed.
//!
//! A trigger on the history table notifies the namespace's channel after
//! every insert, see [`notify_channel`]. One task owns the listener connection: it subscribes and
//! unsubscribes channels on request, pings the connection and hands raw
//! payloads to a consumer task. The consumer loads the full history row
//! for relevant notifications and publishes it.
//!
//! When the listener connection drops, notifications may have been lost,
//! so every subscriber is terminated and must resync. The connection is
//! then re-established with backoff and its channels re-listened.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::broadcaster::Broadcaster;
use super::{ChangeFeed, SharedEvent, WrittenEvent};
use crate::config::WatchConfig;
use crate::error::{Result, StorageError};
use crate::storage::schema::{notify_channel, validate_channel_prefix};
use crate::storage::{EntityStore, KeyPrefix};
use crate::utils::retry::listener_backoff;

/// A decoded notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub guid: String,
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: i64,
    pub folder: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawNotification {
    guid: String,
    group: String,
    resource: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    name: String,
    resource_version: i64,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    labels: Option<String>,
}

impl Notification {
    /// Parse a trigger payload. Labels arrive as a JSON-encoded string.
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: RawNotification = serde_json::from_str(payload)?;
        let labels = match raw.labels.as_deref().map(str::trim) {
            None | Some("") | Some("null") => BTreeMap::new(),
            Some(encoded) => serde_json::from_str(encoded)?,
        };
        Ok(Self {
            guid: raw.guid,
            group: raw.group,
            resource: raw.resource,
            namespace: raw.namespace,
            name: raw.name,
            resource_version: raw.resource_version,
            folder: raw.folder.unwrap_or_default(),
            labels,
        })
    }
}

type Scope = (String, String, String);

/// Channel and scope reference counts.
#[derive(Debug, Default)]
struct Registry {
    channels: HashMap<String, usize>,
    scopes: HashMap<Scope, usize>,
}

impl Registry {
    fn add(&mut self, channel: &str, scope: Scope) {
        *self.channels.entry(channel.to_string()).or_default() += 1;
        *self.scopes.entry(scope).or_default() += 1;
    }

    /// Returns true when the channel has no watchers left.
    fn remove(&mut self, channel: &str, scope: &Scope) -> bool {
        if let Some(count) = self.scopes.get_mut(scope) {
            *count -= 1;
            if *count == 0 {
                self.scopes.remove(scope);
            }
        }
        match self.channels.get_mut(channel) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.channels.remove(channel);
                true
            }
            None => false,
        }
    }

    fn is_watched(&self, group: &str, resource: &str, namespace: &str) -> bool {
        self.scopes
            .contains_key(&(group.to_string(), resource.to_string(), namespace.to_string()))
    }
}

enum ListenRequest {
    Listen {
        channel: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Unlisten {
        channel: String,
    },
}

/// Change feed driven by Postgres notifications.
pub struct NotifyFeed {
    registry: Arc<Mutex<Registry>>,
    requests: mpsc::UnboundedSender<ListenRequest>,
    channel_prefix: String,
    cancel: watch::Sender<bool>,
}

impl NotifyFeed {
    /// Spawn the listener and consumer tasks.
    ///
    /// The listener connects in the background; registrations made before
    /// it is connected complete once it is.
    pub fn start(
        pool: PgPool,
        store: EntityStore,
        broadcaster: Broadcaster<SharedEvent>,
        config: &WatchConfig,
    ) -> Result<Self> {
        validate_channel_prefix(&config.channel_prefix)?;
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (payloads_tx, payloads_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let listener = ListenerTask {
            pool,
            broadcaster: broadcaster.clone(),
            requests: requests_rx,
            payloads: payloads_tx,
            cancel: cancel_rx,
            ping_interval: config.ping_interval(),
            listening: HashSet::new(),
        };
        tokio::spawn(listener.run());
        tokio::spawn(consume(payloads_rx, registry.clone(), store, broadcaster));

        Ok(Self {
            registry,
            requests: requests_tx,
            channel_prefix: config.channel_prefix.clone(),
            cancel: cancel_tx,
        })
    }

    fn channel_for(&self, namespace: &str) -> String {
        notify_channel(&self.channel_prefix, namespace)
    }
}

fn scope_of(prefix: &KeyPrefix) -> Option<Scope> {
    prefix
        .namespace
        .as_ref()
        .map(|ns| (prefix.group.clone(), prefix.resource.clone(), ns.clone()))
}

#[async_trait]
impl ChangeFeed for NotifyFeed {
    fn name(&self) -> &'static str {
        "notify"
    }

    async fn register(&self, prefix: &KeyPrefix) -> Result<()> {
        let scope = scope_of(prefix).ok_or_else(|| {
            StorageError::BadRequest(
                "watching across namespaces needs the poll watch strategy".to_string(),
            )
        })?;
        let channel = self.channel_for(&scope.2);
        self.registry
            .lock()
            .map_err(|_| StorageError::WatchTerminated)?
            .add(&channel, scope);

        let (ack, acked) = oneshot::channel();
        let sent = self.requests.send(ListenRequest::Listen {
            channel: channel.clone(),
            ack,
        });
        let result = match sent {
            Ok(()) => acked.await.unwrap_or(Err(StorageError::WatchTerminated)),
            Err(_) => Err(StorageError::WatchTerminated),
        };
        if result.is_err() {
            self.unregister(prefix);
        }
        result
    }

    fn unregister(&self, prefix: &KeyPrefix) {
        let Some(scope) = scope_of(prefix) else {
            return;
        };
        let channel = self.channel_for(&scope.2);
        let last = match self.registry.lock() {
            Ok(mut registry) => registry.remove(&channel, &scope),
            Err(_) => return,
        };
        if last {
            let _ = self.requests.send(ListenRequest::Unlisten { channel });
        }
    }

    fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for NotifyFeed {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

struct ListenerTask {
    pool: PgPool,
    broadcaster: Broadcaster<SharedEvent>,
    requests: mpsc::UnboundedReceiver<ListenRequest>,
    payloads: mpsc::UnboundedSender<String>,
    cancel: watch::Receiver<bool>,
    ping_interval: Duration,
    listening: HashSet<String>,
}

impl ListenerTask {
    async fn connect(&self) -> Result<PgListener> {
        let channels: Vec<&str> = self.listening.iter().map(String::as_str).collect();
        let channels = &channels;
        let pool = &self.pool;
        (|| async move {
            let mut listener = PgListener::connect_with(pool).await?;
            if !channels.is_empty() {
                listener.listen_all(channels.iter().copied()).await?;
            }
            Ok::<_, StorageError>(listener)
        })
        .retry(listener_backoff())
        .notify(|err: &StorageError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "listener connection failed, retrying");
        })
        .await
    }

    async fn run(mut self) {
        let mut listener = match self.connect().await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "listener could not connect");
                return;
            }
        };
        info!("listener connected");

        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let mut lost = false;
            tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        break;
                    }
                }
                request = self.requests.recv() => {
                    let Some(request) = request else { break };
                    if let Err(e) = self.handle(&mut listener, request).await {
                        warn!(error = %e, "listen request failed");
                        lost = true;
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = sqlx::query("SELECT 1").execute(&mut listener).await {
                        warn!(error = %e, "listener ping failed");
                        lost = true;
                    }
                }
                received = listener.try_recv() => match received {
                    Ok(Some(notification)) => {
                        if self.payloads.send(notification.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("listener connection closed");
                        lost = true;
                    }
                    Err(e) => {
                        warn!(error = %e, "listener receive failed");
                        lost = true;
                    }
                },
            }

            if lost {
                self.broadcaster.terminate_all();
                listener = match self.connect().await {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!(error = %e, "listener could not reconnect");
                        break;
                    }
                };
                info!(channels = self.listening.len(), "listener reconnected");
            }
        }
        // Sessions cannot make progress without the listener.
        self.broadcaster.terminate_all();
        info!("listener stopped");
    }

    async fn handle(&mut self, listener: &mut PgListener, request: ListenRequest) -> Result<()> {
        match request {
            ListenRequest::Listen { channel, ack } => {
                if self.listening.contains(&channel) {
                    let _ = ack.send(Ok(()));
                    return Ok(());
                }
                match listener.listen(&channel).await {
                    Ok(()) => {
                        debug!(%channel, "listening");
                        self.listening.insert(channel);
                        let _ = ack.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = ack.send(Err(StorageError::BackendUnavailable(format!(
                            "cannot listen on {channel}: {e}"
                        ))));
                        Err(e.into())
                    }
                }
            }
            ListenRequest::Unlisten { channel } => {
                if self.listening.remove(&channel) {
                    debug!(%channel, "unlistening");
                    listener.unlisten(&channel).await?;
                }
                Ok(())
            }
        }
    }
}

async fn consume(
    mut payloads: mpsc::UnboundedReceiver<String>,
    registry: Arc<Mutex<Registry>>,
    store: EntityStore,
    broadcaster: Broadcaster<SharedEvent>,
) {
    while let Some(payload) = payloads.recv().await {
        let notification = match Notification::parse(&payload) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "ignoring malformed notification");
                continue;
            }
        };
        let watched = registry
            .lock()
            .map(|r| {
                r.is_watched(
                    &notification.group,
                    &notification.resource,
                    &notification.namespace,
                )
            })
            .unwrap_or(false);
        if !watched {
            continue;
        }

        match store
            .history_at(&notification.guid, notification.resource_version)
            .await
        {
            Ok(Some(entity)) => {
                store
                    .metrics()
                    .record_watch_event(&entity.group, &entity.resource);
                if broadcaster.publish(Arc::new(WrittenEvent::new(entity))).is_err() {
                    break;
                }
            }
            Ok(None) => warn!(
                guid = %notification.guid,
                resource_version = notification.resource_version,
                "notified history row not found"
            ),
            Err(e) => error!(error = %e, "failed to load notified history row"),
        }
    }
    debug!("notification consumer stopped");
}
