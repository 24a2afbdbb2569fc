//! Watch contract tests.
//!
//! Run against a started [`Watcher`] of any strategy. Each test uses its own
//! resource, so the first write it makes is version 1.

use std::time::Duration;

use sqlstash::storage::{
    DeleteRequest, EntityMeta, LabelSelector, Requirement, WriteRequest,
};
use sqlstash::watch::{SessionState, WatchSession, INITIAL_EVENTS_END_ANNOTATION};
use sqlstash::{EntityStore, StorageError, WatchEvent, WatchEventType, WatchRequest, Watcher};

use super::entity_store_tests::{key, prefix};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn next_event(session: &mut WatchSession) -> WatchEvent {
    tokio::time::timeout(EVENT_TIMEOUT, session.next())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch ended unexpectedly")
        .expect("watch failed")
}

pub async fn test_watch_from_now(store: &EntityStore, watcher: &Watcher) {
    let mut session = watcher
        .watch(WatchRequest::new(prefix("watch_now")))
        .await
        .expect("watch should start");

    let k = key("watch_now", "a");
    store.create(WriteRequest::new(k.clone(), "1")).await.unwrap();
    store.update(WriteRequest::new(k.clone(), "2")).await.unwrap();
    store.delete(DeleteRequest::new(k)).await.unwrap();

    let added = next_event(&mut session).await;
    assert_eq!(added.kind, WatchEventType::Added);
    assert_eq!(added.entity.resource_version, 1);

    let modified = next_event(&mut session).await;
    assert_eq!(modified.kind, WatchEventType::Modified);
    assert_eq!(modified.entity.resource_version, 2);
    assert_eq!(modified.entity.body, b"2");

    let deleted = next_event(&mut session).await;
    assert_eq!(deleted.kind, WatchEventType::Deleted);
    assert_eq!(deleted.entity.resource_version, 3);
    assert_eq!(deleted.entity.body, b"2");
    assert_eq!(session.state(), SessionState::Streaming);
}

pub async fn test_watch_since_version(store: &EntityStore, watcher: &Watcher) {
    let k = key("watch_since", "a");
    store.create(WriteRequest::new(k.clone(), "1")).await.unwrap();
    store.update(WriteRequest::new(k.clone(), "2")).await.unwrap();
    store.update(WriteRequest::new(k.clone(), "3")).await.unwrap();

    let mut session = watcher
        .watch(WatchRequest::new(prefix("watch_since")).since(1))
        .await
        .expect("watch should start");
    store.update(WriteRequest::new(k, "4")).await.unwrap();

    for rv in 2..=4 {
        let event = next_event(&mut session).await;
        assert_eq!(event.kind, WatchEventType::Modified);
        assert_eq!(event.entity.resource_version, rv, "no gaps and no duplicates");
    }
}

pub async fn test_watch_initial_events(store: &EntityStore, watcher: &Watcher) {
    for name in ["b", "a"] {
        store
            .create(WriteRequest::new(key("watch_initial", name), "{}"))
            .await
            .unwrap();
    }

    let mut session = watcher
        .watch(WatchRequest::new(prefix("watch_initial")).with_initial_events(true))
        .await
        .expect("watch should start");

    let first = next_event(&mut session).await;
    let second = next_event(&mut session).await;
    assert_eq!((first.kind, first.entity.name.as_str()), (WatchEventType::Added, "a"));
    assert_eq!((second.kind, second.entity.name.as_str()), (WatchEventType::Added, "b"));

    let bookmark = next_event(&mut session).await;
    assert_eq!(bookmark.kind, WatchEventType::Bookmark);
    assert_eq!(bookmark.entity.resource_version, 2);
    assert_eq!(
        bookmark
            .entity
            .meta
            .annotations
            .get(INITIAL_EVENTS_END_ANNOTATION)
            .map(String::as_str),
        Some("true")
    );

    store
        .create(WriteRequest::new(key("watch_initial", "c"), "{}"))
        .await
        .unwrap();
    let live = next_event(&mut session).await;
    assert_eq!(live.entity.name, "c");
    assert_eq!(live.entity.resource_version, 3);
}

pub async fn test_watch_selector_transitions(store: &EntityStore, watcher: &Watcher) {
    let prod = LabelSelector::everything().with(Requirement::equals("env", "prod"));
    let mut session = watcher
        .watch(WatchRequest::new(prefix("watch_selector")).with_selector(prod))
        .await
        .expect("watch should start");

    let k = key("watch_selector", "a");
    let labelled = |body: &str, env: &str| {
        WriteRequest::new(k.clone(), body).with_meta(EntityMeta::default().with_label("env", env))
    };
    store.create(labelled("dev-1", "dev")).await.unwrap(); // rv 1, never matched
    store.update(labelled("prod-1", "prod")).await.unwrap(); // rv 2, enters
    store.update(labelled("prod-2", "prod")).await.unwrap(); // rv 3, stays
    store.update(labelled("dev-2", "dev")).await.unwrap(); // rv 4, leaves

    let entered = next_event(&mut session).await;
    assert_eq!(entered.kind, WatchEventType::Added);
    assert_eq!(entered.entity.resource_version, 2);

    let stayed = next_event(&mut session).await;
    assert_eq!(stayed.kind, WatchEventType::Modified);
    assert_eq!(stayed.entity.resource_version, 3);

    let left = next_event(&mut session).await;
    assert_eq!(left.kind, WatchEventType::Deleted);
    assert_eq!(left.entity.resource_version, 4);
    assert_eq!(left.entity.body, b"prod-2", "carries the last matching body");
}

pub async fn test_watch_cancel(store: &EntityStore, watcher: &Watcher) {
    let session = watcher
        .watch(WatchRequest::new(prefix("watch_cancel")))
        .await
        .expect("watch should start");
    let mut changes = session.state_changes();
    session.cancel();
    tokio::time::timeout(EVENT_TIMEOUT, changes.wait_for(SessionState::is_finished))
        .await
        .expect("session did not stop")
        .expect("state channel closed");
    assert_eq!(session.state(), SessionState::Cancelled);

    // Other sessions are unaffected.
    let mut other = watcher
        .watch(WatchRequest::new(prefix("watch_cancel")))
        .await
        .unwrap();
    store
        .create(WriteRequest::new(key("watch_cancel", "a"), "{}"))
        .await
        .unwrap();
    assert_eq!(next_event(&mut other).await.kind, WatchEventType::Added);
}

pub async fn test_watch_terminated_by_broadcaster(_store: &EntityStore, watcher: &Watcher) {
    let mut session = watcher
        .watch(WatchRequest::new(prefix("watch_terminate")))
        .await
        .expect("watch should start");
    watcher.broadcaster().terminate_all();

    let item = tokio::time::timeout(EVENT_TIMEOUT, session.next())
        .await
        .expect("session did not end");
    assert!(matches!(item, Some(Err(StorageError::WatchTerminated))));
}

/// Run all watch contract tests against a started watcher.
#[macro_export]
macro_rules! run_watch_tests {
    ($store:expr, $watcher:expr) => {
        use $crate::storage::watch_tests::*;

        test_watch_from_now($store, $watcher).await;
        println!("  test_watch_from_now: PASSED");

        test_watch_since_version($store, $watcher).await;
        println!("  test_watch_since_version: PASSED");

        test_watch_initial_events($store, $watcher).await;
        println!("  test_watch_initial_events: PASSED");

        test_watch_selector_transitions($store, $watcher).await;
        println!("  test_watch_selector_transitions: PASSED");

        test_watch_cancel($store, $watcher).await;
        println!("  test_watch_cancel: PASSED");

        test_watch_terminated_by_broadcaster($store, $watcher).await;
        println!("  test_watch_terminated_by_broadcaster: PASSED");
    };
}
