//! EntityStore contract tests.
//!
//! Every test writes to its own resource so version counters start at 1
//! regardless of what ran before against the same database.
//!
//! The harness config must come from `Config::for_test()` with
//! `history.gc.max_age_ms = 0` and a one hour retention override for
//! `test.sqlstash.io/gc_retained`, see [`GC_RETAINED_KIND`].

use std::time::Duration;

use sqlstash::storage::{
    compute_etag, Action, DeleteRequest, EntityMeta, Key, KeyPrefix, LabelSelector, ListRequest, Operator,
    Requirement, ResourceStats, WriteRequest, WriteStatus, FOLDER_LABEL, LIST_DELETED_LABEL,
    SORT_BY_LABEL,
};
use sqlstash::{EntityStore, ErrorKind, StorageError};

/// Kind whose deleted keys outlive a garbage collection pass.
pub const GC_RETAINED_KIND: &str = "test.sqlstash.io/gc_retained";

pub fn key(resource: &str, name: &str) -> Key {
    Key::new("test.sqlstash.io", resource, "default", name).expect("valid key")
}

pub fn prefix(resource: &str) -> KeyPrefix {
    KeyPrefix::kind("test.sqlstash.io", resource).in_namespace("default")
}

fn selector(key: &str, op: Operator, values: &[&str]) -> LabelSelector {
    LabelSelector::everything().with(
        Requirement::new(key, op, values.iter().map(|v| v.to_string()).collect())
            .expect("valid requirement"),
    )
}

async fn list_names(store: &EntityStore, req: ListRequest) -> Vec<String> {
    store
        .list(&req)
        .await
        .expect("list should succeed")
        .items
        .into_iter()
        .map(|e| e.name)
        .collect()
}

// =============================================================================
// Write lifecycle
// =============================================================================

pub async fn test_write_lifecycle(store: &EntityStore) {
    let k = key("lifecycle", "a");

    let created = store
        .create(WriteRequest::new(k.clone(), "v1").by("alice"))
        .await
        .expect("create should succeed");
    assert_eq!(created.status, WriteStatus::Created);
    assert_eq!(created.entity.resource_version, 1);
    assert_eq!(
        created.entity.etag,
        compute_etag(b"v1", &EntityMeta::default(), b"").unwrap()
    );

    let updated = store
        .update(WriteRequest::new(k.clone(), "v2").expecting("1").by("bob"))
        .await
        .expect("update should succeed");
    assert_eq!(updated.status, WriteStatus::Updated);
    assert_eq!(updated.entity.resource_version, 2);
    assert_eq!(updated.entity.previous_version, 1);
    assert_ne!(updated.entity.etag, created.entity.etag);

    let unchanged = store
        .update(WriteRequest::new(k.clone(), "v2"))
        .await
        .expect("identical update should succeed");
    assert_eq!(unchanged.status, WriteStatus::Unchanged);
    assert_eq!(unchanged.entity.resource_version, 2);

    let deleted = store
        .delete(DeleteRequest::new(k.clone()).expecting("2"))
        .await
        .expect("delete should succeed");
    assert_eq!(deleted.status, WriteStatus::Deleted);
    assert_eq!(deleted.entity.resource_version, 3);
    assert_eq!(deleted.entity.body, b"v2");

    let history = store.history(&k).await.expect("history should succeed");
    let versions: Vec<i64> = history.iter().map(|v| v.resource_version).collect();
    assert_eq!(versions, vec![3, 2, 1], "history is newest first");
    assert_eq!(history[0].action, Action::Deleted);
    assert_eq!(history[2].action, Action::Created);

    let err = store.get(&k).await.expect_err("deleted entity is gone");
    assert!(matches!(err, StorageError::NotFound { .. }));

    let old = store.read(&k, Some(2)).await.expect("read at version");
    assert_eq!(old.body, b"v2");
    assert_eq!(old.resource_version, 2);
    assert_eq!(old.updated_by, "bob");
    assert_eq!(old.created_by, "alice");
}

pub async fn test_create_existing_fails(store: &EntityStore) {
    let k = key("create_existing", "a");
    store
        .create(WriteRequest::new(k.clone(), "{}"))
        .await
        .expect("create should succeed");
    let err = store
        .create(WriteRequest::new(k, "{}"))
        .await
        .expect_err("second create must fail");
    assert!(matches!(err, StorageError::AlreadyExists { .. }));
    assert_eq!(err.to_status().kind, ErrorKind::AlreadyExists);
    assert_eq!(
        store
            .current_version("test.sqlstash.io", "create_existing")
            .await
            .unwrap(),
        1
    );
}

pub async fn test_optimistic_lock(store: &EntityStore) {
    let k = key("optimistic", "a");
    store.create(WriteRequest::new(k.clone(), "1")).await.unwrap();
    store.update(WriteRequest::new(k.clone(), "2")).await.unwrap();

    let err = store
        .update(WriteRequest::new(k.clone(), "3").expecting("1"))
        .await
        .expect_err("stale update must fail");
    assert!(err.is_conflict());
    assert!(matches!(
        err,
        StorageError::OptimisticLockFailed {
            expected: 1,
            actual: 2,
            ..
        }
    ));

    let err = store
        .delete(DeleteRequest::new(k.clone()).expecting("1"))
        .await
        .expect_err("stale delete must fail");
    assert!(err.is_conflict());
    // Nothing was written by the failed attempts.
    assert_eq!(store.get(&k).await.unwrap().resource_version, 2);
}

pub async fn test_missing_entities(store: &EntityStore) {
    let k = key("missing", "ghost");
    let empty = store.read(&k, None).await.expect("read never fails on missing");
    assert!(empty.is_empty());

    let err = store
        .update(WriteRequest::new(k.clone(), "{}"))
        .await
        .expect_err("update of missing entity");
    assert!(matches!(err, StorageError::NotFound { .. }));

    let err = store
        .delete(DeleteRequest::new(k))
        .await
        .expect_err("delete of missing entity");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

pub async fn test_invalid_input(store: &EntityStore) {
    assert!(matches!(
        Key::new("test.sqlstash.io", "invalid", "default", ""),
        Err(StorageError::InvalidKey(_))
    ));
    assert!(matches!(
        Key::new("test.sqlstash.io", "invalid", "default", "a/b"),
        Err(StorageError::InvalidKey(_))
    ));

    let k = key("invalid", "a");
    store.create(WriteRequest::new(k.clone(), "{}")).await.unwrap();
    let err = store
        .update(WriteRequest::new(k.clone(), "{}").expecting("not-a-number"))
        .await
        .expect_err("malformed version");
    assert!(matches!(err, StorageError::BadRequest(_)));

    // Version 0 reads the live row; negative versions are rejected.
    let latest = store.read(&k, Some(0)).await.expect("read at 0");
    assert_eq!(latest.resource_version, 1);
    assert_eq!(latest, store.read(&k, None).await.unwrap());
    let err = store
        .read(&k, Some(-1))
        .await
        .expect_err("negative version");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

pub async fn test_versions_are_per_kind(store: &EntityStore) {
    store
        .create(WriteRequest::new(key("per_kind_a", "x"), "{}"))
        .await
        .unwrap();
    store
        .create(WriteRequest::new(key("per_kind_a", "y"), "{}"))
        .await
        .unwrap();
    let other = store
        .create(WriteRequest::new(key("per_kind_b", "x"), "{}"))
        .await
        .unwrap();
    assert_eq!(other.entity.resource_version, 1);

    let latest = store.latest_versions().await.unwrap();
    let a = latest
        .iter()
        .find(|k| k.resource == "per_kind_a")
        .expect("kind a has a counter");
    assert_eq!(a.resource_version, 2);
}

// =============================================================================
// List
// =============================================================================

pub async fn test_list_pages_by_name(store: &EntityStore) {
    for name in ["e", "c", "a", "d", "b"] {
        store
            .create(WriteRequest::new(key("paging", name), "{}"))
            .await
            .unwrap();
    }

    let mut names = Vec::new();
    let mut req = ListRequest::new(prefix("paging")).with_limit(2);
    let mut pages = 0;
    loop {
        let page = store.list(&req).await.expect("list should succeed");
        assert!(page.items.len() <= 2);
        assert_eq!(page.resource_version, 5);
        names.extend(page.items.into_iter().map(|e| e.name));
        pages += 1;
        if page.next_page_token.is_empty() {
            break;
        }
        req = req.continuing(page.next_page_token);
    }
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(pages, 3);
}

pub async fn test_list_sorted_descending(store: &EntityStore) {
    for name in ["a", "b", "c"] {
        store
            .create(WriteRequest::new(key("sorting", name), "{}"))
            .await
            .unwrap();
    }
    let sort = selector(SORT_BY_LABEL, Operator::Equals, &["-name"]);

    let first = store
        .list(&ListRequest::new(prefix("sorting")).with_selector(sort.clone()).with_limit(2))
        .await
        .unwrap();
    let names: Vec<&str> = first.items.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["c", "b"]);
    assert!(!first.next_page_token.is_empty());

    let rest = list_names(
        store,
        ListRequest::new(prefix("sorting"))
            .with_selector(sort)
            .with_limit(2)
            .continuing(first.next_page_token),
    )
    .await;
    assert_eq!(rest, vec!["a"]);
}

pub async fn test_list_label_selector(store: &EntityStore) {
    let labelled = |name: &str, env: &str| {
        WriteRequest::new(key("labels", name), "{}")
            .with_meta(EntityMeta::default().with_label("env", env))
    };
    store.create(labelled("a", "prod")).await.unwrap();
    store.create(labelled("b", "dev")).await.unwrap();
    store.create(labelled("c", "prod")).await.unwrap();

    let prod = list_names(
        store,
        ListRequest::new(prefix("labels"))
            .with_selector(selector("env", Operator::Equals, &["prod"])),
    )
    .await;
    assert_eq!(prod, vec!["a", "c"]);

    // Relabelling moves an entity between result sets.
    store.update(labelled("a", "dev")).await.unwrap();
    let prod = list_names(
        store,
        ListRequest::new(prefix("labels"))
            .with_selector(selector("env", Operator::Equals, &["prod"])),
    )
    .await;
    assert_eq!(prod, vec!["c"]);
}

pub async fn test_list_reserved_keys_need_equality(store: &EntityStore) {
    let err = store
        .list(
            &ListRequest::new(prefix("reserved"))
                .with_selector(selector(FOLDER_LABEL, Operator::NotEquals, &["x"])),
        )
        .await
        .expect_err("!= on a reserved key");
    assert!(matches!(err, StorageError::BadRequest(_)));

    let err = store
        .list(&ListRequest::new(prefix("reserved")).continuing("%%%"))
        .await
        .expect_err("garbage continue token");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

pub async fn test_list_in_folder(store: &EntityStore) {
    let in_folder = |name: &str, folder: &str| {
        WriteRequest::new(key("foldered", name), "{}")
            .with_meta(EntityMeta::default().in_folder(folder))
    };
    store.create(in_folder("a", "f1")).await.unwrap();
    store.create(in_folder("b", "f2")).await.unwrap();
    store.create(in_folder("c", "f1")).await.unwrap();
    store
        .create(WriteRequest::new(key("foldered", "d"), "{}"))
        .await
        .unwrap();

    let f1 = list_names(
        store,
        ListRequest::new(prefix("foldered"))
            .with_selector(selector(FOLDER_LABEL, Operator::Equals, &["f1"])),
    )
    .await;
    assert_eq!(f1, vec!["a", "c"]);

    let either = list_names(
        store,
        ListRequest::new(prefix("foldered"))
            .with_selector(selector(FOLDER_LABEL, Operator::In, &["f1", "f2"])),
    )
    .await;
    assert_eq!(either, vec!["a", "b", "c"]);
}

pub async fn test_list_deleted(store: &EntityStore) {
    for name in ["a", "b", "c"] {
        store
            .create(WriteRequest::new(key("trash", name), name))
            .await
            .unwrap();
    }
    store.delete(DeleteRequest::new(key("trash", "c"))).await.unwrap();
    store.delete(DeleteRequest::new(key("trash", "a"))).await.unwrap();
    // Recreated after deletion: no longer in the trash.
    store.create(WriteRequest::new(key("trash", "a"), "again")).await.unwrap();

    let trash = store
        .list(
            &ListRequest::new(prefix("trash"))
                .with_selector(selector(LIST_DELETED_LABEL, Operator::Equals, &["true"])),
        )
        .await
        .unwrap();
    assert_eq!(trash.items.len(), 1);
    assert_eq!(trash.items[0].name, "c");
    assert_eq!(trash.items[0].action, Action::Deleted);
    assert_eq!(trash.items[0].body, b"c");

    let live = list_names(store, ListRequest::new(prefix("trash"))).await;
    assert_eq!(live, vec!["a", "b"]);
}

pub async fn test_list_at_revision(store: &EntityStore) {
    store.create(WriteRequest::new(key("revision", "a"), "1")).await.unwrap();
    store.create(WriteRequest::new(key("revision", "b"), "1")).await.unwrap();
    store.update(WriteRequest::new(key("revision", "a"), "2")).await.unwrap();
    store.delete(DeleteRequest::new(key("revision", "b"))).await.unwrap();
    store.create(WriteRequest::new(key("revision", "c"), "1")).await.unwrap();

    let at = |rv: i64| ListRequest::new(prefix("revision")).at_version(rv);

    let v2 = store.list(&at(2)).await.expect("list at 2");
    assert_eq!(v2.resource_version, 2);
    let bodies: Vec<(&str, &[u8])> = v2
        .items
        .iter()
        .map(|e| (e.name.as_str(), e.body.as_slice()))
        .collect();
    assert_eq!(bodies, vec![("a", b"1".as_slice()), ("b", b"1".as_slice())]);

    assert_eq!(list_names(store, at(4)).await, vec!["a"]);
    assert_eq!(
        list_names(store, ListRequest::new(prefix("revision"))).await,
        vec!["a", "c"]
    );

    // Pages of a revision list stay pinned to it.
    let first = store.list(&at(3).with_limit(1)).await.unwrap();
    assert_eq!(first.items[0].name, "a");
    assert_eq!(first.items[0].body, b"2");
    let second = store
        .list(&ListRequest::new(prefix("revision")).continuing(first.next_page_token.clone()))
        .await
        .unwrap();
    assert_eq!(second.resource_version, 3);
    assert_eq!(
        second.items.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["b"]
    );
    assert!(second.next_page_token.is_empty());

    let err = store
        .list(&at(4).with_limit(1).continuing(first.next_page_token))
        .await
        .expect_err("token from another revision");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    let err = store.list(&at(99)).await.expect_err("future revision");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

pub async fn test_resource_stats(store: &EntityStore) {
    for name in ["a", "b", "c"] {
        store
            .create(WriteRequest::new(key("stats", name), "{}"))
            .await
            .unwrap();
    }
    let elsewhere = Key::new("test.sqlstash.io", "stats", "elsewhere", "a").unwrap();
    store.create(WriteRequest::new(elsewhere, "{}")).await.unwrap();
    store.delete(DeleteRequest::new(key("stats", "c"))).await.unwrap();

    let ours = |stats: &[ResourceStats]| -> Vec<(String, i64, i64)> {
        stats
            .iter()
            .filter(|s| s.group == "test.sqlstash.io" && s.resource == "stats")
            .map(|s| (s.namespace.clone(), s.count, s.resource_version))
            .collect()
    };

    let all = store.resource_stats(None, 0).await.expect("stats");
    assert_eq!(
        ours(&all),
        vec![("default".to_string(), 2, 5), ("elsewhere".to_string(), 1, 5)]
    );

    let default = store.resource_stats(Some("default"), 0).await.unwrap();
    assert!(default.iter().all(|s| s.namespace == "default"));
    assert_eq!(ours(&default), vec![("default".to_string(), 2, 5)]);

    // Only kinds with more than min_count objects.
    let busy = store.resource_stats(None, 1).await.unwrap();
    assert_eq!(ours(&busy), vec![("default".to_string(), 2, 5)]);
    assert!(busy.iter().all(|s| s.count > 1));
}

// =============================================================================
// History
// =============================================================================

pub async fn test_history_since(store: &EntityStore) {
    let k = key("history_since", "a");
    store.create(WriteRequest::new(k.clone(), "1")).await.unwrap();
    store.update(WriteRequest::new(k.clone(), "2")).await.unwrap();
    store.update(WriteRequest::new(k.clone(), "3")).await.unwrap();

    let rows = store
        .history_since("test.sqlstash.io", "history_since", 1, 10)
        .await
        .unwrap();
    let versions: Vec<i64> = rows.iter().map(|e| e.resource_version).collect();
    assert_eq!(versions, vec![2, 3], "oldest first, strictly after");

    let limited = store
        .history_since("test.sqlstash.io", "history_since", 0, 2)
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);

    let guid = rows[0].guid.clone();
    let at = store.history_at(&guid, 3).await.unwrap().expect("row at 3");
    assert_eq!(at.body, b"3");
    assert!(store.history_at(&guid, 99).await.unwrap().is_none());
}

pub async fn test_history_pruned_to_max_versions(store: &EntityStore) {
    let busy = key("pruned", "busy");
    let quiet = key("pruned", "quiet");
    store.create(WriteRequest::new(busy.clone(), "0")).await.unwrap();
    for i in 1..25 {
        store
            .update(WriteRequest::new(busy.clone(), i.to_string()))
            .await
            .unwrap();
    }
    store.create(WriteRequest::new(quiet.clone(), "0")).await.unwrap();
    store.update(WriteRequest::new(quiet.clone(), "1")).await.unwrap();

    // The pruner runs in the background once the key goes quiet.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let history = loop {
        let history = store.history(&busy).await.unwrap();
        if history.len() == 20 {
            break history;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "history still has {} rows",
            history.len()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(history[0].resource_version, 25);
    assert_eq!(history[19].resource_version, 6);
    assert_eq!(store.get(&busy).await.unwrap().body, b"24");
    assert_eq!(store.history(&quiet).await.unwrap().len(), 2);
}

pub async fn test_garbage_collection(store: &EntityStore) {
    let (retained_group, retained_resource) =
        GC_RETAINED_KIND.split_once('/').expect("group/resource");
    let retained = Key::new(retained_group, retained_resource, "default", "a").unwrap();

    for name in ["gone", "recreated", "alive"] {
        store
            .create(WriteRequest::new(key("gc", name), "{}"))
            .await
            .unwrap();
    }
    store.create(WriteRequest::new(retained.clone(), "{}")).await.unwrap();
    store.delete(DeleteRequest::new(key("gc", "gone"))).await.unwrap();
    store.delete(DeleteRequest::new(key("gc", "recreated"))).await.unwrap();
    store.create(WriteRequest::new(key("gc", "recreated"), "again")).await.unwrap();
    store.delete(DeleteRequest::new(retained.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let collected = store.collect_garbage().await.expect("gc pass");
    assert!(collected >= 1, "collected {collected}");

    assert!(store.history(&key("gc", "gone")).await.unwrap().is_empty());
    assert_eq!(store.history(&key("gc", "recreated")).await.unwrap().len(), 3);
    assert_eq!(store.history(&key("gc", "alive")).await.unwrap().len(), 1);
    assert_eq!(store.history(&retained).await.unwrap().len(), 2);

    let trash = store
        .list(
            &ListRequest::new(prefix("gc"))
                .with_selector(selector(LIST_DELETED_LABEL, Operator::Equals, &["true"])),
        )
        .await
        .unwrap();
    assert!(trash.items.is_empty());

    // Nothing left to collect.
    assert_eq!(store.collect_garbage().await.unwrap(), 0);
}

// =============================================================================
// Folders
// =============================================================================

pub async fn test_folder_index(store: &EntityStore) {
    let folder = |name: &str, parent: &str, title: &str| {
        let key = Key::new("folder.grafana.app", "folders", "folders-ns", name).unwrap();
        let mut meta = EntityMeta::default().titled(title);
        if !parent.is_empty() {
            meta = meta.in_folder(parent);
        }
        WriteRequest::new(key, "{}").with_meta(meta)
    };
    store.create(folder("top", "", "Top")).await.unwrap();
    store.create(folder("child", "top", "Child")).await.unwrap();
    store.create(folder("orphan", "nowhere", "Orphan")).await.unwrap();

    let index = store.folder_index();
    let folders = index.list("folders-ns").await.unwrap();
    assert_eq!(folders.len(), 3);

    let top = folders.iter().find(|f| f.uid == "top").unwrap();
    let child = folders.iter().find(|f| f.uid == "child").unwrap();
    let orphan = folders.iter().find(|f| f.uid == "orphan").unwrap();
    assert_eq!((top.lft, top.rgt, top.depth), (2, 5, 1));
    assert_eq!((child.lft, child.rgt, child.depth), (3, 4, 2));
    assert_eq!(child.slug_path, "/top/child");
    assert!(!top.detached);
    assert!(orphan.detached);
    assert!(orphan.lft > top.rgt);
    for f in &folders {
        assert_eq!((f.rgt - f.lft - 1) % 2, 0, "{} is well formed", f.uid);
    }

    let subtree = index.subtree("folders-ns", "top").await.unwrap();
    let uids: Vec<&str> = subtree.iter().map(|f| f.uid.as_str()).collect();
    assert_eq!(uids, vec!["top", "child"]);

    // Deleting the parent turns the child into a lost folder.
    store
        .delete(DeleteRequest::new(
            Key::new("folder.grafana.app", "folders", "folders-ns", "top").unwrap(),
        ))
        .await
        .unwrap();
    let folders = index.list("folders-ns").await.unwrap();
    assert_eq!(folders.len(), 2);
    assert!(folders.iter().all(|f| f.detached));
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all EntityStore contract tests against a store.
#[macro_export]
macro_rules! run_entity_store_tests {
    ($store:expr) => {
        use $crate::storage::entity_store_tests::*;

        test_write_lifecycle($store).await;
        println!("  test_write_lifecycle: PASSED");

        test_create_existing_fails($store).await;
        println!("  test_create_existing_fails: PASSED");

        test_optimistic_lock($store).await;
        println!("  test_optimistic_lock: PASSED");

        test_missing_entities($store).await;
        println!("  test_missing_entities: PASSED");

        test_invalid_input($store).await;
        println!("  test_invalid_input: PASSED");

        test_versions_are_per_kind($store).await;
        println!("  test_versions_are_per_kind: PASSED");

        test_list_pages_by_name($store).await;
        println!("  test_list_pages_by_name: PASSED");

        test_list_sorted_descending($store).await;
        println!("  test_list_sorted_descending: PASSED");

        test_list_label_selector($store).await;
        println!("  test_list_label_selector: PASSED");

        test_list_reserved_keys_need_equality($store).await;
        println!("  test_list_reserved_keys_need_equality: PASSED");

        test_list_in_folder($store).await;
        println!("  test_list_in_folder: PASSED");

        test_list_deleted($store).await;
        println!("  test_list_deleted: PASSED");

        test_list_at_revision($store).await;
        println!("  test_list_at_revision: PASSED");

        test_resource_stats($store).await;
        println!("  test_resource_stats: PASSED");

        test_history_since($store).await;
        println!("  test_history_since: PASSED");

        test_folder_index($store).await;
        println!("  test_folder_index: PASSED");

        test_history_pruned_to_max_versions($store).await;
        println!("  test_history_pruned_to_max_versions: PASSED");

        // Collects every kind's old deletes, so it runs last.
        test_garbage_collection($store).await;
        println!("  test_garbage_collection: PASSED");
    };
}
