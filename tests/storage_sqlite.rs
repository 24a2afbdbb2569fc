//! SQLite entity store integration tests.
//!
//! Run with: cargo test --test storage_sqlite
//!
//! Uses an in-memory database by default, no external dependencies required.

mod storage;

use sqlstash::config::{Config, WatchStrategy};
use sqlstash::utils::metrics::StorageMetrics;
use sqlstash::{EntityStore, StorageError, Watcher};

/// Get SQLite connection string (in-memory for tests)
fn sqlite_uri() -> String {
    std::env::var("SQLITE_URI").unwrap_or_else(|_| "sqlite::memory:".to_string())
}

fn test_config() -> Config {
    sqlstash::utils::bootstrap::init_tracing();
    let mut config = Config::for_test();
    config.database.url = sqlite_uri();
    config.history.gc.max_age_ms = 0;
    config.history.gc.kind_max_age_ms.insert(
        storage::entity_store_tests::GC_RETAINED_KIND.to_string(),
        60 * 60 * 1000,
    );
    config
}

async fn connect(config: &Config) -> EntityStore {
    EntityStore::connect(config, StorageMetrics::global())
        .await
        .expect("Failed to open SQLite store")
}

#[tokio::test]
async fn test_sqlite_entity_store() {
    println!("=== SQLite EntityStore Tests ===");
    println!("Connecting to: {}", sqlite_uri());

    let store = connect(&test_config()).await;
    run_entity_store_tests!(&store);

    println!("=== All SQLite EntityStore tests PASSED ===");
}

#[tokio::test]
async fn test_sqlite_polling_watch() {
    println!("=== SQLite polling watch Tests ===");

    let config = test_config();
    let store = connect(&config).await;
    let watcher = Watcher::start(store.clone(), &config.watch)
        .await
        .expect("Failed to start watcher");

    run_watch_tests!(&store, &watcher);
    watcher.shutdown();

    println!("=== All SQLite polling watch tests PASSED ===");
}

#[tokio::test]
async fn test_sqlite_rejects_notify_strategy() {
    let mut config = test_config();
    config.watch.strategy = WatchStrategy::Notify;
    let store = connect(&config).await;

    let err = Watcher::start(store, &config.watch)
        .await
        .expect_err("notify needs postgres");
    assert!(matches!(err, StorageError::BadRequest(_)));
}

#[tokio::test]
async fn test_sqlite_file_database_survives_reopen() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = Config::for_test();
    config.database.url = format!("sqlite://{}?mode=rwc", dir.path().join("stash.db").display());

    let store = connect(&config).await;
    let key = storage::entity_store_tests::key("reopen", "a");
    store
        .create(sqlstash::storage::WriteRequest::new(key.clone(), "kept"))
        .await
        .unwrap();
    store.db().close().await;

    let reopened = connect(&config).await;
    assert_eq!(reopened.get(&key).await.unwrap().body, b"kept");
    assert_eq!(
        reopened.current_version("test.sqlstash.io", "reopen").await.unwrap(),
        1
    );
}
