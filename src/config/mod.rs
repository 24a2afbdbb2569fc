//! Engine configuration.
//!
//! A single [`Config`] loaded from YAML files and environment variables.
//! Every section has defaults, so an empty file (or no file) is valid.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "sqlstash.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SQLSTASH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SQLSTASH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SQLSTASH_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub watch: WatchConfig,
    pub folders: FolderConfig,
    pub history: HistoryConfig,
}

/// Database connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL. The driver is chosen from the scheme.
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
        }
    }
}

/// Which change feed drives watchers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStrategy {
    /// Tail the history table on an interval.
    #[default]
    Poll,
    /// Postgres LISTEN/NOTIFY.
    Notify,
}

/// Watch subsystem settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub strategy: WatchStrategy,
    pub poll_interval_ms: u64,
    pub poll_batch_size: u32,
    /// Events kept in the broadcaster replay ring.
    pub cache_size: usize,
    /// Per-subscriber channel capacity before the subscriber is dropped.
    pub subscriber_buffer: usize,
    /// Keepalive ping on the listener connection.
    pub ping_interval_ms: u64,
    /// Notification channel name prefix, at most 31 bytes of letters, digits
    /// and `_`. A digest of the namespace is appended.
    pub channel_prefix: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            strategy: WatchStrategy::Poll,
            poll_interval_ms: 5000,
            poll_batch_size: 100,
            cache_size: 100,
            subscriber_buffer: 100,
            ping_interval_ms: 500,
            channel_prefix: "entity_".to_string(),
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Identifies the folder kind whose writes trigger a tree rebuild.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    pub group: String,
    pub resource: String,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            group: "folder.grafana.app".to_string(),
            resource: "folders".to_string(),
        }
    }
}

impl FolderConfig {
    pub fn is_folder_kind(&self, group: &str, resource: &str) -> bool {
        self.group == group && self.resource == resource
    }
}

/// History retention settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Enables [`crate::storage::EntityStore::purge_history`].
    pub allow_purge: bool,
    /// History rows the background pruner keeps per key; 0 keeps all.
    pub max_versions: u32,
    /// A written key is pruned once no write touched it for this long...
    pub prune_min_wait_ms: u64,
    /// ...or this long after the first write still waiting, whichever
    /// comes first.
    pub prune_max_wait_ms: u64,
    pub gc: GcConfig,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            allow_purge: false,
            max_versions: 20,
            prune_min_wait_ms: 30_000,
            prune_max_wait_ms: 300_000,
            gc: GcConfig::default(),
        }
    }
}

impl HistoryConfig {
    pub fn prune_min_wait(&self) -> Duration {
        Duration::from_millis(self.prune_min_wait_ms)
    }

    pub fn prune_max_wait(&self) -> Duration {
        Duration::from_millis(self.prune_max_wait_ms)
    }
}

/// Garbage collection of deleted keys' history.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Deleted keys older than this lose their history.
    pub max_age_ms: u64,
    /// Per-kind retention overrides keyed by `group/resource`.
    pub kind_max_age_ms: HashMap<String, u64>,
    /// Keys collected per transaction.
    pub batch_size: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 15 * 60 * 1000,
            max_age_ms: 24 * 60 * 60 * 1000,
            kind_max_age_ms: HashMap::new(),
            batch_size: 500,
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Retention for one kind.
    pub fn max_age(&self, group: &str, resource: &str) -> Duration {
        let ms = self
            .kind_max_age_ms
            .get(&format!("{group}/{resource}"))
            .copied()
            .unwrap_or(self.max_age_ms);
        Duration::from_millis(ms)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `sqlstash.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `SQLSTASH_CONFIG` environment variable (if set)
    /// 4. Environment variables such as `SQLSTASH__DATABASE__URL`
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Config for tests: in-memory SQLite, a fast poll interval and a
    /// pruner that acts within a fraction of a second.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.watch.poll_interval_ms = 50;
        config.history.prune_min_wait_ms = 20;
        config.history.prune_max_wait_ms = 200;
        config.history.gc.interval_ms = 50;
        config
    }
}
