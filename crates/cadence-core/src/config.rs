use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CACHE_ENTRIES: usize = 256;
pub const DEFAULT_SITE: i64 = 1;
/// Upper bound on rows touched by a single clear-all request.
pub const DEFAULT_CLEAR_LIMIT: usize = 100;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Named recurrences (`hourly`, `daily`, ...) and their intervals.
    #[serde(default = "default_recurrences")]
    pub recurrences: Vec<RecurrenceConfig>,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            recurrences: default_recurrences(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits on a lock held by another process before
    /// the store reports itself unavailable.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of filtered-query results held per store handle.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tenant the CLI and the default connector act for.
    #[serde(default = "default_site")]
    pub site: i64,
    #[serde(default = "default_clear_limit")]
    pub clear_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            site: DEFAULT_SITE,
            clear_limit: DEFAULT_CLEAR_LIMIT,
        }
    }
}

/// A named recurrence, e.g. `hourly` every 3600 seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceConfig {
    pub name: String,
    pub interval: u64,
}

impl RecurrenceConfig {
    pub fn new(name: impl Into<String>, interval: u64) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }
}

fn default_recurrences() -> Vec<RecurrenceConfig> {
    vec![
        RecurrenceConfig::new("hourly", 3_600),
        RecurrenceConfig::new("twicedaily", 43_200),
        RecurrenceConfig::new("daily", 86_400),
        RecurrenceConfig::new("weekly", 604_800),
    ]
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_cache_entries() -> usize {
    DEFAULT_CACHE_ENTRIES
}
fn default_site() -> i64 {
    DEFAULT_SITE
}
fn default_clear_limit() -> usize {
    DEFAULT_CLEAR_LIMIT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// Nested keys are separated by a double underscore in the environment,
    /// e.g. `CADENCE_DATABASE__BUSY_TIMEOUT_MS=250`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading configuration");

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if let Some(bad) = self.recurrences.iter().find(|r| r.interval == 0) {
            return Err(crate::error::CadenceError::Config(format!(
                "recurrence '{}' must have a non-zero interval",
                bad.name
            )));
        }
        if self.scheduler.clear_limit == 0 {
            return Err(crate::error::CadenceError::Config(
                "scheduler.clear_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
