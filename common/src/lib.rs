/*!
common/src/lib.rs

Shared configuration types and DB helper functions for newsdigest.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file, with default/override merging
- A helper to initialize an SQLite connection pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsdigest.db")
    pub path: String,
}

/// A single feed source. Feeds are fetched in declared order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    /// Label used when an entry carries no source of its own
    pub label: Option<String>,
}

/// Politeness / fetching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolitenessConfig {
    pub fetch_timeout_seconds: Option<u64>,
    /// Maximum number of feeds fetched at the same time
    pub concurrency: Option<usize>,
}

/// How the recency filter interprets "recent"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecencyMode {
    /// Published within the last `hours` hours
    Rolling,
    /// Published on the current calendar date in the configured UTC offset
    CalendarDay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecencyConfig {
    pub mode: RecencyMode,
    pub hours: i64,
    pub utc_offset_hours: i32,
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self {
            mode: RecencyMode::Rolling,
            hours: 24,
            utc_offset_hours: 0,
        }
    }
}

/// Dedup and window tuning. Missing keys fall back to `Default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Records older than this are evicted at the start of every run
    pub retention_hours: i64,
    /// Age limit of the in-memory comparison window
    pub window_hours: i64,
    /// Count limit of the in-memory comparison window
    pub window_max_records: usize,
    pub lexical_threshold: f64,
    pub semantic_threshold: f64,
    /// Number of duplicate signals that must agree (1 = any signal)
    pub min_signals: usize,
    pub max_items_per_category: Option<usize>,
    pub recency: RecencyConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retention_hours: 72,
            window_hours: 72,
            window_max_records: 2000,
            lexical_threshold: 0.8,
            semantic_threshold: 0.88,
            min_signals: 1,
            max_items_per_category: None,
            recency: RecencyConfig::default(),
        }
    }
}

/// Cheap exclusion filters applied before any dedup work
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub excluded_keywords: Vec<String>,
    #[serde(default)]
    pub excluded_title_prefixes: Vec<String>,
    /// Empty list means every source is allowed
    #[serde(default)]
    pub allowed_sources: Vec<String>,
}

/// Which text the classifier looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyText {
    #[default]
    Title,
    TitleAndBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Ordered category table. Declaration order is match priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    pub catch_all: String,
    #[serde(default)]
    pub text: ClassifyText,
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
}

/// Remote embedding endpoint (OpenAI-compatible `/embeddings`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub api_url: String,
    pub api_key_env: Option<String>,
    pub model: String,
    pub timeout_seconds: Option<u64>,
    pub max_consecutive_failures: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortenerKind {
    Tinyurl,
    Isgd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortenerProviderConfig {
    pub kind: ShortenerKind,
    pub base_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Link shorteners, tried in order until one succeeds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShortenerConfig {
    #[serde(default)]
    pub providers: Vec<ShortenerProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Digest JSON destination; stdout when absent
    pub path: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    pub politeness: Option<PolitenessConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    pub classification: ClassificationConfig,
    pub embedding: Option<EmbeddingConfig>,
    pub shortener: Option<ShortenerConfig>,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    pub fn fetch_timeout_seconds(&self) -> u64 {
        self.politeness
            .as_ref()
            .and_then(|p| p.fetch_timeout_seconds)
            .unwrap_or(10)
    }

    pub fn fetch_concurrency(&self) -> usize {
        self.politeness
            .as_ref()
            .and_then(|p| p.concurrency)
            .unwrap_or(4)
            .max(1)
    }
}

/// Deep-merge `b` into `a`. Tables merge key by key; anything else
/// (arrays included) is replaced wholesale, so an override file's
/// category list never interleaves with the default one.
fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool`. Defaults are
/// conservative since a run is a short-lived, single-writer job:
/// - max_connections: 5
/// - WAL journaling
///
/// Example:
///   let pool = init_db_pool("data/newsdigest.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Creating the file up front surfaces permission and path problems with a clearer
    // message than the SQLite connect error would.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
