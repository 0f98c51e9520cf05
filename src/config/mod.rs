use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Remote reservation site + HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Listing category key passed to the facility listing endpoint.
    #[serde(default = "default_listing_key")]
    pub listing_key: String,

    #[serde(default = "default_page_unit")]
    pub page_unit: u32,

    /// Upper bound on listing pages walked when the page count is unknown.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Facility titles must contain this keyword. Empty disables the filter.
    #[serde(default = "default_category_keyword")]
    pub category_keyword: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Json,
    Duckdb,
    Memory,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Directory holding one JSON file per key (json backend) and the lock
    /// files that serialise refreshes across processes.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Crawl / refresh cycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Max simultaneous in-flight requests across the whole crawl.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_run_budget_secs")]
    pub run_budget_secs: u64,

    /// Period of the `watch` scheduler.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Offset of the reservation site's local time from UTC; decides "today".
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// When unset, notifications are only logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://publicsports.yongin.go.kr".to_string()
}
fn default_listing_key() -> String {
    "4236".to_string()
}
fn default_page_unit() -> u32 {
    8
}
fn default_max_pages() -> u32 {
    50
}
fn default_category_keyword() -> String {
    "테니스".to_string()
}
fn default_timeout_secs() -> u64 {
    15
}
fn default_jitter_ms() -> u64 {
    100
}
fn default_max_retries() -> usize {
    2
}
fn default_retry_base_ms() -> u64 {
    250
}
fn default_user_agent() -> String {
    "court-watch/0.1 (reservation slot watcher)".to_string()
}
fn default_backend() -> StorageBackend {
    StorageBackend::Json
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/court_watch.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    30
}
fn default_run_budget_secs() -> u64 {
    300
}
fn default_interval_secs() -> u64 {
    600
}
fn default_utc_offset_hours() -> i32 {
    9
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            listing_key: default_listing_key(),
            page_unit: default_page_unit(),
            max_pages: default_max_pages(),
            category_keyword: default_category_keyword(),
            timeout_secs: default_timeout_secs(),
            jitter_ms: default_jitter_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            run_budget_secs: default_run_budget_secs(),
            interval_secs: default_interval_secs(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("COURT").separator("__"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}
