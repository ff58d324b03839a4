use crate::github::{split_star_range, PartitionSpec};
use crate::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Starling
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub output: OutputConfig,
    #[serde(default, rename = "partition")]
    pub partitions: Vec<PartitionEntry>,
    #[serde(default, rename = "auto-partition")]
    pub auto_partition: Option<AutoPartition>,
    /// Credentials resolved at load time from `github.token` / `github.token-env`
    #[serde(skip)]
    pub credentials: Vec<Credential>,
}

impl Config {
    /// Resolves the partitions to crawl
    ///
    /// Explicit `[[partition]]` entries win over `[auto-partition]`; with neither,
    /// a single open-ended partition covers every public repository.
    pub fn partition_specs(&self) -> Vec<PartitionSpec> {
        if !self.partitions.is_empty() {
            return self
                .partitions
                .iter()
                .map(|entry| PartitionSpec {
                    id: entry.id.clone(),
                    query: entry.query.clone(),
                    min_stars: entry.min_stars,
                    max_stars: entry.max_stars,
                })
                .collect();
        }

        match &self.auto_partition {
            Some(auto) => split_star_range(auto.min_stars, auto.max_stars, auto.count, &auto.query),
            None => vec![PartitionSpec::new("all", 0, None)],
        }
    }

    /// Fails unless at least one API token was resolved
    pub fn require_credentials(&self) -> Result<&[Credential], ConfigError> {
        if self.credentials.is_empty() {
            Err(ConfigError::MissingToken(self.github.token_env.clone()))
        } else {
            Ok(&self.credentials)
        }
    }
}

/// Remote API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GithubConfig {
    /// GraphQL endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Inline token; prefer `token-env` outside of local testing
    #[serde(default)]
    pub token: Option<String>,

    /// Environment variable holding one or more comma-separated tokens
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Search results requested per page (GitHub caps this at 100)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
            token_env: default_token_env(),
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Crawl loop configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrawlConfig {
    /// Records accumulated before an automatic flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Partitions crawled at the same time
    #[serde(default = "default_max_concurrent_partitions")]
    pub max_concurrent_partitions: usize,

    /// Stop a partition after this many pages in one run
    #[serde(default)]
    pub max_pages: Option<u64>,

    /// Stop a partition after this many records in one run
    #[serde(default)]
    pub max_records: Option<u64>,

    /// Stop a partition after this much wall-clock time in one run
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_partitions: default_max_concurrent_partitions(),
            max_pages: None,
            max_records: None,
            max_runtime_secs: None,
        }
    }
}

impl CrawlConfig {
    /// Per-partition budget derived from the optional limits
    pub fn budget(&self) -> CrawlBudget {
        CrawlBudget {
            max_pages: self.max_pages,
            max_records: self.max_records,
            max_runtime: self.max_runtime_secs.map(Duration::from_secs),
        }
    }
}

/// Optional limits that end a partition before its cursor is exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlBudget {
    pub max_pages: Option<u64>,
    pub max_records: Option<u64>,
    pub max_runtime: Option<Duration>,
}

/// Retry, backoff and quota configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Attempts per remote call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Longest single sleep while waiting for the quota window to reset
    #[serde(default = "default_max_quota_wait_secs")]
    pub max_quota_wait_secs: u64,

    /// Remaining calls at or below which requests pause until reset
    #[serde(default = "default_reserve_threshold")]
    pub reserve_threshold: u32,

    /// Apply full jitter to retry delays
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    #[serde(default = "default_flush_base_delay_ms")]
    pub flush_base_delay_ms: u64,

    #[serde(default = "default_flush_max_delay_ms")]
    pub flush_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_quota_wait_secs: default_max_quota_wait_secs(),
            reserve_threshold: default_reserve_threshold(),
            jitter: default_jitter(),
            flush_base_delay_ms: default_flush_base_delay_ms(),
            flush_max_delay_ms: default_flush_max_delay_ms(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Path to the SQLite database file
    pub database_path: String,

    /// Default path for `--export-csv` when no path is given
    #[serde(default)]
    pub export_path: Option<String>,
}

/// One explicitly configured slice of the search space
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionEntry {
    pub id: String,

    /// Extra search qualifiers prepended to the star range
    #[serde(default = "default_query")]
    pub query: String,

    pub min_stars: u64,

    /// Open-ended when absent
    #[serde(default)]
    pub max_stars: Option<u64>,
}

/// Evenly split a star range into `count` partitions
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AutoPartition {
    pub min_stars: u64,
    pub max_stars: u64,
    pub count: u32,
    #[serde(default = "default_query")]
    pub query: String,
}

/// An API token together with a stable label used in logs
#[derive(Clone)]
pub struct Credential {
    pub label: String,
    pub token: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("token", &"<redacted>")
            .finish()
    }
}

fn default_api_url() -> String {
    "https://api.github.com/graphql".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("starling/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_concurrent_partitions() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_quota_wait_secs() -> u64 {
    3700
}

fn default_reserve_threshold() -> u32 {
    5
}

fn default_jitter() -> bool {
    true
}

fn default_flush_base_delay_ms() -> u64 {
    500
}

fn default_flush_max_delay_ms() -> u64 {
    30_000
}

fn default_query() -> String {
    "is:public".to_string()
}
