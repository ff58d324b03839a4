//! Starling: a quota-aware GitHub repository census crawler
//!
//! This crate walks GitHub's paginated search API one star-range partition at a
//! time, absorbs rate limits and transient failures, and upserts repository
//! metadata into SQLite in bounded batches with resumable cursor checkpoints.

pub mod config;
pub mod crawler;
pub mod github;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Starling operations
#[derive(Debug, Error)]
pub enum StarlingError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Partition task failed: {0}")]
    Task(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("No GitHub token found (set `github.token` or the {0} environment variable)")]
    MissingToken(String),
}

/// Result type alias for Starling operations
pub type Result<T> = std::result::Result<T, StarlingError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use github::{Cursor, Page, QueryError, Record};
pub use state::{PartitionState, QuotaSnapshot, QuotaTracker};
