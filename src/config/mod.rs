//! Configuration module for Starling
//!
//! This module handles loading, parsing, and validating TOML configuration files,
//! including environment overrides and credential resolution.
//!
//! # Example
//!
//! ```no_run
//! use starling::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("starling.toml")).unwrap();
//! println!("Crawling {} partitions", config.partition_specs().len());
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    AutoPartition, Config, CrawlBudget, CrawlConfig, Credential, GithubConfig, OutputConfig,
    PartitionEntry, RetryConfig,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, load_config, load_config_with_hash, normalize_api_url, parse_config,
};
pub use validation::validate_partitions;
