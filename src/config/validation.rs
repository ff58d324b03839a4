use crate::config::types::{Config, CrawlConfig, GithubConfig, OutputConfig, RetryConfig};
use crate::github::PartitionSpec;
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_github_config(&config.github)?;
    validate_crawl_config(&config.crawl)?;
    validate_retry_config(&config.retry)?;
    validate_output_config(&config.output)?;
    validate_partitions(&config.partition_specs())?;
    Ok(())
}

/// Validates remote API configuration
fn validate_github_config(config: &GithubConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.api_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid api-url: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "api-url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.page_size < 1 || config.page_size > 100 {
        return Err(ConfigError::Validation(format!(
            "page-size must be between 1 and 100, got {}",
            config.page_size
        )));
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates crawl loop configuration
fn validate_crawl_config(config: &CrawlConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 {
        return Err(ConfigError::Validation(format!(
            "batch-size must be >= 1, got {}",
            config.batch_size
        )));
    }

    if config.max_concurrent_partitions < 1 || config.max_concurrent_partitions > 64 {
        return Err(ConfigError::Validation(format!(
            "max-concurrent-partitions must be between 1 and 64, got {}",
            config.max_concurrent_partitions
        )));
    }

    if config.max_pages == Some(0) || config.max_records == Some(0) {
        return Err(ConfigError::Validation(
            "max-pages and max-records must be >= 1 when set".to_string(),
        ));
    }

    Ok(())
}

/// Validates retry and quota configuration
fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max-attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.base_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "base-delay-ms ({}) cannot exceed max-delay-ms ({})",
            config.base_delay_ms, config.max_delay_ms
        )));
    }

    if config.flush_base_delay_ms > config.flush_max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "flush-base-delay-ms ({}) cannot exceed flush-max-delay-ms ({})",
            config.flush_base_delay_ms, config.flush_max_delay_ms
        )));
    }

    if config.max_quota_wait_secs == 0 {
        return Err(ConfigError::Validation(
            "max-quota-wait-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if config.export_path.as_deref() == Some("") {
        return Err(ConfigError::Validation(
            "export-path cannot be empty when set".to_string(),
        ));
    }

    Ok(())
}

/// Validates that partitions are named uniquely and never overlap
pub fn validate_partitions(specs: &[PartitionSpec]) -> Result<(), ConfigError> {
    if specs.is_empty() {
        return Err(ConfigError::Validation(
            "at least one partition is required".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for spec in specs {
        if spec.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "partition id cannot be empty".to_string(),
            ));
        }

        if !ids.insert(spec.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate partition id '{}'",
                spec.id
            )));
        }

        if let Some(max) = spec.max_stars {
            if max < spec.min_stars {
                return Err(ConfigError::Validation(format!(
                    "partition '{}' has min-stars {} above max-stars {}",
                    spec.id, spec.min_stars, max
                )));
            }
        }
    }

    for (i, a) in specs.iter().enumerate() {
        for b in &specs[i + 1..] {
            if a.query == b.query && a.overlaps(b) {
                return Err(ConfigError::Validation(format!(
                    "partitions '{}' and '{}' have overlapping star ranges",
                    a.id, b.id
                )));
            }
        }
    }

    Ok(())
}
