//! Statistics generation from the crawl database
//!
//! This module provides functionality for extracting and displaying
//! crawl statistics from the storage layer.

use crate::storage::{Checkpoint, RepositoryRow, SqliteStorage};
use crate::StarlingError;

/// Star-count buckets reported by `--stats`, as `(label, min, max)`
pub const STAR_BUCKETS: &[(&str, u64, Option<u64>)] = &[
    ("0-9", 0, Some(9)),
    ("10-99", 10, Some(99)),
    ("100-999", 100, Some(999)),
    ("1k-9.9k", 1_000, Some(9_999)),
    ("10k-99.9k", 10_000, Some(99_999)),
    ("100k+", 100_000, None),
];

/// How many repositories the top list shows
pub const TOP_REPOSITORY_LIMIT: usize = 10;

/// Crawl statistics summary
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    /// Total number of stored repositories
    pub total_repositories: u64,

    /// Repository count per star bucket, in [`STAR_BUCKETS`] order
    pub star_distribution: Vec<(&'static str, u64)>,

    /// Most starred repositories, highest first
    pub top_repositories: Vec<RepositoryRow>,

    /// Progress of every partition that has run at least once
    pub partitions: Vec<Checkpoint>,
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The database to query
///
/// # Returns
///
/// * `Ok(CrawlStatistics)` - Successfully loaded statistics
/// * `Err(StarlingError)` - Failed to query statistics
pub fn load_statistics(storage: &SqliteStorage) -> Result<CrawlStatistics, StarlingError> {
    let total_repositories = storage.count_repositories()?;

    let mut star_distribution = Vec::with_capacity(STAR_BUCKETS.len());
    for (label, min, max) in STAR_BUCKETS {
        star_distribution.push((*label, storage.count_in_star_range(*min, *max)?));
    }

    let top_repositories = storage.top_repositories(TOP_REPOSITORY_LIMIT)?;
    let partitions = storage.list_checkpoints()?;

    Ok(CrawlStatistics {
        total_repositories,
        star_distribution,
        top_repositories,
        partitions,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Crawl Statistics ===\n");

    println!("Overview:");
    println!("  Total repositories: {}", stats.total_repositories);
    println!("  Partitions tracked: {}", stats.partitions.len());
    println!();

    println!("Star Distribution:");
    for (label, count) in &stats.star_distribution {
        let percentage = if stats.total_repositories > 0 {
            (*count as f64 / stats.total_repositories as f64) * 100.0
        } else {
            0.0
        };
        println!("  {:>10}: {} ({:.1}%)", label, count, percentage);
    }
    println!();

    if !stats.top_repositories.is_empty() {
        println!("Top Repositories:");
        for (rank, repo) in stats.top_repositories.iter().enumerate() {
            println!(
                "  {:>2}. {}/{} ({} stars)",
                rank + 1,
                repo.owner,
                repo.name,
                repo.stargazer_count
            );
        }
        println!();
    }

    if !stats.partitions.is_empty() {
        println!("Partitions:");
        for checkpoint in &stats.partitions {
            println!(
                "  {}: {} ({} pages, {} records, cursor {})",
                checkpoint.partition_id,
                checkpoint.state,
                checkpoint.pages_fetched,
                checkpoint.records_written,
                checkpoint
                    .cursor
                    .as_ref()
                    .map(|c| c.as_str())
                    .unwrap_or("-")
            );
            if let Some(error) = &checkpoint.last_error {
                println!("      last error: {}", error);
            }
        }
    }
}
