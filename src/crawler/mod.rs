//! Crawler module for quota-aware, resumable ingestion
//!
//! This module contains the core crawling logic, including:
//! - Retry and quota-pause handling around remote calls
//! - Batched upserts with per-record rejection
//! - The per-partition state machine with cursor checkpoints
//! - Concurrent execution of many partitions

mod backoff;
mod events;
mod orchestrator;
mod partition;
mod writer;

pub use backoff::{BackoffController, BackoffError, RetryDecision, RetryPolicy};
pub use events::{ChannelEventSink, CrawlEvent, EventSink, TracingEventSink};
pub use orchestrator::{Orchestrator, OrchestratorOptions, PartitionFailure, PartitionReport};
pub use partition::{summarize, CrawlSummary, Lane, PartitionCoordinator};
pub use writer::{AddOutcome, BatchWriter, FlushReport, RejectedRecord};

use crate::config::Config;
use crate::github::GithubClient;
use crate::state::{Clock, QuotaTracker, SystemClock};
use crate::storage::{RunStatus, SqliteStorage};
use crate::StarlingError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Builds one lane per configured credential
///
/// Every lane gets its own quota tracker; partitions assigned to the same
/// credential share it.
pub fn build_lanes(config: &Config) -> Result<Vec<Lane>, StarlingError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    config
        .require_credentials()?
        .iter()
        .map(|credential| -> Result<Lane, StarlingError> {
            let quota = Arc::new(QuotaTracker::new(
                credential.label.clone(),
                config.retry.reserve_threshold,
                Arc::clone(&clock),
            ));
            let client = GithubClient::new(&config.github, credential.clone(), Arc::clone(&quota))?;
            Ok(Lane {
                label: credential.label.clone(),
                source: Arc::new(client),
                quota,
            })
        })
        .collect()
}

/// Runs a complete crawl operation
///
/// This is the main entry point for starting a crawl. It will:
/// 1. Open the database and record a new run
/// 2. Build one GitHub client per credential
/// 3. Crawl every configured partition, resuming from checkpoints
/// 4. Mark the run completed, interrupted or failed
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `config_hash` - Hash of the configuration file, stored with the run
/// * `fresh` - Discard checkpoints instead of resuming
/// * `cancel` - Stops all partitions between pages when triggered
///
/// # Returns
///
/// * `Ok(CrawlSummary)` - Every partition reached a terminal state
/// * `Err(StarlingError)` - The crawl could not be started or a task panicked
pub async fn crawl(
    config: Config,
    config_hash: &str,
    fresh: bool,
    cancel: CancellationToken,
) -> Result<CrawlSummary, StarlingError> {
    let started = Instant::now();
    let database_path = PathBuf::from(&config.output.database_path);

    let mut storage = SqliteStorage::new(&database_path)?;
    if let Some(previous) = storage.get_latest_run()? {
        if previous.status == RunStatus::Running {
            tracing::warn!(
                "Run {} did not shut down cleanly; partitions resume from their checkpoints",
                previous.id
            );
            storage.finish_run(previous.id, RunStatus::Interrupted)?;
        }
    }
    let run_id = storage.create_run(config_hash)?;
    tracing::info!("Starting crawl run {}", run_id);

    let lanes = build_lanes(&config)?;
    let coordinator =
        PartitionCoordinator::from_config(&config, Arc::new(TracingEventSink), cancel.clone())
            .fresh(fresh);

    let reports = match coordinator
        .run(config.partition_specs(), lanes, move |_: &str| {
            SqliteStorage::new(&database_path)
        })
        .await
    {
        Ok(reports) => reports,
        Err(e) => {
            storage.finish_run(run_id, RunStatus::Failed)?;
            return Err(e);
        }
    };

    let summary = summarize(run_id, reports, cancel.is_cancelled(), started);
    storage.finish_run(run_id, summary.run_status())?;

    tracing::info!(
        "Crawl run {} {}: {} pages, {} records written in {:?}",
        run_id,
        summary.run_status().to_db_string(),
        summary.pages_fetched(),
        summary.records_written(),
        summary.elapsed
    );

    Ok(summary)
}
