//! Concurrent execution of disjoint partitions
//!
//! Each credential becomes a [`Lane`] (a client plus the quota tracker it
//! feeds). Partitions are dealt to lanes round-robin, so partitions sharing a
//! credential also share its quota view, and at most
//! `max-concurrent-partitions` orchestrators run at any time.

use crate::config::{validate_partitions, Config};
use crate::crawler::events::EventSink;
use crate::crawler::orchestrator::{
    Orchestrator, OrchestratorOptions, PartitionFailure, PartitionReport,
};
use crate::github::{PageSource, PartitionSpec};
use crate::state::{PartitionState, QuotaTracker};
use crate::storage::{CheckpointStore, RecordStore, RunStatus};
use crate::{ConfigError, StarlingError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A page source and the quota tracker it reports into
#[derive(Clone)]
pub struct Lane {
    pub label: String,
    pub source: Arc<dyn PageSource>,
    pub quota: Arc<QuotaTracker>,
}

/// Outcome of a whole crawl
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub run_id: i64,
    /// One report per partition, in configuration order
    pub reports: Vec<PartitionReport>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl CrawlSummary {
    pub fn records_written(&self) -> u64 {
        self.reports.iter().map(|r| r.records_written).sum()
    }

    pub fn pages_fetched(&self) -> u64 {
        self.reports.iter().map(|r| r.pages_fetched).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PartitionReport> {
        self.reports
            .iter()
            .filter(|r| r.state == PartitionState::Failed)
    }

    /// Status recorded for the run
    pub fn run_status(&self) -> RunStatus {
        if self.failures().next().is_some() {
            RunStatus::Failed
        } else if self.interrupted
            || self
                .reports
                .iter()
                .any(|r| r.state == PartitionState::Cancelled)
        {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        }
    }
}

/// Runs one orchestrator per partition under a concurrency limit
pub struct PartitionCoordinator {
    options: OrchestratorOptions,
    max_concurrent: usize,
    fresh: bool,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl PartitionCoordinator {
    pub fn new(
        options: OrchestratorOptions,
        max_concurrent: usize,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            max_concurrent: max_concurrent.max(1),
            fresh: false,
            events,
            cancel,
        }
    }

    pub fn from_config(
        config: &Config,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(
            OrchestratorOptions::from_config(config),
            config.crawl.max_concurrent_partitions,
            events,
            cancel,
        )
    }

    /// Discards existing checkpoints instead of resuming from them
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    /// Lane index for each of `partitions` partitions
    pub fn assign(partitions: usize, lanes: usize) -> Vec<usize> {
        if lanes == 0 {
            return Vec::new();
        }
        (0..partitions).map(|i| i % lanes).collect()
    }

    /// Crawls every partition and returns their reports in input order
    ///
    /// # Arguments
    ///
    /// * `partitions` - Disjoint slices of the search space
    /// * `lanes` - One per credential; partitions are spread across them
    /// * `open_store` - Opens a store handle for the given partition id
    ///
    /// # Returns
    ///
    /// * `Ok(reports)` - Every partition reached a terminal state
    /// * `Err(StarlingError)` - Invalid partitions, no lanes, or a task panicked
    pub async fn run<S, F>(
        &self,
        partitions: Vec<PartitionSpec>,
        lanes: Vec<Lane>,
        open_store: F,
    ) -> Result<Vec<PartitionReport>, StarlingError>
    where
        S: RecordStore + CheckpointStore + 'static,
        F: Fn(&str) -> Result<S, StarlingError> + Send + Sync + 'static,
    {
        validate_partitions(&partitions)?;
        if lanes.is_empty() {
            return Err(ConfigError::Validation(
                "at least one credential is required to crawl".to_string(),
            )
            .into());
        }

        let assignment = Self::assign(partitions.len(), lanes.len());
        let mut reports: Vec<Option<PartitionReport>> = vec![None; partitions.len()];
        let mut runnable = Vec::new();

        {
            let mut control = open_store("coordinator")?;
            for (index, partition) in partitions.into_iter().enumerate() {
                if self.fresh {
                    control.clear_checkpoint(&partition.id)?;
                } else if let Some(checkpoint) = control.load_checkpoint(&partition.id)? {
                    if checkpoint.state == PartitionState::Done {
                        tracing::info!("Skipping completed partition {}", partition.id);
                        reports[index] = Some(PartitionReport::skipped(partition.id));
                        continue;
                    }
                }
                runnable.push((index, partition));
            }
        }

        tracing::info!(
            "Crawling {} partitions over {} credentials ({} at a time)",
            runnable.len(),
            lanes.len(),
            self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let open_store = Arc::new(open_store);
        let mut tasks = JoinSet::new();

        for (index, partition) in runnable {
            let lane = lanes[assignment[index]].clone();
            let semaphore = Arc::clone(&semaphore);
            let open_store = Arc::clone(&open_store);
            let options = self.options.clone();
            let events = Arc::clone(&self.events);
            let cancel = self.cancel.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let id = partition.id.clone();
                tracing::debug!("Partition {} runs on {}", id, lane.label);

                let store = match open_store(&id) {
                    Ok(store) => store,
                    Err(e) => {
                        let failure = PartitionFailure::Storage {
                            partition: id.clone(),
                            message: e.to_string(),
                        };
                        tracing::error!("{}", failure);
                        return (index, PartitionReport::failed(id, failure));
                    }
                };

                let mut orchestrator = Orchestrator::new(
                    partition,
                    lane.source,
                    lane.quota,
                    store,
                    &options,
                    events,
                    cancel,
                );
                (index, orchestrator.run().await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, report) = joined.map_err(|e| StarlingError::Task(e.to_string()))?;
            reports[index] = Some(report);
        }

        Ok(reports.into_iter().flatten().collect())
    }
}

/// Builds a summary from finished reports
pub fn summarize(
    run_id: i64,
    reports: Vec<PartitionReport>,
    interrupted: bool,
    started: Instant,
) -> CrawlSummary {
    CrawlSummary {
        run_id,
        reports,
        interrupted,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrawlBudget, RetryConfig};
    use crate::crawler::events::TracingEventSink;
    use crate::github::{Cursor, Page, QueryError, Record};
    use crate::state::TokioClock;
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Two pages per partition: `{id}-1`, `{id}-2`, then `{id}-3`
    #[derive(Default)]
    struct TwoPageSource {
        served: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl PageSource for TwoPageSource {
        async fn fetch(
            &self,
            partition: &PartitionSpec,
            cursor: Option<&Cursor>,
        ) -> Result<Page, QueryError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.served.lock().unwrap().push(partition.id.clone());

            let make = |n: u32| Record {
                stable_id: format!("{}-{}", partition.id, n),
                owner: "octo".to_string(),
                name: format!("{}-{}", partition.id, n),
                popularity_count: partition.min_stars,
                observed_at: Utc::now(),
            };

            Ok(match cursor {
                None => Page {
                    records: vec![make(1), make(2)],
                    next_cursor: Some(Cursor::new("c1")),
                    quota: None,
                },
                Some(_) => Page {
                    records: vec![make(3)],
                    next_cursor: None,
                    quota: None,
                },
            })
        }
    }

    fn lane(label: &str, source: Arc<TwoPageSource>) -> Lane {
        Lane {
            label: label.to_string(),
            source,
            quota: Arc::new(QuotaTracker::new(
                label,
                5,
                Arc::new(TokioClock::starting_at(Utc::now())),
            )),
        }
    }

    fn coordinator(max_concurrent: usize) -> PartitionCoordinator {
        PartitionCoordinator::new(
            OrchestratorOptions {
                batch_size: 10,
                budget: CrawlBudget::default(),
                retry: RetryConfig::default(),
            },
            max_concurrent,
            Arc::new(TracingEventSink),
            CancellationToken::new(),
        )
    }

    fn partitions() -> Vec<PartitionSpec> {
        vec![
            PartitionSpec::new("low", 0, Some(9)),
            PartitionSpec::new("mid", 10, Some(99)),
            PartitionSpec::new("high", 100, None),
        ]
    }

    fn opener(path: PathBuf) -> impl Fn(&str) -> Result<SqliteStorage, StarlingError> {
        move |_| SqliteStorage::new(&path)
    }

    #[test]
    fn test_round_robin_assignment() {
        assert_eq!(PartitionCoordinator::assign(5, 2), vec![0, 1, 0, 1, 0]);
        assert_eq!(PartitionCoordinator::assign(2, 3), vec![0, 1]);
        assert!(PartitionCoordinator::assign(2, 0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_all_partitions_across_lanes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl.db");
        let first = Arc::new(TwoPageSource::default());
        let second = Arc::new(TwoPageSource::default());

        let reports = coordinator(2)
            .run(
                partitions(),
                vec![lane("token-1", first.clone()), lane("token-2", second.clone())],
                opener(path.clone()),
            )
            .await
            .unwrap();

        let ids: Vec<_> = reports.iter().map(|r| r.partition_id.as_str()).collect();
        assert_eq!(ids, vec!["low", "mid", "high"]);
        assert!(reports.iter().all(|r| r.state == PartitionState::Done));

        let mut first_served = first.served.lock().unwrap().clone();
        first_served.sort();
        first_served.dedup();
        assert_eq!(first_served, vec!["high", "low"]);
        assert!(second.served.lock().unwrap().iter().all(|id| id == "mid"));

        let storage = SqliteStorage::new(&path).unwrap();
        assert_eq!(storage.count_repositories().unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(TwoPageSource::default());

        coordinator(1)
            .run(
                partitions(),
                vec![lane("token-1", source.clone())],
                opener(dir.path().join("crawl.db")),
            )
            .await
            .unwrap();

        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_partitions_are_skipped_unless_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl.db");
        let source = Arc::new(TwoPageSource::default());

        coordinator(2)
            .run(partitions(), vec![lane("t", source.clone())], opener(path.clone()))
            .await
            .unwrap();
        let served = source.served.lock().unwrap().len();

        let again = coordinator(2)
            .run(partitions(), vec![lane("t", source.clone())], opener(path.clone()))
            .await
            .unwrap();
        assert!(again.iter().all(|r| r.pages_fetched == 0));
        assert_eq!(source.served.lock().unwrap().len(), served);

        let fresh = coordinator(2)
            .fresh(true)
            .run(partitions(), vec![lane("t", source.clone())], opener(path))
            .await
            .unwrap();
        assert!(fresh.iter().all(|r| r.pages_fetched == 2));
    }

    #[tokio::test]
    async fn test_overlapping_partitions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let overlapping = vec![
            PartitionSpec::new("a", 0, Some(50)),
            PartitionSpec::new("b", 40, Some(100)),
        ];

        let result = coordinator(2)
            .run(
                overlapping,
                vec![lane("t", Arc::new(TwoPageSource::default()))],
                opener(dir.path().join("crawl.db")),
            )
            .await;

        assert!(matches!(result, Err(StarlingError::Config(_))));
    }

    #[tokio::test]
    async fn test_no_lanes_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = coordinator(2)
            .run(partitions(), Vec::new(), opener(dir.path().join("crawl.db")))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_run_status() {
        let mut done = PartitionReport::skipped("a");
        let summary = summarize(1, vec![done.clone()], false, Instant::now());
        assert_eq!(summary.run_status(), RunStatus::Completed);

        let interrupted = summarize(1, vec![done.clone()], true, Instant::now());
        assert_eq!(interrupted.run_status(), RunStatus::Interrupted);

        done.state = PartitionState::Failed;
        let failed = summarize(1, vec![done], false, Instant::now());
        assert_eq!(failed.run_status(), RunStatus::Failed);
    }
}
