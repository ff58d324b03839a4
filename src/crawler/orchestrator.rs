//! Per-partition crawl loop
//!
//! One [`Orchestrator`] drives one partition through
//! `Idle → Fetching → Writing → Checkpointing → Fetching → …` until the cursor
//! sequence is exhausted, a budget runs out, it is cancelled, or it fails.
//! The checkpoint is only ever advanced to a cursor whose preceding records
//! are all durable, so any stop leaves a resumable state behind.

use crate::config::{Config, CrawlBudget, RetryConfig};
use crate::crawler::backoff::{BackoffController, BackoffError, RetryPolicy};
use crate::crawler::events::{CrawlEvent, EventSink};
use crate::crawler::writer::{AddOutcome, BatchWriter, FlushReport};
use crate::github::{Cursor, Page, PageSource, PartitionSpec};
use crate::state::{PartitionState, QuotaTracker};
use crate::storage::{Checkpoint, CheckpointStore, RecordStore, StorageError, StorageResult};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a partition ended in [`PartitionState::Failed`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PartitionFailure {
    #[error("partition {partition} failed at cursor {cursor}: {source}")]
    Fetch {
        partition: String,
        cursor: String,
        source: BackoffError,
    },

    /// The upstream handed back the cursor it was asked for
    #[error("partition {partition}: malformed pagination, cursor {cursor} repeated")]
    StuckCursor { partition: String, cursor: String },

    #[error("partition {partition}: storage error: {message}")]
    Storage { partition: String, message: String },
}

/// Summary of one orchestrator run
#[derive(Debug, Clone)]
pub struct PartitionReport {
    pub partition_id: String,
    pub state: PartitionState,
    pub pages_fetched: u64,
    pub records_fetched: u64,
    pub records_written: u64,
    pub records_rejected: u64,
    /// Last durable cursor
    pub cursor: Option<Cursor>,
    pub failure: Option<PartitionFailure>,
    pub elapsed: Duration,
}

impl PartitionReport {
    /// Report for a partition that was already complete and not run again
    pub fn skipped(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            state: PartitionState::Done,
            pages_fetched: 0,
            records_fetched: 0,
            records_written: 0,
            records_rejected: 0,
            cursor: None,
            failure: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Report for a partition that could not be started
    pub fn failed(partition_id: impl Into<String>, failure: PartitionFailure) -> Self {
        Self {
            state: PartitionState::Failed,
            failure: Some(failure),
            ..Self::skipped(partition_id)
        }
    }
}

/// Loop settings taken from the configuration
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub batch_size: usize,
    pub budget: CrawlBudget,
    pub retry: RetryConfig,
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.crawl.batch_size,
            budget: config.crawl.budget(),
            retry: config.retry.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RunCounters {
    pages: u64,
    records_fetched: u64,
    records_written: u64,
    records_rejected: u64,
}

/// Drives a single partition from its checkpoint to a terminal state
pub struct Orchestrator<S> {
    partition: PartitionSpec,
    source: Arc<dyn PageSource>,
    backoff: BackoffController,
    writer: BatchWriter<S>,
    flush_policy: RetryPolicy,
    budget: CrawlBudget,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    state: PartitionState,
    progress: Checkpoint,
    counters: RunCounters,
}

impl<S: RecordStore + CheckpointStore> Orchestrator<S> {
    /// Creates an orchestrator for `partition`
    ///
    /// # Arguments
    ///
    /// * `partition` - The slice of the search space to crawl
    /// * `source` - Where pages come from
    /// * `quota` - Tracker of the credential `source` uses
    /// * `store` - Destination for records and checkpoints
    /// * `options` - Batch size, budgets and retry settings
    /// * `events` - Receiver of progress events
    /// * `cancel` - Checked between pages
    pub fn new(
        partition: PartitionSpec,
        source: Arc<dyn PageSource>,
        quota: Arc<QuotaTracker>,
        store: S,
        options: &OrchestratorOptions,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = BackoffController::from_config(
            partition.id.clone(),
            &options.retry,
            quota,
            Arc::clone(&events),
            cancel.clone(),
        );
        let progress = Checkpoint::new(partition.id.clone());

        Self {
            partition,
            source,
            backoff,
            writer: BatchWriter::new(store, options.batch_size),
            flush_policy: RetryPolicy::for_flush(&options.retry),
            budget: options.budget,
            events,
            cancel,
            state: PartitionState::Idle,
            progress,
            counters: RunCounters::default(),
        }
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn store(&self) -> &S {
        self.writer.store()
    }

    pub fn into_store(self) -> S {
        self.writer.into_store()
    }

    /// Runs the partition to a terminal state
    pub async fn run(&mut self) -> PartitionReport {
        let started = Instant::now();
        let id = self.partition.id.clone();

        let (state, failure) = match self.drive(started).await {
            Ok(state) => (state, None),
            Err(failure) => {
                tracing::error!("{}", failure);
                self.transition(PartitionState::Failed);
                let message = failure.to_string();
                if let Err(e) = self.writer.store_mut().set_partition_state(
                    &id,
                    PartitionState::Failed,
                    Some(&message),
                ) {
                    tracing::warn!("Could not record failure of partition {}: {}", id, e);
                }
                (PartitionState::Failed, Some(failure))
            }
        };

        let elapsed = started.elapsed();
        tracing::info!(
            "Partition {} finished as {}: {} pages, {} records written in {:?}",
            id,
            state,
            self.counters.pages,
            self.counters.records_written,
            elapsed
        );
        self.events.emit(CrawlEvent::PartitionFinished {
            partition: id.clone(),
            state,
            records_written: self.counters.records_written,
        });

        PartitionReport {
            partition_id: id,
            state,
            pages_fetched: self.counters.pages,
            records_fetched: self.counters.records_fetched,
            records_written: self.counters.records_written,
            records_rejected: self.counters.records_rejected,
            cursor: self.progress.cursor.clone(),
            failure,
            elapsed,
        }
    }

    async fn drive(&mut self, started: Instant) -> Result<PartitionState, PartitionFailure> {
        let id = self.partition.id.clone();

        // Idle
        let loaded = self
            .retry_storage("load checkpoint", |w| w.store().load_checkpoint(&id))
            .await?;

        if let Some(checkpoint) = loaded {
            let already_done = checkpoint.state == PartitionState::Done;
            self.progress = checkpoint;
            if already_done {
                tracing::info!("Partition {} already complete", id);
                self.transition(PartitionState::Done);
                return Ok(PartitionState::Done);
            }
        }

        let mut cursor = self.progress.cursor.clone();
        match &cursor {
            Some(c) => tracing::info!("Resuming partition {} from cursor {}", id, c),
            None => tracing::info!(
                "Starting partition {} ({})",
                id,
                self.partition.search_query()
            ),
        }

        self.transition(PartitionState::Fetching);
        self.retry_storage("mark partition", |w| {
            w.store_mut()
                .set_partition_state(&id, PartitionState::Fetching, None)
        })
        .await?;

        loop {
            // Fetching
            if self.cancel.is_cancelled() {
                tracing::info!("Partition {} cancelled", id);
                return self.stop(PartitionState::Cancelled, cursor).await;
            }
            if let Some(limit) = self.budget_exhausted(started) {
                tracing::info!("Partition {} reached its {} budget", id, limit);
                return self.stop(PartitionState::BudgetReached, cursor).await;
            }

            let fetched = {
                let source = &self.source;
                let partition = &self.partition;
                let request = cursor.as_ref();
                self.backoff
                    .call(|| source.fetch(partition, request))
                    .await
            };

            let page = match fetched {
                Ok(page) => page,
                Err(BackoffError::Cancelled) => {
                    tracing::info!("Partition {} cancelled while waiting", id);
                    return self.stop(PartitionState::Cancelled, cursor).await;
                }
                Err(source) => {
                    return Err(PartitionFailure::Fetch {
                        partition: id,
                        cursor: describe(cursor.as_ref()),
                        source,
                    })
                }
            };

            if page.next_cursor.is_some() && page.next_cursor == cursor {
                return Err(PartitionFailure::StuckCursor {
                    partition: id,
                    cursor: describe(cursor.as_ref()),
                });
            }

            self.counters.pages += 1;
            self.counters.records_fetched += page.records.len() as u64;
            self.progress.pages_fetched += 1;
            self.events.emit(CrawlEvent::PageFetched {
                partition: id.clone(),
                records: page.records.len(),
                has_next: page.next_cursor.is_some(),
                quota_remaining: page.quota.map(|q| q.remaining),
            });

            if self.counters.pages % 10 == 0 {
                tracing::info!(
                    "Progress: partition {} at {} pages, {} records written",
                    id,
                    self.counters.pages,
                    self.counters.records_written
                );
            }

            // Writing
            self.transition(PartitionState::Writing);
            let Page {
                records,
                next_cursor,
                ..
            } = page;

            let mut flushed = false;
            for record in records {
                match self.writer.add(record) {
                    Ok(AddOutcome::Buffered) => {}
                    Ok(AddOutcome::Flushed(report)) => {
                        self.record_flush(report);
                        flushed = true;
                    }
                    Err(e) => {
                        // The failed add was attempt 1 of this flush
                        self.storage_backoff("flush", 1, e).await?;
                        let report = self
                            .retry_storage_from("flush", 2, |w| w.flush())
                            .await?;
                        self.record_flush(report);
                        flushed = true;
                    }
                }
            }

            match next_cursor {
                None => {
                    self.flush_durably().await?;
                    self.transition(PartitionState::Checkpointing);
                    self.save_progress(cursor, PartitionState::Done).await?;
                    self.transition(PartitionState::Done);
                    return Ok(PartitionState::Done);
                }
                Some(next) => {
                    if self.writer.is_empty() {
                        // Every record up to `next` is durable
                        self.transition(PartitionState::Checkpointing);
                        self.save_progress(Some(next.clone()), PartitionState::Fetching)
                            .await?;
                    } else if flushed && cursor.is_some() {
                        // Part of this page is still buffered; only the pages
                        // before it are safe to skip on resume
                        self.transition(PartitionState::Checkpointing);
                        self.save_progress(cursor.clone(), PartitionState::Fetching)
                            .await?;
                    }
                    self.transition(PartitionState::Fetching);
                    cursor = Some(next);
                }
            }
        }
    }

    /// Flushes what is buffered and records `state` with `cursor`
    async fn stop(
        &mut self,
        state: PartitionState,
        cursor: Option<Cursor>,
    ) -> Result<PartitionState, PartitionFailure> {
        self.flush_durably().await?;
        self.save_progress(cursor, state).await?;
        self.transition(state);
        Ok(state)
    }

    fn budget_exhausted(&self, started: Instant) -> Option<&'static str> {
        if let Some(max) = self.budget.max_pages {
            if self.counters.pages >= max {
                return Some("page");
            }
        }
        if let Some(max) = self.budget.max_records {
            if self.counters.records_fetched >= max {
                return Some("record");
            }
        }
        if let Some(max) = self.budget.max_runtime {
            if started.elapsed() >= max {
                return Some("runtime");
            }
        }
        None
    }

    async fn flush_durably(&mut self) -> Result<(), PartitionFailure> {
        let report = self.retry_storage("flush", |w| w.flush()).await?;
        self.record_flush(report);
        Ok(())
    }

    fn record_flush(&mut self, report: FlushReport) {
        let written = report.written as u64;
        self.counters.records_written += written;
        self.counters.records_rejected += report.rejected.len() as u64;
        self.progress.records_written += written;

        for rejected in report.rejected {
            self.events.emit(CrawlEvent::RecordRejected {
                partition: self.partition.id.clone(),
                stable_id: rejected.stable_id,
                reason: rejected.reason,
            });
        }

        if written > 0 {
            tracing::debug!("Partition {} flushed {} records", self.partition.id, written);
            self.events.emit(CrawlEvent::BatchFlushed {
                partition: self.partition.id.clone(),
                written: report.written,
            });
        }
    }

    async fn save_progress(
        &mut self,
        cursor: Option<Cursor>,
        state: PartitionState,
    ) -> Result<(), PartitionFailure> {
        self.progress.cursor = cursor;
        self.progress.state = state;
        self.progress.last_error = None;

        let checkpoint = self.progress.clone();
        self.retry_storage("save checkpoint", |w| {
            w.store_mut().save_checkpoint(&checkpoint)
        })
        .await?;

        self.events.emit(CrawlEvent::CheckpointSaved {
            partition: self.partition.id.clone(),
            cursor: checkpoint.cursor.as_ref().map(|c| c.to_string()),
        });
        Ok(())
    }

    /// Repeats a storage operation until it succeeds
    ///
    /// Unavailability is retried without limit; a constraint failure that the
    /// writer could not pin on a single record fails the partition.
    async fn retry_storage<T, F>(
        &mut self,
        action: &'static str,
        op: F,
    ) -> Result<T, PartitionFailure>
    where
        F: FnMut(&mut BatchWriter<S>) -> StorageResult<T>,
    {
        self.retry_storage_from(action, 1, op).await
    }

    /// Like `retry_storage`, numbering the first try `first_attempt`
    async fn retry_storage_from<T, F>(
        &mut self,
        action: &'static str,
        first_attempt: u32,
        mut op: F,
    ) -> Result<T, PartitionFailure>
    where
        F: FnMut(&mut BatchWriter<S>) -> StorageResult<T>,
    {
        let mut attempt = first_attempt.saturating_sub(1);
        loop {
            attempt += 1;
            match op(&mut self.writer) {
                Ok(value) => return Ok(value),
                Err(e) => self.storage_backoff(action, attempt, e).await?,
            }
        }
    }

    async fn storage_backoff(
        &mut self,
        action: &'static str,
        attempt: u32,
        error: StorageError,
    ) -> Result<(), PartitionFailure> {
        if let StorageError::ConstraintViolation { .. } = error {
            return Err(PartitionFailure::Storage {
                partition: self.partition.id.clone(),
                message: error.to_string(),
            });
        }

        let delay = self.flush_policy.delay_for(attempt);
        tracing::warn!(
            "{} for partition {} failed (attempt {}): {}; retrying in {:?}",
            action,
            self.partition.id,
            attempt,
            error,
            delay
        );
        self.events.emit(CrawlEvent::StorageRetry {
            partition: self.partition.id.clone(),
            attempt,
            delay,
            error: error.to_string(),
        });
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn transition(&mut self, next: PartitionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!("Partition {}: {} -> {}", self.partition.id, self.state, next);
        self.state = next;
    }
}

fn describe(cursor: Option<&Cursor>) -> String {
    cursor.map_or_else(|| "<start>".to_string(), |c| c.to_string())
}
