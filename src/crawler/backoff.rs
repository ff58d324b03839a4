//! Retry and quota-pause policy around remote calls

use crate::config::RetryConfig;
use crate::crawler::events::{CrawlEvent, EventSink};
use crate::github::QueryError;
use crate::state::QuotaTracker;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a wrapped call ultimately failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackoffError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: QueryError },

    #[error("cancelled while waiting")]
    Cancelled,
}

/// Outcome of one retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again
    Retry(Duration),
    Stop,
}

/// Exponential backoff with a cap and optional full jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Policy for remote calls
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter)
    }

    /// Policy for storage writes, which are retried without an attempt limit
    pub fn for_flush(config: &RetryConfig) -> Self {
        Self::new(
            u32::MAX,
            Duration::from_millis(config.flush_base_delay_ms),
            Duration::from_millis(config.flush_max_delay_ms),
        )
        .with_jitter(config.jitter)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound of the wait after failed attempt `attempt` (1-based)
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let cap = self.max_delay.as_millis() as u64;
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(cap))
    }

    /// Actual wait after failed attempt `attempt`, jittered if enabled
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_ceiling(attempt);
        if self.jitter && !ceiling.is_zero() {
            let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
            Duration::from_millis(millis)
        } else {
            ceiling
        }
    }

    /// Decides what follows failed attempt `attempt` (1-based)
    pub fn decide(&self, attempt: u32, error: &QueryError) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_attempts {
            RetryDecision::Stop
        } else {
            RetryDecision::Retry(self.delay_for(attempt))
        }
    }
}

/// Wraps remote calls with quota pauses and classified retries
pub struct BackoffController {
    label: String,
    policy: RetryPolicy,
    quota: Arc<QuotaTracker>,
    max_quota_wait: Duration,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl BackoffController {
    /// # Arguments
    ///
    /// * `label` - Partition id attached to logs and events
    /// * `policy` - Retry schedule for retryable failures
    /// * `quota` - Tracker of the credential the calls are made with
    /// * `max_quota_wait` - Longest single sleep while waiting for a reset
    pub fn new(
        label: impl Into<String>,
        policy: RetryPolicy,
        quota: Arc<QuotaTracker>,
        max_quota_wait: Duration,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            label: label.into(),
            policy,
            quota,
            max_quota_wait,
            events,
            cancel,
        }
    }

    pub fn from_config(
        label: impl Into<String>,
        config: &RetryConfig,
        quota: Arc<QuotaTracker>,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(
            label,
            RetryPolicy::from_config(config),
            quota,
            Duration::from_secs(config.max_quota_wait_secs),
            events,
            cancel,
        )
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of attempts
    ///
    /// Before each attempt a call is acquired from the quota tracker; while it
    /// asks for a pause the controller sleeps and asks again, so no attempt
    /// starts while `should_pause()` holds.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, BackoffError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let mut attempt = 0u32;

        loop {
            self.acquire_quota().await?;
            attempt += 1;

            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.policy.decide(attempt, &error) {
                RetryDecision::Retry(delay) => {
                    tracing::debug!(
                        partition = %self.label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "{}",
                        error
                    );
                    self.events.emit(CrawlEvent::RetryScheduled {
                        partition: self.label.clone(),
                        attempt,
                        delay,
                        cause: error.kind(),
                    });
                    self.sleep(delay).await?;
                }
                RetryDecision::Stop => {
                    return Err(match error {
                        QueryError::Unauthorized(message) => BackoffError::Unauthorized(message),
                        QueryError::Malformed(message) => BackoffError::Malformed(message),
                        last => BackoffError::Exhausted {
                            attempts: attempt,
                            last,
                        },
                    });
                }
            }
        }
    }

    /// Sleeps until the tracker grants a call; the grant charges it
    async fn acquire_quota(&self) -> Result<(), BackoffError> {
        while let Err(wait) = self.quota.try_acquire() {
            let wait = wait.min(self.max_quota_wait);
            tracing::info!(
                "Quota for {} nearly exhausted ({} left), {} pausing for {}s",
                self.quota.label(),
                self.quota.remaining().unwrap_or(0),
                self.label,
                wait.as_secs()
            );
            self.events.emit(CrawlEvent::QuotaPause {
                partition: self.label.clone(),
                wait,
            });
            self.sleep(wait).await?;
        }
        Ok(())
    }

    async fn sleep(&self, duration: Duration) -> Result<(), BackoffError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BackoffError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
