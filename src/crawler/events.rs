//! Structured crawl events
//!
//! The pipeline reports progress through an [`EventSink`]. Emission is
//! synchronous and must never block or fail from the caller's point of view.

use crate::state::PartitionState;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Something observable that happened inside a partition's crawl loop
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlEvent {
    PageFetched {
        partition: String,
        records: usize,
        has_next: bool,
        quota_remaining: Option<u32>,
    },
    RetryScheduled {
        partition: String,
        attempt: u32,
        delay: Duration,
        cause: &'static str,
    },
    QuotaPause {
        partition: String,
        wait: Duration,
    },
    BatchFlushed {
        partition: String,
        written: usize,
    },
    StorageRetry {
        partition: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    RecordRejected {
        partition: String,
        stable_id: String,
        reason: String,
    },
    CheckpointSaved {
        partition: String,
        cursor: Option<String>,
    },
    PartitionFinished {
        partition: String,
        state: PartitionState,
        records_written: u64,
    },
}

impl CrawlEvent {
    pub fn partition(&self) -> &str {
        match self {
            Self::PageFetched { partition, .. }
            | Self::RetryScheduled { partition, .. }
            | Self::QuotaPause { partition, .. }
            | Self::BatchFlushed { partition, .. }
            | Self::StorageRetry { partition, .. }
            | Self::RecordRejected { partition, .. }
            | Self::CheckpointSaved { partition, .. }
            | Self::PartitionFinished { partition, .. } => partition,
        }
    }
}

/// Consumer of crawl events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CrawlEvent);
}

/// Writes every event to the tracing subscriber under `starling::events`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: CrawlEvent) {
        match event {
            CrawlEvent::PageFetched {
                partition,
                records,
                has_next,
                quota_remaining,
            } => tracing::debug!(
                target: "starling::events",
                partition = %partition,
                records,
                has_next,
                quota_remaining = ?quota_remaining,
                "page fetched"
            ),
            CrawlEvent::RetryScheduled {
                partition,
                attempt,
                delay,
                cause,
            } => tracing::warn!(
                target: "starling::events",
                partition = %partition,
                attempt,
                delay_ms = delay.as_millis() as u64,
                cause,
                "retry scheduled"
            ),
            CrawlEvent::QuotaPause { partition, wait } => tracing::info!(
                target: "starling::events",
                partition = %partition,
                wait_secs = wait.as_secs(),
                "pausing for quota reset"
            ),
            CrawlEvent::BatchFlushed { partition, written } => tracing::debug!(
                target: "starling::events",
                partition = %partition,
                written,
                "batch flushed"
            ),
            CrawlEvent::StorageRetry {
                partition,
                attempt,
                delay,
                error,
            } => tracing::warn!(
                target: "starling::events",
                partition = %partition,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "storage unavailable, retrying"
            ),
            CrawlEvent::RecordRejected {
                partition,
                stable_id,
                reason,
            } => tracing::warn!(
                target: "starling::events",
                partition = %partition,
                stable_id = %stable_id,
                reason = %reason,
                "record rejected"
            ),
            CrawlEvent::CheckpointSaved { partition, cursor } => tracing::debug!(
                target: "starling::events",
                partition = %partition,
                cursor = cursor.as_deref().unwrap_or("<start>"),
                "checkpoint saved"
            ),
            CrawlEvent::PartitionFinished {
                partition,
                state,
                records_written,
            } => tracing::info!(
                target: "starling::events",
                partition = %partition,
                state = %state,
                records_written,
                "partition finished"
            ),
        }
    }
}

/// Forwards events to an unbounded channel
///
/// Sends never wait; once the receiver is dropped events are discarded.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: UnboundedSender<CrawlEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, UnboundedReceiver<CrawlEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: CrawlEvent) {
        let _ = self.tx.send(event);
    }
}
