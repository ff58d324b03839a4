//! Storage traits and error types
//!
//! The crawl loop talks to durable state only through these two traits, so the
//! SQLite backend can be swapped for a test double that fails on demand.

use crate::github::Record;
use crate::state::PartitionState;
use crate::storage::Checkpoint;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store could not be reached or is locked; retrying may succeed
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A single record was rejected by a constraint
    #[error("Constraint violation for record '{stable_id}': {message}")]
    ConstraintViolation { stable_id: String, message: String },

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns the offending record id for per-record rejections
    pub fn rejected_id(&self) -> Option<&str> {
        match self {
            Self::ConstraintViolation { stable_id, .. } => Some(stable_id),
            _ => None,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Classifies a rusqlite failure raised while writing `stable_id`
pub fn classify_sqlite_error(error: rusqlite::Error, stable_id: &str) -> StorageError {
    match &error {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == ErrorCode::ConstraintViolation =>
        {
            StorageError::ConstraintViolation {
                stable_id: stable_id.to_string(),
                message: message.clone().unwrap_or_else(|| code.to_string()),
            }
        }
        _ => StorageError::Unavailable(error.to_string()),
    }
}

/// Destination for repository records
pub trait RecordStore: Send {
    /// Upserts all records as one atomic write
    ///
    /// Existing `stable_id`s get their mutable fields overwritten and
    /// `updated_at` refreshed; new ones are inserted with `crawled_at` set to
    /// the write time. On error nothing from the call is visible.
    ///
    /// # Returns
    ///
    /// The number of records written
    fn upsert_records(&mut self, records: &[Record]) -> StorageResult<usize>;
}

/// Durable per-partition progress
pub trait CheckpointStore: Send {
    /// Loads the checkpoint for a partition, if one was ever saved
    fn load_checkpoint(&self, partition_id: &str) -> StorageResult<Option<Checkpoint>>;

    /// Overwrites the checkpoint for `checkpoint.partition_id`
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()>;

    /// Records a state change without touching the cursor
    fn set_partition_state(
        &mut self,
        partition_id: &str,
        state: PartitionState,
        last_error: Option<&str>,
    ) -> StorageResult<()>;

    /// Forgets all progress for a partition
    fn clear_checkpoint(&mut self, partition_id: &str) -> StorageResult<()>;
}
