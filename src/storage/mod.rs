//! Storage module for persisting crawl data
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite database initialization and schema management
//! - Batched repository upserts
//! - Per-partition cursor checkpoints
//! - Run tracking and resumption support

mod schema;
mod sqlite;
mod traits;

pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteStorage;
pub use traits::{classify_sqlite_error, CheckpointStore, RecordStore, StorageError, StorageResult};

use crate::github::Cursor;
use crate::state::PartitionState;
use crate::StarlingError;

use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(StarlingError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, StarlingError> {
    SqliteStorage::new(path)
}

/// Durable progress of one partition
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub partition_id: String,
    /// Resume point; `None` means start from the first page
    pub cursor: Option<Cursor>,
    pub state: PartitionState,
    pub pages_fetched: u64,
    pub records_written: u64,
    pub last_error: Option<String>,
    pub updated_at: String,
}

impl Checkpoint {
    /// A fresh checkpoint with no progress
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            cursor: None,
            state: PartitionState::Idle,
            pages_fetched: 0,
            records_written: 0,
            last_error: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// A stored repository row
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRow {
    pub stable_id: String,
    pub owner: String,
    pub name: String,
    pub stargazer_count: u64,
    pub observed_at: String,
    pub crawled_at: String,
    pub updated_at: String,
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
