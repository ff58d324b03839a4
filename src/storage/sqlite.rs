//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the storage traits.

use crate::github::{Cursor, Record};
use crate::state::PartitionState;
use crate::storage::schema::{get_schema_version, initialize_schema, UPSERT_REPOSITORY_SQL};
use crate::storage::traits::{
    classify_sqlite_error, CheckpointStore, RecordStore, StorageError, StorageResult,
};
use crate::storage::{Checkpoint, RepositoryRow, RunRecord, RunStatus};
use crate::StarlingError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// How long a writer waits on another connection's lock before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const REPOSITORY_COLUMNS: &str =
    "stable_id, owner, name, stargazer_count, observed_at, crawled_at, updated_at";

const CHECKPOINT_COLUMNS: &str =
    "partition_id, cursor, state, pages_fetched, records_written, last_error, updated_at";

/// SQLite storage backend
///
/// Each partition task opens its own instance; WAL mode lets them write to the
/// same file concurrently.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StarlingError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, StarlingError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Schema version stamped into the open database
    pub fn schema_version(&self) -> StorageResult<u32> {
        Ok(get_schema_version(&self.conn)?)
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, StarlingError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    // ===== Run Management =====

    pub fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs WHERE id = ?1",
                params![run_id],
                run_from_row,
            )
            .map_err(|_| StorageError::RunNotFound(run_id))
    }

    pub fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Marks a run finished with the given status
    pub fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Queries =====

    pub fn get_repository(&self, stable_id: &str) -> StorageResult<Option<RepositoryRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM repositories WHERE stable_id = ?1",
                    REPOSITORY_COLUMNS
                ),
                params![stable_id],
                repository_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn count_repositories(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM repositories", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Counts repositories whose star count falls in `[min, max]`
    pub fn count_in_star_range(&self, min: u64, max: Option<u64>) -> StorageResult<u64> {
        let count: i64 = match max {
            Some(max) => self.conn.query_row(
                "SELECT COUNT(*) FROM repositories WHERE stargazer_count BETWEEN ?1 AND ?2",
                params![min as i64, max as i64],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM repositories WHERE stargazer_count >= ?1",
                params![min as i64],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    /// Returns the most starred repositories, highest first
    pub fn top_repositories(&self, limit: usize) -> StorageResult<Vec<RepositoryRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM repositories ORDER BY stargazer_count DESC, stable_id LIMIT ?1",
            REPOSITORY_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![limit as i64], repository_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Checkpoints worth reporting, by partition id
    ///
    /// A partition that is marked fetching but has no cursor yet has made no
    /// durable progress and is left out.
    pub fn list_checkpoints(&self) -> StorageResult<Vec<Checkpoint>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM checkpoints
             WHERE NOT (cursor IS NULL AND state = ?1)
             ORDER BY partition_id",
            CHECKPOINT_COLUMNS
        ))?;

        let checkpoints = stmt
            .query_map(
                params![PartitionState::Fetching.to_db_string()],
                checkpoint_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(checkpoints)
    }

    /// Streams every repository, most starred first, into `visit`
    ///
    /// # Returns
    ///
    /// The number of rows visited
    pub fn for_each_repository<E, F>(&self, mut visit: F) -> Result<u64, E>
    where
        E: From<StorageError>,
        F: FnMut(RepositoryRow) -> Result<(), E>,
    {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM repositories ORDER BY stargazer_count DESC, stable_id",
                REPOSITORY_COLUMNS
            ))
            .map_err(StorageError::from)?;
        let mut rows = stmt.query([]).map_err(StorageError::from)?;

        let mut count = 0;
        while let Some(row) = rows.next().map_err(StorageError::from)? {
            visit(repository_from_row(row).map_err(StorageError::from)?)?;
            count += 1;
        }
        Ok(count)
    }
}

impl RecordStore for SqliteStorage {
    fn upsert_records(&mut self, records: &[Record]) -> StorageResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| classify_sqlite_error(e, ""))?;

        {
            let mut stmt = tx
                .prepare_cached(UPSERT_REPOSITORY_SQL)
                .map_err(|e| classify_sqlite_error(e, ""))?;

            // Row by row so a constraint failure names its record
            for record in records {
                let stars = i64::try_from(record.popularity_count).map_err(|_| {
                    StorageError::ConstraintViolation {
                        stable_id: record.stable_id.clone(),
                        message: format!("star count {} out of range", record.popularity_count),
                    }
                })?;

                stmt.execute(params![
                    record.stable_id,
                    record.owner,
                    record.name,
                    stars,
                    record.observed_at.to_rfc3339(),
                    now,
                ])
                .map_err(|e| classify_sqlite_error(e, &record.stable_id))?;
            }
        }

        tx.commit().map_err(|e| classify_sqlite_error(e, ""))?;
        Ok(records.len())
    }
}

impl CheckpointStore for SqliteStorage {
    fn load_checkpoint(&self, partition_id: &str) -> StorageResult<Option<Checkpoint>> {
        let checkpoint = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoints WHERE partition_id = ?1",
                    CHECKPOINT_COLUMNS
                ),
                params![partition_id],
                checkpoint_from_row,
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO checkpoints
                (partition_id, cursor, state, pages_fetched, records_written, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(partition_id) DO UPDATE SET
                cursor = excluded.cursor,
                state = excluded.state,
                pages_fetched = excluded.pages_fetched,
                records_written = excluded.records_written,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                checkpoint.partition_id,
                checkpoint.cursor.as_ref().map(Cursor::as_str),
                checkpoint.state.to_db_string(),
                checkpoint.pages_fetched as i64,
                checkpoint.records_written as i64,
                checkpoint.last_error,
                now,
            ],
        )?;
        Ok(())
    }

    fn set_partition_state(
        &mut self,
        partition_id: &str,
        state: PartitionState,
        last_error: Option<&str>,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO checkpoints (partition_id, cursor, state, last_error, updated_at)
             VALUES (?1, NULL, ?2, ?3, ?4)
             ON CONFLICT(partition_id) DO UPDATE SET
                state = excluded.state,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![partition_id, state.to_db_string(), last_error, now],
        )?;
        Ok(())
    }

    fn clear_checkpoint(&mut self, partition_id: &str) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM checkpoints WHERE partition_id = ?1",
            params![partition_id],
        )?;
        Ok(())
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Running),
    })
}

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<RepositoryRow> {
    Ok(RepositoryRow {
        stable_id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        stargazer_count: row.get::<_, i64>(3)? as u64,
        observed_at: row.get(4)?,
        crawled_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        partition_id: row.get(0)?,
        cursor: row.get::<_, Option<String>>(1)?.map(Cursor::new),
        state: PartitionState::from_db_string(&row.get::<_, String>(2)?)
            .unwrap_or(PartitionState::Idle),
        pages_fetched: row.get::<_, i64>(3)? as u64,
        records_written: row.get::<_, i64>(4)? as u64,
        last_error: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
