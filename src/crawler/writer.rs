//! Bounded batch of records flushed to a [`RecordStore`]

use crate::github::Record;
use crate::storage::{RecordStore, StorageError, StorageResult};
use std::collections::BTreeMap;

/// A record the store refused, dropped from its batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub stable_id: String,
    pub reason: String,
}

/// Result of a successful flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    /// Records excluded since the last successful flush
    pub rejected: Vec<RejectedRecord>,
}

/// What happened to a record handed to [`BatchWriter::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Buffered,
    /// The batch hit its size limit and was written out
    Flushed(FlushReport),
}

/// Accumulates records keyed by `stable_id` (last write wins) and upserts
/// them once the batch reaches `max_size`
///
/// The batch is only cleared after the store reports success, so a failed
/// flush can simply be retried.
pub struct BatchWriter<S> {
    store: S,
    batch: BTreeMap<String, Record>,
    max_size: usize,
    rejected: Vec<RejectedRecord>,
}

impl<S: RecordStore> BatchWriter<S> {
    pub fn new(store: S, max_size: usize) -> Self {
        Self {
            store,
            batch: BTreeMap::new(),
            max_size: max_size.max(1),
            rejected: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Buffers a record, flushing once the batch is full
    ///
    /// On error the record stays buffered and the caller is expected to retry
    /// [`flush`](Self::flush) until it succeeds.
    pub fn add(&mut self, record: Record) -> StorageResult<AddOutcome> {
        self.batch.insert(record.stable_id.clone(), record);

        if self.batch.len() >= self.max_size {
            self.flush().map(AddOutcome::Flushed)
        } else {
            Ok(AddOutcome::Buffered)
        }
    }

    /// Writes the whole batch in one upsert
    ///
    /// A constraint violation removes the offending record and retries the
    /// rest; any other failure leaves the batch untouched.
    pub fn flush(&mut self) -> StorageResult<FlushReport> {
        loop {
            if self.batch.is_empty() {
                return Ok(FlushReport {
                    written: 0,
                    rejected: std::mem::take(&mut self.rejected),
                });
            }

            let records: Vec<Record> = self.batch.values().cloned().collect();

            match self.store.upsert_records(&records) {
                Ok(written) => {
                    self.batch.clear();
                    return Ok(FlushReport {
                        written,
                        rejected: std::mem::take(&mut self.rejected),
                    });
                }
                Err(StorageError::ConstraintViolation { stable_id, message }) => {
                    if self.batch.remove(&stable_id).is_none() {
                        return Err(StorageError::ConstraintViolation { stable_id, message });
                    }
                    tracing::warn!("Rejected record {}: {}", stable_id, message);
                    self.rejected.push(RejectedRecord {
                        stable_id,
                        reason: message,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::PartitionState;
    use crate::storage::{Checkpoint, CheckpointStore, RecordStore, SqliteStorage};
    use chrono::Utc;
    use std::collections::HashMap;

    pub(crate) fn record(id: &str, stars: u64) -> Record {
        Record {
            stable_id: id.to_string(),
            owner: "octo".to_string(),
            name: format!("repo-{}", id),
            popularity_count: stars,
            observed_at: Utc::now(),
        }
    }

    /// In-memory store that can be told to fail
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub rows: HashMap<String, Record>,
        pub upserts: Vec<Vec<String>>,
        pub failed_upserts: usize,
        pub fail_next: usize,
        pub reject_ids: Vec<String>,
        pub checkpoints: HashMap<String, Checkpoint>,
        /// Cursor of every save, with the number of successful upserts before it
        pub saves: Vec<(Option<String>, usize)>,
    }

    impl CheckpointStore for MemoryStore {
        fn load_checkpoint(&self, partition_id: &str) -> StorageResult<Option<Checkpoint>> {
            Ok(self.checkpoints.get(partition_id).cloned())
        }

        fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()> {
            self.saves.push((
                checkpoint.cursor.as_ref().map(|c| c.to_string()),
                self.upserts.len(),
            ));
            self.checkpoints
                .insert(checkpoint.partition_id.clone(), checkpoint.clone());
            Ok(())
        }

        fn set_partition_state(
            &mut self,
            partition_id: &str,
            state: PartitionState,
            last_error: Option<&str>,
        ) -> StorageResult<()> {
            let entry = self
                .checkpoints
                .entry(partition_id.to_string())
                .or_insert_with(|| Checkpoint::new(partition_id));
            entry.state = state;
            entry.last_error = last_error.map(str::to_string);
            Ok(())
        }

        fn clear_checkpoint(&mut self, partition_id: &str) -> StorageResult<()> {
            self.checkpoints.remove(partition_id);
            Ok(())
        }
    }

    impl RecordStore for MemoryStore {
        fn upsert_records(&mut self, records: &[Record]) -> StorageResult<usize> {
            if self.fail_next > 0 {
                self.fail_next -= 1;
                self.failed_upserts += 1;
                return Err(StorageError::Unavailable("database is locked".to_string()));
            }
            if let Some(bad) = records
                .iter()
                .find(|r| self.reject_ids.contains(&r.stable_id))
            {
                return Err(StorageError::ConstraintViolation {
                    stable_id: bad.stable_id.clone(),
                    message: "CHECK constraint failed".to_string(),
                });
            }
            self.upserts
                .push(records.iter().map(|r| r.stable_id.clone()).collect());
            for r in records {
                self.rows.insert(r.stable_id.clone(), r.clone());
            }
            Ok(records.len())
        }
    }

    #[test]
    fn test_last_write_wins_within_batch() {
        let mut writer = BatchWriter::new(MemoryStore::default(), 10);

        writer.add(record("A", 1)).unwrap();
        writer.add(record("A", 5)).unwrap();
        assert_eq!(writer.len(), 1);

        let report = writer.flush().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(writer.store().rows["A"].popularity_count, 5);
    }

    #[test]
    fn test_flushes_when_full() {
        let mut writer = BatchWriter::new(MemoryStore::default(), 2);

        assert_eq!(writer.add(record("A", 1)).unwrap(), AddOutcome::Buffered);
        match writer.add(record("B", 1)).unwrap() {
            AddOutcome::Flushed(report) => assert_eq!(report.written, 2),
            other => panic!("expected flush, got {:?}", other),
        }
        assert!(writer.is_empty());
    }

    #[test]
    fn test_unavailable_keeps_batch() {
        let store = MemoryStore {
            fail_next: 1,
            ..Default::default()
        };
        let mut writer = BatchWriter::new(store, 10);
        writer.add(record("A", 1)).unwrap();
        writer.add(record("B", 1)).unwrap();

        assert!(matches!(writer.flush(), Err(StorageError::Unavailable(_))));
        assert_eq!(writer.len(), 2);

        assert_eq!(writer.flush().unwrap().written, 2);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_failed_auto_flush_keeps_record() {
        let store = MemoryStore {
            fail_next: 1,
            ..Default::default()
        };
        let mut writer = BatchWriter::new(store, 1);

        assert!(writer.add(record("A", 1)).is_err());
        assert_eq!(writer.len(), 1);
        assert_eq!(writer.flush().unwrap().written, 1);
    }

    #[test]
    fn test_constraint_violation_excludes_record() {
        let store = MemoryStore {
            reject_ids: vec!["B".to_string()],
            ..Default::default()
        };
        let mut writer = BatchWriter::new(store, 10);
        for id in ["A", "B", "C"] {
            writer.add(record(id, 1)).unwrap();
        }

        let report = writer.flush().unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].stable_id, "B");
        assert_eq!(writer.store().upserts, vec![vec!["A", "C"]]);
    }

    #[test]
    fn test_flush_twice_is_idempotent() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let batch = vec![record("A", 1), record("B", 2)];

        storage.upsert_records(&batch).unwrap();
        let first: Vec<_> = ["A", "B"]
            .iter()
            .map(|id| storage.get_repository(id).unwrap().unwrap())
            .collect();

        storage.upsert_records(&batch).unwrap();
        let second: Vec<_> = ["A", "B"]
            .iter()
            .map(|id| storage.get_repository(id).unwrap().unwrap())
            .collect();

        assert_eq!(storage.count_repositories().unwrap(), 2);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.stargazer_count, b.stargazer_count);
            assert_eq!(a.owner, b.owner);
            assert_eq!(a.crawled_at, b.crawled_at);
        }
    }

    #[test]
    fn test_writer_over_sqlite_rejects_empty_owner() {
        let mut writer = BatchWriter::new(SqliteStorage::new_in_memory().unwrap(), 10);
        let mut bad = record("BAD", 1);
        bad.owner.clear();

        writer.add(record("A", 1)).unwrap();
        writer.add(bad).unwrap();

        let report = writer.flush().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.rejected[0].stable_id, "BAD");
        assert_eq!(writer.store().count_repositories().unwrap(), 1);
    }
}
