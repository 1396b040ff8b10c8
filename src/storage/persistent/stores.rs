//! Persistent predictor store.
//!
//! The store wraps:
//! - The shared [`PredictorTable`] for fast reads
//! - WAL integration for durable writes
//! - Segment manager for compacted snapshots

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};

use crate::predictor::{PredictorId, PredictorState};
use crate::storage::table::PredictorTable;
use crate::storage::traits::{PredictorStore, StorageError};
use crate::utilization::UtilizationKey;
use crate::validation::validate_predictor_type;

use super::file_lock::FileLock;
use super::segment::SegmentManager;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

/// WAL file name inside a store directory.
pub const WAL_FILE: &str = "predictors.wal";

/// Segment directory name inside a store directory.
pub const SEGMENTS_DIR: &str = "segments";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

/// Durable, single-process predictor store.
///
/// Every mutation is appended to the WAL while the table write lock is
/// held, then applied to the table. Log order therefore equals apply order
/// and replay reproduces the exact table.
pub struct PersistentPredictorStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    segments: RwLock<SegmentManager>,
    config: PersistentConfig,
    table: RwLock<PredictorTable>,
}

impl std::fmt::Debug for PersistentPredictorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentPredictorStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentPredictorStore {
    /// Open or create a store in `dir`.
    ///
    /// # Errors
    /// - `InvalidConfig` if `config` fails [`PersistentConfig::validate`]
    /// - `BackendError` if the directory cannot be created, another process
    ///   holds the lock, or the WAL or a segment is corrupted
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        let config = config.validate()?;
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create store directory", &e))?;

        let lock = FileLock::acquire(dir).map_err(|e| io_err("failed to acquire lock", &e))?;

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| io_err("failed to open WAL", &e))?;

        let segments = SegmentManager::open(&dir.join(SEGMENTS_DIR))
            .map_err(|e| io_err("failed to open segments", &e))?;

        let store = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            segments: RwLock::new(segments),
            config,
            table: RwLock::new(PredictorTable::new()),
        };

        let persisted = store.load_segments()?;
        store.replay_wal(persisted)?;

        if store.config.compact_on_open {
            store.maybe_compact()?;
        }

        Ok(store)
    }

    /// The store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &PersistentConfig {
        &self.config
    }

    fn write_table(&self, context: &'static str) -> Result<RwLockWriteGuard<'_, PredictorTable>, StorageError> {
        self.table.write().map_err(|_| lock_err(context))
    }

    fn append(&self, kind: WalEntryKind) -> Result<u64, StorageError> {
        self.wal
            .append(kind)
            .map_err(|e| io_err("WAL write failed", &e))
    }

    /// Load the merged segment snapshot; returns the sequence it covers.
    fn load_segments(&self) -> Result<u64, StorageError> {
        let segments = self.segments.read().map_err(|_| lock_err("segments.load"))?;
        if segments.segments().is_empty() {
            return Ok(0);
        }

        let snapshot = segments
            .load_snapshot()
            .map_err(|e| io_err("failed to load segment data", &e))?;
        let persisted = segments.persisted_sequence();
        drop(segments);

        let records = snapshot.records.len();
        *self.write_table("segments.load")? = PredictorTable::from_snapshot(snapshot)?;
        self.wal
            .advance_sequence(persisted)
            .map_err(|e| io_err("failed to advance WAL sequence", &e))?;

        tracing::debug!(records, persisted_sequence = persisted, "loaded predictor segments");
        Ok(persisted)
    }

    /// Replay WAL entries newer than `persisted` on top of the table.
    fn replay_wal(&self, persisted: u64) -> Result<(), StorageError> {
        let iter = self.wal.iter().map_err(|e| io_err("failed to iterate WAL", &e))?;
        let mut table = self.write_table("wal.replay")?;

        let mut count = 0usize;
        for entry in iter {
            let entry = entry.map_err(|e| io_err("corrupted WAL entry", &e))?;
            // Entries already folded into a segment survive a crash between
            // segment rename and WAL truncation.
            if entry.sequence <= persisted {
                continue;
            }

            match entry.kind {
                WalEntryKind::PredictorEnabled(record) => table.insert(record)?,
                WalEntryKind::PredictorSaved(record) => table.update(record)?,
                WalEntryKind::PredictorsMarked { key } => {
                    table.mark(key);
                }
                WalEntryKind::Checkpoint { .. } => {}
            }
            count += 1;
        }

        if count > 0 {
            tracing::info!(entries = count, predictors = table.len(), "replayed write-ahead log");
        }
        Ok(())
    }

    /// Compact the WAL into a segment file.
    ///
    /// This operation:
    /// 1. Snapshots the table (records and the id sequence)
    /// 2. Writes it atomically to a new segment file
    /// 3. Writes a checkpoint marker to the WAL
    /// 4. Truncates the WAL and retires older segments
    ///
    /// Writers are blocked for the duration. If it fails partway through,
    /// the WAL still holds every entry and is replayed on the next open.
    ///
    /// # Errors
    /// - `BackendError` on any I/O failure
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let table = self.write_table("compact")?;
        let mut segments = self.segments.write().map_err(|_| lock_err("compact"))?;

        let current_seq = self
            .wal
            .current_sequence()
            .map_err(|e| io_err("failed to read WAL sequence", &e))?;
        let persisted_seq = segments.persisted_sequence();
        let wal_size_before = self.wal_size()?;
        let entries_compacted = self.pending_entries(persisted_seq)?;

        if entries_compacted == 0 {
            return Ok(CompactionResult {
                entries_compacted: 0,
                records_written: 0,
                segment_path: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let snapshot = table.snapshot();
        let records_written = snapshot.records.len();

        let mut writer = segments
            .create_segment_writer(persisted_seq + 1)
            .map_err(|e| io_err("failed to create segment writer", &e))?;

        if let Err(e) = writer.write_snapshot(&snapshot, current_seq) {
            let _ = writer.abort();
            return Err(io_err("failed to write segment data", &e));
        }

        let segment = writer
            .finalize()
            .map_err(|e| io_err("failed to finalize segment", &e))?;
        let segment_path = segment.path().to_path_buf();
        segments.add_segment(segment);

        let segment_size = fs::metadata(&segment_path).map(|m| m.len()).unwrap_or(0);
        if segment_size > self.config.max_segment_size {
            tracing::warn!(
                segment_size,
                max_segment_size = self.config.max_segment_size,
                "segment exceeds configured maximum size"
            );
        }

        self.append(WalEntryKind::Checkpoint {
            up_to_sequence: current_seq,
        })?;
        self.wal.truncate().map_err(|e| io_err("failed to truncate WAL", &e))?;

        match segments.retire_superseded() {
            Ok(0) => {}
            Ok(retired) => tracing::debug!(retired, "removed superseded segments"),
            Err(e) => tracing::warn!(error = %e, "failed to remove superseded segments"),
        }

        let wal_size_after = self.wal_size()?;
        let result = CompactionResult {
            entries_compacted,
            records_written,
            segment_path: Some(segment_path),
            wal_size_before,
            wal_size_after,
        };
        tracing::info!(
            entries = result.entries_compacted,
            records = records_written,
            wal_size_before,
            wal_size_after,
            "compacted predictor store"
        );
        Ok(result)
    }

    /// Number of logged mutations not yet covered by a segment.
    fn pending_entries(&self, persisted: u64) -> Result<u64, StorageError> {
        let mut pending = 0;
        for entry in self.wal.iter().map_err(|e| io_err("failed to iterate WAL", &e))? {
            let entry = entry.map_err(|e| io_err("corrupted WAL entry", &e))?;
            if entry.sequence > persisted && !matches!(entry.kind, WalEntryKind::Checkpoint { .. }) {
                pending += 1;
            }
        }
        Ok(pending)
    }

    /// Compact if the WAL has grown past `max_wal_size`.
    ///
    /// # Errors
    /// Same as [`Self::compact`].
    pub fn maybe_compact(&self) -> Result<Option<CompactionResult>, StorageError> {
        if self.wal_size()? < self.config.max_wal_size {
            return Ok(None);
        }
        self.compact().map(Some)
    }

    /// Get the current WAL size in bytes.
    ///
    /// # Errors
    /// - `BackendError` if the WAL file metadata cannot be read
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal
            .size_bytes()
            .map_err(|e| io_err("failed to read WAL size", &e))
    }

    /// Get the number of segments.
    ///
    /// # Errors
    /// - `BackendError` if the segment lock is poisoned
    pub fn segment_count(&self) -> Result<usize, StorageError> {
        let segments = self.segments.read().map_err(|_| lock_err("segments.count"))?;
        Ok(segments.segments().len())
    }
}

/// Result of a compaction operation.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Number of WAL entries folded into the segment.
    pub entries_compacted: u64,
    /// Number of predictor records written to the segment.
    pub records_written: usize,
    /// Path to the new segment file (if created).
    pub segment_path: Option<PathBuf>,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

impl PredictorStore for PersistentPredictorStore {
    fn enable_predictor(
        &self,
        predictor_type: &str,
        utilization_key: UtilizationKey,
    ) -> Result<PredictorId, StorageError> {
        validate_predictor_type(predictor_type)?;

        {
            let table = self.table.read().map_err(|_| lock_err("predictor.enable"))?;
            if let Some(id) = table.find_identity(predictor_type, utilization_key) {
                return Ok(id);
            }
        }

        let mut table = self.write_table("predictor.enable")?;
        if let Some(id) = table.find_identity(predictor_type, utilization_key) {
            return Ok(id);
        }
        let record = table.next_record(predictor_type, utilization_key);
        let id = record.predictor_id;
        self.append(WalEntryKind::PredictorEnabled(record.clone()))?;
        table.insert(record)?;
        tracing::debug!(predictor_id = %id, predictor_type, key = %utilization_key, "predictor enabled");
        Ok(id)
    }

    fn get_by_id(&self, id: PredictorId) -> Result<PredictorState, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("predictor.get"))?;
        table
            .get(id)
            .cloned()
            .map(PredictorState::from)
            .ok_or(StorageError::PredictorNotFound(id))
    }

    fn save(&self, state: &PredictorState) -> Result<(), StorageError> {
        let record = state.validate()?;
        let mut table = self.write_table("predictor.save")?;
        // Reject before logging so the WAL only holds entries that replay cleanly.
        table.check_update(&record)?;
        self.append(WalEntryKind::PredictorSaved(record.clone()))?;
        table.update(record)?;
        tracing::debug!(
            predictor_id = %state.predictor_id,
            more_utilizations = state.more_utilizations,
            "predictor state saved"
        );
        Ok(())
    }

    fn find_all_predictors(&self) -> Result<Vec<PredictorState>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("predictor.find_all"))?;
        Ok(table.all_states())
    }

    fn find_predictors_needing_update(&self) -> Result<Vec<PredictorId>, StorageError> {
        let table = self
            .table
            .read()
            .map_err(|_| lock_err("predictor.find_needing_update"))?;
        Ok(table.needing_update())
    }

    fn find_by_utilization_key(
        &self,
        utilization_key: UtilizationKey,
    ) -> Result<Vec<PredictorState>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("predictor.find_by_key"))?;
        Ok(table.states_for_key(utilization_key))
    }

    fn mark_predictors_need_an_update(
        &self,
        utilization_key: UtilizationKey,
    ) -> Result<usize, StorageError> {
        let mut table = self.write_table("predictor.mark")?;
        if !table.has_key(utilization_key) {
            return Ok(0);
        }
        self.append(WalEntryKind::PredictorsMarked { key: utilization_key })?;
        let matched = table.mark(utilization_key);
        tracing::debug!(key = %utilization_key, matched, "predictors marked as needing an update");
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    use crate::predictor::InternalState;
    use crate::utilization::{CapacityType, FacilityId, Usage};

    fn key(facility: i64) -> UtilizationKey {
        UtilizationKey::new(FacilityId::new(facility), CapacityType::Car, Usage::ParkAndRide)
    }

    fn fast_config() -> PersistentConfig {
        PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        }
    }

    #[test]
    fn test_persistent_store_open_and_write() {
        let dir = tempdir().unwrap();

        let id = {
            let store = PersistentPredictorStore::open(dir.path(), fast_config()).unwrap();
            let id = store.enable_predictor("test", key(1)).unwrap();
            let mut state = store.get_by_id(id).unwrap();
            state.more_utilizations = false;
            state.internal_state = Some(InternalState::new("persisted"));
            state.latest_utilization = Some(Utc::now());
            store.save(&state).unwrap();
            id
        };

        let store = PersistentPredictorStore::open(dir.path(), fast_config()).unwrap();
        let state = store.get_by_id(id).unwrap();
        assert!(!state.more_utilizations);
        assert_eq!(state.internal_state, Some(InternalState::new("persisted")));
        assert_eq!(store.enable_predictor("test", key(1)).unwrap(), id);
    }

    #[test]
    fn test_compaction_creates_segment() {
        let dir = tempdir().unwrap();
        let store = PersistentPredictorStore::open(dir.path(), fast_config()).unwrap();

        for i in 0..10 {
            store.enable_predictor("simple", key(i)).unwrap();
        }

        let wal_size_before = store.wal_size().unwrap();
        assert!(wal_size_before > 0);
        assert_eq!(store.segment_count().unwrap(), 0);

        let result = store.compact().unwrap();

        assert_eq!(result.entries_compacted, 10);
        assert_eq!(result.records_written, 10);
        assert!(result.segment_path.is_some());
        assert!(result.wal_size_after < result.wal_size_before);
        assert_eq!(store.segment_count().unwrap(), 1);
    }

    #[test]
    fn test_compaction_empty_wal() {
        let dir = tempdir().unwrap();
        let store = PersistentPredictorStore::open(dir.path(), fast_config()).unwrap();

        let result = store.compact().unwrap();

        assert_eq!(result.entries_compacted, 0);
        assert!(result.segment_path.is_none());
    }

    #[test]
    fn test_repeated_compaction_keeps_one_segment() {
        let dir = tempdir().unwrap();
        let store = PersistentPredictorStore::open(dir.path(), fast_config()).unwrap();

        store.enable_predictor("a", key(1)).unwrap();
        store.compact().unwrap();
        store.enable_predictor("a", key(2)).unwrap();
        assert_eq!(store.compact().unwrap().entries_compacted, 1);
        assert!(store.compact().unwrap().segment_path.is_none());

        assert_eq!(store.segment_count().unwrap(), 1);
        assert_eq!(store.find_all_predictors().unwrap().len(), 2);
    }

    #[test]
    fn test_open_validates_config() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: 1,
            ..fast_config()
        };
        assert!(matches!(
            PersistentPredictorStore::open(dir.path(), config),
            Err(StorageError::InvalidConfig(_))
        ));
        assert!(!dir.path().join(WAL_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_wal_is_reported_not_treated_as_empty() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: 4 * 1024,
            ..fast_config()
        };
        let store = PersistentPredictorStore::open(dir.path(), config).unwrap();
        store.enable_predictor("a", key(1)).unwrap();

        fs::remove_file(dir.path().join(WAL_FILE)).unwrap();

        assert!(store.wal_size().is_err());
        assert!(store.maybe_compact().is_err());
        assert_eq!(store.segment_count().unwrap(), 0);
    }

    #[test]
    fn test_mark_without_match_is_not_logged() {
        let dir = tempdir().unwrap();
        let store = PersistentPredictorStore::open(dir.path(), fast_config()).unwrap();

        let before = store.wal_size().unwrap();
        assert_eq!(store.mark_predictors_need_an_update(key(99)).unwrap(), 0);
        assert_eq!(store.wal_size().unwrap(), before);
    }

    #[test]
    fn test_rejected_save_is_not_logged() {
        let dir = tempdir().unwrap();
        let store = PersistentPredictorStore::open(dir.path(), fast_config()).unwrap();
        let id = store.enable_predictor("a", key(1)).unwrap();
        let before = store.wal_size().unwrap();

        let mut state = store.get_by_id(id).unwrap();
        state.predictor_type = "b".to_string();
        assert!(matches!(
            store.save(&state),
            Err(StorageError::IdentityMismatch { .. })
        ));
        assert_eq!(store.wal_size().unwrap(), before);
    }
}
