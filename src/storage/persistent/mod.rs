//! Persistent storage backend for predictor state.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//! - Segment snapshots written on compaction
//!
//! # Layout
//!
//! ```text
//! <dir>/
//! ├── .lock                    exclusive advisory lock
//! ├── predictors.wal           append-only mutation log
//! └── segments/
//!     └── segment_00001.seg    table snapshot
//! ```

mod codec;
mod file_lock;
mod segment;
mod stores;
mod wal;

pub use file_lock::FileLock;
pub use segment::{Segment, SegmentManager};
pub use stores::{CompactionResult, PersistentPredictorStore, SEGMENTS_DIR, WAL_FILE};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use serde::Deserialize;

use crate::error::PredictorError;
use crate::storage::StorageError;

/// Configuration for persistent storage.
///
/// Deserializable so hosts can embed it in their own configuration files;
/// missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size (bytes) above which [`PersistentPredictorStore::maybe_compact`] compacts.
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
    /// Maximum segment size (bytes).
    pub max_segment_size: u64,
    /// Run [`PersistentPredictorStore::maybe_compact`] right after recovery.
    pub compact_on_open: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
            max_segment_size: 256 * 1024 * 1024,
            compact_on_open: false,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024;
    const MIN_SEGMENT_SIZE: u64 = 16 * 1024;

    /// Check the minimum sizes.
    ///
    /// # Errors
    /// - `InvalidConfig` if a size is below its minimum
    pub fn validate(self) -> Result<Self, StorageError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }

        if self.max_segment_size < Self::MIN_SEGMENT_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "max_segment_size must be at least {} bytes (got {})",
                Self::MIN_SEGMENT_SIZE,
                self.max_segment_size
            )));
        }

        Ok(self)
    }
}

/// Open or create a persistent predictor store at the given path.
///
/// # Arguments
/// * `path` - Directory to store the files in
/// * `config` - Optional configuration (uses defaults if None)
///
/// # Errors
/// - If the configuration is invalid
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If WAL replay fails due to corruption
///
/// # Example
/// ```rust,no_run
/// use parkandride_predictor::storage::persistent::open_database;
/// use parkandride_predictor::PredictorStore;
///
/// let store = open_database("./predictors.db", None)?;
/// let due = store.find_predictors_needing_update()?;
/// # Ok::<(), parkandride_predictor::PredictorError>(())
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentPredictorStore, PredictorError> {
    Ok(PersistentPredictorStore::open(path.as_ref(), config.unwrap_or_default())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_validation() {
        assert!(PersistentConfig::default().validate().is_ok());

        let tiny = PersistentConfig {
            max_wal_size: 16,
            ..PersistentConfig::default()
        };
        let err = tiny.validate().unwrap_err();
        assert!(err.to_string().contains("max_wal_size"));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: PersistentConfig =
            serde_json::from_str(r#"{"sync_on_write": false, "compact_on_open": true}"#).unwrap();
        assert!(!cfg.sync_on_write);
        assert!(cfg.compact_on_open);
        assert_eq!(cfg.max_wal_size, PersistentConfig::default().max_wal_size);
    }

    #[test]
    fn test_open_database_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let cfg = PersistentConfig {
            max_segment_size: 1,
            ..PersistentConfig::default()
        };
        let err = open_database(dir.path(), Some(cfg)).unwrap_err();
        assert!(err.is_storage());
    }

    #[test]
    fn test_second_open_fails_while_locked() {
        let dir = tempdir().unwrap();
        let _first = open_database(dir.path(), None).unwrap();
        let err = open_database(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("lock"));
    }
}
