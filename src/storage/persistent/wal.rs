//! Write-Ahead Log (WAL) for crash recovery.
//!
//! Every mutation of the predictor table is appended here before it is
//! applied in memory. On open the log is replayed on top of the latest
//! segments. Marks are logged as keys, not as the records they touched,
//! so replay recomputes the fan-out against the same table state.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::predictor::PredictorRecord;
use crate::utilization::UtilizationKey;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The operation being logged.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A new predictor was enabled with this initial record.
    PredictorEnabled(PredictorRecord),
    /// A predictor's mutable columns were replaced.
    PredictorSaved(PredictorRecord),
    /// Every predictor of this key was flagged as needing an update.
    PredictorsMarked {
        /// The key whose predictors were marked.
        key: UtilizationKey,
    },
    /// Checkpoint marker (all entries before this are persisted to segments)
    Checkpoint {
        /// Last sequence covered by the segment.
        up_to_sequence: u64,
    },
}

struct WalWriter {
    file: File,
    sequence: u64,
    /// Set when a failed append could not be rolled back.
    broken: bool,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal")
}

/// Write-Ahead Log for crash recovery.
///
/// Thread-safe via internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// If the file exists, reads the last sequence number and cuts off any
    /// torn entry at the tail so new appends start on a clean boundary.
    /// If the file doesn't exist, creates it with the header.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let exists = path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let sequence = if exists && file.metadata()?.len() >= codec::HEADER_LEN {
            let (last_sequence, valid_len) = Self::scan(path)?;
            if valid_len < file.metadata()?.len() {
                tracing::warn!(
                    path = %path.display(),
                    valid_len,
                    "truncating torn tail of write-ahead log"
                );
                file.set_len(valid_len)?;
                if sync_on_write {
                    file.sync_all()?;
                }
            }
            last_sequence
        } else {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file,
                sequence,
                broken: false,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.writer.lock().map_err(|_| poisoned())
    }

    /// Append an entry to the WAL.
    ///
    /// Returns the sequence number assigned to this entry. An append either
    /// lands completely or not at all: on failure the file is cut back to
    /// its previous length and the sequence number is not consumed.
    ///
    /// # Errors
    /// The underlying I/O error. If the rollback itself fails, this and
    /// every later append fail until the store is reopened.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.lock()?;
        if writer.broken {
            return Err(IoError::new(
                ErrorKind::Other,
                "write-ahead log has an unrecoverable partial append; reopen the store",
            ));
        }

        let candidate = writer.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        };

        let encoded = codec::encode(&entry)?;
        let start = writer.file.metadata()?.len();

        if let Err(e) = write_entry(&mut writer.file, &encoded, self.sync_on_write) {
            if let Err(rollback_err) = rollback(&writer.file, start) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback_err,
                    "failed to roll back write-ahead log append"
                );
                writer.broken = true;
            }
            return Err(e);
        }

        writer.sequence = candidate;

        Ok(candidate)
    }

    /// Iterate over all entries in the WAL.
    ///
    /// Used during recovery to replay mutations.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Get the WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Raise the sequence counter to at least `sequence`.
    ///
    /// Called after segments are loaded so new entries sort after everything
    /// already compacted, even when the log itself is empty.
    pub fn advance_sequence(&self, sequence: u64) -> IoResult<()> {
        let mut writer = self.lock()?;
        writer.sequence = writer.sequence.max(sequence);
        Ok(())
    }

    /// Truncate the WAL after a checkpoint (compaction).
    ///
    /// Only call this after the checkpointed segment is durable. The
    /// sequence counter keeps running so it never goes backwards.
    pub fn truncate(&self) -> IoResult<()> {
        let mut writer = self.lock()?;

        {
            let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
            codec::write_header(&mut file)?;
            if self.sync_on_write {
                file.sync_all()?;
            }
        }

        writer.file = OpenOptions::new().append(true).open(&self.path)?;

        Ok(())
    }

    /// Returns the last good sequence and the byte length of the valid prefix.
    ///
    /// A torn final entry ends the scan; a CRC failure is an error.
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last_seq = 0;
        let mut valid_len = iter.position()?;

        while let Some(entry) = iter.next() {
            let entry = entry?;
            last_seq = entry.sequence;
            valid_len = iter.position()?;
        }

        Ok((last_seq, valid_len))
    }
}

fn write_entry(file: &mut File, encoded: &[u8], sync: bool) -> IoResult<()> {
    file.write_all(encoded)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

/// Cut the log back to `len` bytes, dropping a partial append.
fn rollback(file: &File, len: u64) -> IoResult<()> {
    file.set_len(len)?;
    file.sync_all()
}

/// Iterator over WAL entries.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;

        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }

    fn at_eof(&mut self) -> IoResult<bool> {
        Ok(self.position()? >= self.file_size)
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.at_eof() {
            Ok(true) => return None,
            Ok(false) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!("write-ahead log ends with a partial entry; ignoring it");
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::predictor::PredictorId;
    use crate::utilization::{CapacityType, FacilityId, Usage};

    fn key() -> UtilizationKey {
        UtilizationKey::new(FacilityId::new(1), CapacityType::Car, Usage::ParkAndRide)
    }

    #[test]
    fn test_wal_append_and_iterate() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        let record = PredictorRecord::new(PredictorId::new(1), "type", key());
        wal.append(WalEntryKind::PredictorEnabled(record)).unwrap();
        wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        drop(wal);

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert!(matches!(entries[0].kind, WalEntryKind::PredictorEnabled(_)));
        assert!(matches!(entries[1].kind, WalEntryKind::PredictorsMarked { key: k } if k == key()));
    }

    #[test]
    fn test_torn_tail_is_cut_on_open() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("torn.wal");

        {
            let wal = WriteAheadLog::open(&wal_path, true).unwrap();
            wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap();
            wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap();
        }
        let len = std::fs::metadata(&wal_path).unwrap().len();
        OpenOptions::new().write(true).open(&wal_path).unwrap().set_len(len - 4).unwrap();

        let wal = WriteAheadLog::open(&wal_path, true).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap();
        drop(wal);

        let wal = WriteAheadLog::open(&wal_path, true).unwrap();
        let sequences: Vec<u64> = wal.iter().unwrap().map(|e| e.unwrap().sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_truncate_empties_log_but_keeps_sequence() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        wal.append(WalEntryKind::Checkpoint { up_to_sequence: 0 }).unwrap();
        wal.truncate().unwrap();

        assert_eq!(wal.current_sequence().unwrap(), 1);
        assert_eq!(wal.size_bytes().unwrap(), codec::HEADER_LEN);
        assert_eq!(wal.iter().unwrap().count(), 0);

        assert_eq!(wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap(), 2);
    }

    #[test]
    fn test_failed_append_keeps_log_replayable() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("fail.wal");

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap();
        let len = wal.size_bytes().unwrap();

        // A read-only handle makes both the write and the rollback fail.
        wal.writer.lock().unwrap().file = File::open(&wal_path).unwrap();
        assert!(wal.append(WalEntryKind::PredictorsMarked { key: key() }).is_err());
        assert_eq!(wal.current_sequence().unwrap(), 1);
        assert_eq!(wal.size_bytes().unwrap(), len);

        // Refuses further writes rather than appending after unknown bytes.
        wal.writer.lock().unwrap().file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        assert!(wal.append(WalEntryKind::PredictorsMarked { key: key() }).is_err());
        assert_eq!(wal.size_bytes().unwrap(), len);
        drop(wal);

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        assert_eq!(wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap(), 2);
        let sequences: Vec<u64> = wal.iter().unwrap().map(|e| e.unwrap().sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_rollback_drops_partial_entry() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("rollback.wal");

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap();
        let len = wal.size_bytes().unwrap();

        let encoded = codec::encode(&WalEntry {
            sequence: 2,
            timestamp: Utc::now(),
            kind: WalEntryKind::PredictorsMarked { key: key() },
        })
        .unwrap();
        {
            let mut writer = wal.writer.lock().unwrap();
            writer.file.write_all(&encoded[..encoded.len() / 2]).unwrap();
            rollback(&writer.file, len).unwrap();
        }

        assert_eq!(wal.size_bytes().unwrap(), len);
        assert_eq!(wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap(), 2);
        let sequences: Vec<u64> = wal.iter().unwrap().map(|e| e.unwrap().sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_advance_sequence_never_lowers() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(&dir.path().join("adv.wal"), false).unwrap();

        wal.advance_sequence(10).unwrap();
        wal.advance_sequence(3).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 10);
        assert_eq!(wal.append(WalEntryKind::PredictorsMarked { key: key() }).unwrap(), 11);
    }
}
