//! Segment files holding compacted predictor table snapshots.
//!
//! Segments are immutable. Each one holds a full [`TableSnapshot`] taken at
//! compaction time together with the WAL sequence range it covers.
//!
//! # Design
//! - Segments are numbered sequentially (`segment_00001.seg`, ...)
//! - Each segment is `[file header][SegmentHeader][TableSnapshot]`
//! - Files are written to a temp path and renamed into place

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::table::TableSnapshot;

use super::codec;

const SEGMENT_EXTENSION: &str = "seg";
const SEGMENT_PREFIX: &str = "segment_";

/// A single segment file.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    /// Sequence range covered by this segment [inclusive, inclusive].
    pub sequence_range: (u64, u64),
}

impl Segment {
    /// Open an existing segment, reading only its header.
    pub fn open(path: &Path) -> IoResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let _version = codec::read_header(&mut reader)?;
        let header: SegmentHeader = codec::decode(&mut reader)?;

        Ok(Self {
            path: path.to_path_buf(),
            sequence_range: (header.sequence_start, header.sequence_end),
        })
    }

    /// Get the path to this segment.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot stored in this segment.
    pub fn read_snapshot(&self) -> IoResult<TableSnapshot> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let _version = codec::read_header(&mut reader)?;
        let _header: SegmentHeader = codec::decode(&mut reader)?;
        codec::decode(&mut reader)
    }
}

/// Segment file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// First sequence number in this segment.
    pub sequence_start: u64,
    /// Last sequence number in this segment.
    pub sequence_end: u64,
    /// Number of predictor records in this segment.
    pub record_count: u64,
    /// Timestamp when this segment was created.
    pub created_at: DateTime<Utc>,
}

/// Builder for creating segment files atomically.
///
/// Uses write-to-temp-then-rename pattern for crash safety.
pub struct SegmentWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    sequence_start: u64,
    sequence_end: u64,
}

impl SegmentWriter {
    /// Create a new segment writer targeting `final_path`.
    pub fn new(final_path: PathBuf, sequence_start: u64) -> IoResult<Self> {
        let temp_path = final_path.with_extension(format!("{SEGMENT_EXTENSION}.{}.tmp", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            writer: Some(writer),
            sequence_start,
            sequence_end: sequence_start,
        })
    }

    /// Write the snapshot. May only be called once.
    pub fn write_snapshot(&mut self, snapshot: &TableSnapshot, sequence_end: u64) -> IoResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "writer already consumed"))?;

        let header = SegmentHeader {
            sequence_start: self.sequence_start,
            sequence_end,
            record_count: snapshot.records.len() as u64,
            created_at: Utc::now(),
        };
        writer.write_all(&codec::encode(&header)?)?;
        writer.write_all(&codec::encode(snapshot)?)?;
        self.sequence_end = sequence_end;

        Ok(())
    }

    /// Finalize the segment (flush, fsync, rename).
    ///
    /// This is the commit point: after this returns successfully the
    /// segment is durable.
    pub fn finalize(mut self) -> IoResult<Segment> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "writer already consumed"))?;
        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "temp_path already consumed"))?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &self.final_path)?;

        Ok(Segment {
            path: self.final_path.clone(),
            sequence_range: (self.sequence_start, self.sequence_end),
        })
    }

    /// Abort the write (cleanup temp file).
    pub fn abort(mut self) -> IoResult<()> {
        self.writer.take();
        if let Some(temp_path) = self.temp_path.take() {
            if temp_path.exists() {
                fs::remove_file(temp_path)?;
            }
        }
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Some(ref temp_path) = self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}

/// Manages segment files for a store directory.
#[derive(Debug)]
pub struct SegmentManager {
    dir: PathBuf,
    segments: Vec<Segment>,
    next_segment_id: u32,
}

fn segment_number(path: &Path) -> Option<u32> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}

impl SegmentManager {
    /// Open or create a segment manager for the given directory.
    ///
    /// Stale temp files from interrupted compactions are removed.
    ///
    /// # Errors
    /// `InvalidData` if any segment header cannot be read.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        let mut next_segment_id = 1u32;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().is_some_and(|e| e == "tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }

            let Some(id) = segment_number(&path) else {
                continue;
            };
            next_segment_id = next_segment_id.max(id + 1);

            // The newest segment may be the only copy of the table.
            let segment = Segment::open(&path).map_err(|e| {
                IoError::new(
                    ErrorKind::InvalidData,
                    format!("corrupted segment {}: {e}", path.display()),
                )
            })?;
            segments.push(segment);
        }

        segments.sort_by_key(|s| s.sequence_range.0);

        Ok(Self {
            dir: dir.to_path_buf(),
            segments,
            next_segment_id,
        })
    }

    /// Get the directory containing segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get all segments, ordered by sequence.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Last WAL sequence covered by any segment (0 if none).
    #[must_use]
    pub fn persisted_sequence(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.sequence_range.1)
            .max()
            .unwrap_or(0)
    }

    /// Delete every segment except the newest; returns how many were removed.
    ///
    /// Each segment is a full snapshot, so older ones are redundant once a
    /// newer one is durable.
    pub fn retire_superseded(&mut self) -> IoResult<usize> {
        if self.segments.len() <= 1 {
            return Ok(0);
        }
        let keep = self.segments.split_off(self.segments.len() - 1);
        let retired = std::mem::replace(&mut self.segments, keep);
        for segment in &retired {
            fs::remove_file(segment.path())?;
        }
        Ok(retired.len())
    }

    /// Allocate a path for a new segment.
    pub fn next_segment_path(&mut self) -> PathBuf {
        let name = format!("{SEGMENT_PREFIX}{:05}.{SEGMENT_EXTENSION}", self.next_segment_id);
        self.next_segment_id += 1;
        self.dir.join(name)
    }

    /// Create a new segment writer.
    pub fn create_segment_writer(&mut self, sequence_start: u64) -> IoResult<SegmentWriter> {
        let path = self.next_segment_path();
        SegmentWriter::new(path, sequence_start)
    }

    /// Register a newly created segment.
    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
        self.segments.sort_by_key(|s| s.sequence_range.0);
    }

    /// Merge all segments into one snapshot; later segments override earlier ones.
    pub fn load_snapshot(&self) -> IoResult<TableSnapshot> {
        let mut records = BTreeMap::new();
        let mut last_id = 0;

        for segment in &self.segments {
            let snapshot = segment.read_snapshot()?;
            last_id = last_id.max(snapshot.last_id);
            for record in snapshot.records {
                records.insert(record.predictor_id, record);
            }
        }

        Ok(TableSnapshot {
            last_id,
            records: records.into_values().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::predictor::{PredictorId, PredictorRecord};
    use crate::utilization::{CapacityType, FacilityId, Usage, UtilizationKey};

    fn record(id: u64, more_utilizations: bool) -> PredictorRecord {
        let key = UtilizationKey::new(FacilityId::new(1), CapacityType::Car, Usage::ParkAndRide);
        let mut record = PredictorRecord::new(PredictorId::new(id), format!("type-{id}"), key);
        record.more_utilizations = more_utilizations;
        record
    }

    fn write(manager: &mut SegmentManager, snapshot: &TableSnapshot, range: (u64, u64)) {
        let mut writer = manager.create_segment_writer(range.0).unwrap();
        writer.write_snapshot(snapshot, range.1).unwrap();
        let segment = writer.finalize().unwrap();
        manager.add_segment(segment);
    }

    #[test]
    fn test_segment_manager_open_empty() {
        let dir = tempdir().unwrap();
        let manager = SegmentManager::open(dir.path()).unwrap();

        assert!(manager.segments().is_empty());
        assert_eq!(manager.load_snapshot().unwrap(), TableSnapshot::default());
    }

    #[test]
    fn test_segment_path_allocation() {
        let dir = tempdir().unwrap();
        let mut manager = SegmentManager::open(dir.path()).unwrap();

        let path1 = manager.next_segment_path();
        let path2 = manager.next_segment_path();

        assert!(path1.to_string_lossy().ends_with("segment_00001.seg"));
        assert!(path2.to_string_lossy().ends_with("segment_00002.seg"));
    }

    #[test]
    fn test_later_segments_override_earlier() {
        let dir = tempdir().unwrap();
        let mut manager = SegmentManager::open(dir.path()).unwrap();

        let first = TableSnapshot {
            last_id: 2,
            records: vec![record(1, true), record(2, true)],
        };
        write(&mut manager, &first, (1, 4));
        let second = TableSnapshot {
            last_id: 3,
            records: vec![record(1, false), record(3, true)],
        };
        write(&mut manager, &second, (5, 9));

        let mut reopened = SegmentManager::open(dir.path()).unwrap();
        assert_eq!(reopened.segments().len(), 2);
        assert_eq!(reopened.segments()[1].sequence_range, (5, 9));

        assert_eq!(reopened.persisted_sequence(), 9);

        let merged = reopened.load_snapshot().unwrap();
        assert_eq!(merged.last_id, 3);
        assert_eq!(merged.records.len(), 3);
        assert!(!merged.records[0].more_utilizations);

        assert_eq!(reopened.retire_superseded().unwrap(), 1);
        assert_eq!(reopened.segments().len(), 1);
        assert_eq!(reopened.persisted_sequence(), 9);
        assert_eq!(SegmentManager::open(dir.path()).unwrap().segments().len(), 1);
    }

    #[test]
    fn test_unreadable_segment_fails_open() {
        let dir = tempdir().unwrap();
        let mut manager = SegmentManager::open(dir.path()).unwrap();
        let snapshot = TableSnapshot {
            last_id: 1,
            records: vec![record(1, true)],
        };
        write(&mut manager, &snapshot, (1, 1));

        let path = manager.segments()[0].path().to_path_buf();
        fs::write(&path, b"PRDS").unwrap();

        let err = SegmentManager::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("segment_00001.seg"), "{err}");
    }

    #[test]
    fn test_segment_writer_abort_removes_temp_file() {
        let dir = tempdir().unwrap();
        let mut manager = SegmentManager::open(dir.path()).unwrap();

        let writer = manager.create_segment_writer(1).unwrap();
        let temp_path = writer.temp_path.clone().unwrap();
        assert!(temp_path.exists());

        writer.abort().unwrap();
        assert!(!temp_path.exists());
        assert!(SegmentManager::open(dir.path()).unwrap().segments().is_empty());
    }
}
