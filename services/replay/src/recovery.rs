//! Crash recovery index.
//!
//! A JSON sidecar in the data directory holding the stream identity, the last
//! known window bounds and the segment manifest. On startup the buffer either
//! reattaches to the listed segments or starts fresh; both are normal paths.
//!
//! ```text
//! data_dir/
//!   index.json
//!   segments/
//!     seg-0000000001.rseg
//!     ...
//! ```

use crate::error::RecoveryStaleError;
use crate::frame::SegmentId;
use crate::segment::{self, SegmentMeta};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const INDEX_VERSION: u32 = 1;
pub const INDEX_FILE: &str = "index.json";

/// Earliest and latest retained frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub earliest_sequence: u64,
    pub earliest_timestamp: DateTime<Utc>,
    pub latest_sequence: u64,
    pub latest_timestamp: DateTime<Utc>,
}

impl WindowBounds {
    /// Bounds spanned by the non-empty segments of a manifest.
    pub fn from_manifest(segments: &[SegmentMeta]) -> Option<Self> {
        let mut populated = segments.iter().filter(|meta| meta.frame_count > 0);
        let first = populated.next()?;
        let last = populated.last().unwrap_or(first);
        Some(Self {
            earliest_sequence: first.start_sequence,
            earliest_timestamp: first.start_time,
            latest_sequence: last.end_sequence,
            latest_timestamp: last.end_time,
        })
    }

    /// Smallest bounds covering both.
    pub fn union(self, other: WindowBounds) -> Self {
        let (earliest_sequence, earliest_timestamp) =
            if other.earliest_sequence < self.earliest_sequence {
                (other.earliest_sequence, other.earliest_timestamp)
            } else {
                (self.earliest_sequence, self.earliest_timestamp)
            };
        let (latest_sequence, latest_timestamp) = if other.latest_sequence > self.latest_sequence {
            (other.latest_sequence, other.latest_timestamp)
        } else {
            (self.latest_sequence, self.latest_timestamp)
        };
        Self {
            earliest_sequence,
            earliest_timestamp,
            latest_sequence,
            latest_timestamp,
        }
    }
}

/// Persisted snapshot of the buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferIndex {
    pub version: u32,
    pub stream_id: String,
    pub written_at: DateTime<Utc>,
    /// Last known window, RAM tier included
    pub window: Option<WindowBounds>,
    /// Live segments, oldest first
    pub segments: Vec<SegmentMeta>,
    pub next_segment_id: SegmentId,
}

impl BufferIndex {
    pub fn new(
        stream_id: impl Into<String>,
        written_at: DateTime<Utc>,
        window: Option<WindowBounds>,
        segments: Vec<SegmentMeta>,
        next_segment_id: SegmentId,
    ) -> Self {
        Self {
            version: INDEX_VERSION,
            stream_id: stream_id.into(),
            written_at,
            window,
            segments,
            next_segment_id,
        }
    }

    /// Bounds that can actually be served after a restart.
    pub fn disk_window(&self) -> Option<WindowBounds> {
        WindowBounds::from_manifest(&self.segments)
    }
}

/// Result of the startup recovery decision.
#[derive(Debug)]
pub enum RecoveryOutcome {
    Reattached(BufferIndex),
    Fresh { reason: RecoveryStaleError },
}

impl RecoveryOutcome {
    pub fn is_reattached(&self) -> bool {
        matches!(self, RecoveryOutcome::Reattached(_))
    }
}

/// Reads and writes the recovery index file.
pub struct RecoveryIndex {
    path: PathBuf,
    segment_dir: PathBuf,
    max_age: Duration,
    write_lock: Mutex<()>,
}

impl RecoveryIndex {
    pub fn new(data_dir: &Path, segment_dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: data_dir.join(INDEX_FILE),
            segment_dir: segment_dir.into(),
            max_age,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the index atomically (temp file, fsync, rename).
    pub fn persist(&self, index: &BufferIndex) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        self.write_file(index)
    }

    /// Build and write a snapshot under the write lock, so a snapshot taken
    /// earlier can never overwrite a later one.
    pub fn persist_with(&self, build: impl FnOnce() -> BufferIndex) -> io::Result<BufferIndex> {
        let _guard = self.write_lock.lock();
        let index = build();
        self.write_file(&index)?;
        Ok(index)
    }

    fn write_file(&self, index: &BufferIndex) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(index)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        debug!(
            segments = index.segments.len(),
            next_segment_id = index.next_segment_id,
            "Persisted recovery index"
        );
        Ok(())
    }

    /// Parse the index without checking it against the filesystem.
    pub fn read(&self) -> Result<BufferIndex, RecoveryStaleError> {
        let json = match std::fs::read(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(RecoveryStaleError::Missing),
            Err(e) => return Err(RecoveryStaleError::Unreadable(e.to_string())),
        };
        let index: BufferIndex = serde_json::from_slice(&json)
            .map_err(|e| RecoveryStaleError::Unreadable(e.to_string()))?;

        if index.version != INDEX_VERSION {
            return Err(RecoveryStaleError::UnsupportedVersion {
                found: index.version,
            });
        }
        Ok(index)
    }

    /// Load an index that is safe to reattach to.
    pub fn load(&self, stream_id: &str, now: DateTime<Utc>) -> Result<BufferIndex, RecoveryStaleError> {
        let index = self.read()?;

        if index.stream_id != stream_id {
            return Err(RecoveryStaleError::StreamMismatch {
                expected: stream_id.to_string(),
                found: index.stream_id,
            });
        }

        let age = now.signed_duration_since(index.written_at);
        if age.num_seconds() > self.max_age.as_secs() as i64 {
            return Err(RecoveryStaleError::TooOld {
                age_secs: age.num_seconds(),
                max_age_secs: self.max_age.as_secs(),
            });
        }

        if index.segments.is_empty() {
            return Err(RecoveryStaleError::Empty);
        }
        for meta in &index.segments {
            if !segment::verify(&self.segment_dir, meta) {
                return Err(RecoveryStaleError::SegmentMissing(
                    self.segment_dir.join(&meta.location),
                ));
            }
        }

        Ok(index)
    }

    /// Decide between reattaching and starting fresh.
    pub fn resolve(&self, stream_id: &str, now: DateTime<Utc>) -> RecoveryOutcome {
        match self.load(stream_id, now) {
            Ok(index) => {
                info!(
                    stream_id,
                    segments = index.segments.len(),
                    written_at = %index.written_at,
                    "Recovery index valid, reattaching"
                );
                RecoveryOutcome::Reattached(index)
            }
            Err(RecoveryStaleError::Missing) => {
                info!(stream_id, "No recovery index, starting fresh buffer");
                RecoveryOutcome::Fresh {
                    reason: RecoveryStaleError::Missing,
                }
            }
            Err(reason) => {
                warn!(stream_id, reason = %reason, "Recovery index stale, starting fresh buffer");
                self.discard();
                RecoveryOutcome::Fresh { reason }
            }
        }
    }

    pub fn discard(&self) {
        let _guard = self.write_lock.lock();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove recovery index");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::FrameCompressor;
    use crate::frame::{FrameEntry, PixelFormat, RawFrame};
    use crate::segment::SegmentWriter;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn entry(sequence: u64) -> FrameEntry {
        let frame = RawFrame::new(
            sequence,
            base_time() + chrono::Duration::milliseconds(sequence as i64 * 33),
            4,
            4,
            PixelFormat::Gray8,
            vec![128u8; 16],
        );
        FrameCompressor::new(60).compress(&frame).unwrap()
    }

    fn write_segment(dir: &Path, id: SegmentId, sequences: std::ops::RangeInclusive<u64>) -> SegmentMeta {
        let mut writer = SegmentWriter::create(dir, id).unwrap();
        for seq in sequences {
            writer.append(&entry(seq)).unwrap();
        }
        writer.seal().unwrap()
    }

    fn setup() -> (tempfile::TempDir, RecoveryIndex, Vec<SegmentMeta>) {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let segment_dir = tmp.path().join("segments");
        std::fs::create_dir_all(&segment_dir).unwrap();
        let segments = vec![
            write_segment(&segment_dir, 1, 1..=10),
            write_segment(&segment_dir, 2, 11..=20),
        ];
        let index = RecoveryIndex::new(tmp.path(), segment_dir, Duration::from_secs(3600));
        (tmp, index, segments)
    }

    fn snapshot(segments: &[SegmentMeta]) -> BufferIndex {
        BufferIndex::new(
            "camera-1",
            base_time(),
            WindowBounds::from_manifest(segments),
            segments.to_vec(),
            3,
        )
    }

    #[test]
    fn test_reattach_bounds_match_manifest() {
        let (_tmp, recovery, segments) = setup();
        recovery.persist(&snapshot(&segments)).unwrap();

        let outcome = recovery.resolve("camera-1", base_time() + chrono::Duration::seconds(5));
        let RecoveryOutcome::Reattached(index) = outcome else {
            panic!("expected reattach");
        };

        let bounds = index.disk_window().unwrap();
        assert_eq!(bounds.earliest_sequence, segments[0].start_sequence);
        assert_eq!(bounds.earliest_timestamp, segments[0].start_time);
        assert_eq!(bounds.latest_sequence, segments[1].end_sequence);
        assert_eq!(bounds.latest_timestamp, segments[1].end_time);
        assert_eq!(index.segments, segments);
        assert_eq!(index.next_segment_id, 3);
    }

    #[test]
    fn test_missing_index_starts_fresh() {
        let (_tmp, recovery, _) = setup();
        let outcome = recovery.resolve("camera-1", base_time());
        assert!(matches!(
            outcome,
            RecoveryOutcome::Fresh {
                reason: RecoveryStaleError::Missing
            }
        ));
    }

    #[test]
    fn test_stream_mismatch_is_stale() {
        let (_tmp, recovery, segments) = setup();
        recovery.persist(&snapshot(&segments)).unwrap();

        let result = recovery.load("camera-2", base_time());
        assert!(matches!(result, Err(RecoveryStaleError::StreamMismatch { .. })));
    }

    #[test]
    fn test_old_index_is_stale() {
        let (_tmp, recovery, segments) = setup();
        recovery.persist(&snapshot(&segments)).unwrap();

        let result = recovery.load("camera-1", base_time() + chrono::Duration::hours(2));
        assert!(matches!(result, Err(RecoveryStaleError::TooOld { .. })));
    }

    #[test]
    fn test_missing_segment_discards_index() {
        let (tmp, recovery, segments) = setup();
        recovery.persist(&snapshot(&segments)).unwrap();
        std::fs::remove_file(tmp.path().join("segments").join(&segments[1].location)).unwrap();

        let outcome = recovery.resolve("camera-1", base_time());
        assert!(matches!(
            outcome,
            RecoveryOutcome::Fresh {
                reason: RecoveryStaleError::SegmentMissing(_)
            }
        ));
        assert!(!recovery.path().exists());
    }

    #[test]
    fn test_corrupt_and_unsupported_index() {
        let (_tmp, recovery, segments) = setup();
        std::fs::write(recovery.path(), b"{ not json").unwrap();
        assert!(matches!(recovery.read(), Err(RecoveryStaleError::Unreadable(_))));

        let mut index = snapshot(&segments);
        index.version = 99;
        recovery.persist(&index).unwrap();
        assert!(matches!(
            recovery.read(),
            Err(RecoveryStaleError::UnsupportedVersion { found: 99 })
        ));
    }

    #[test]
    fn test_empty_manifest_is_stale() {
        let (_tmp, recovery, _) = setup();
        recovery.persist(&snapshot(&[])).unwrap();
        assert!(matches!(
            recovery.load("camera-1", base_time()),
            Err(RecoveryStaleError::Empty)
        ));
    }

    #[test]
    fn test_persist_replaces_atomically() {
        let (tmp, recovery, segments) = setup();
        recovery.persist(&snapshot(&segments[..1])).unwrap();
        recovery.persist(&snapshot(&segments)).unwrap();

        assert_eq!(recovery.read().unwrap().segments.len(), 2);
        assert!(!tmp.path().join("index.json.tmp").exists());
    }

    #[test]
    fn test_window_union() {
        let (_tmp, _, segments) = setup();
        let disk = WindowBounds::from_manifest(&segments).unwrap();
        let ram = WindowBounds {
            earliest_sequence: 21,
            earliest_timestamp: base_time() + chrono::Duration::seconds(10),
            latest_sequence: 30,
            latest_timestamp: base_time() + chrono::Duration::seconds(11),
        };

        let merged = disk.union(ram);
        assert_eq!(merged.earliest_sequence, 1);
        assert_eq!(merged.latest_sequence, 30);
        assert_eq!(merged.latest_timestamp, ram.latest_timestamp);
    }
}
