//! Tiered frame buffer: RAM ring in front of the disk segment store, with the
//! recovery index kept in step with the disk manifest.

use crate::compressor::{FrameCompressor, DEFAULT_QUALITY};
use crate::disk_store::{DiskSegmentStore, DiskStoreOptions, ManifestObserver, ReadRange};
use crate::error::{BufferError, RecoveryStaleError, SequenceGapError};
use crate::frame::{FrameEntry, RawFrame, SegmentId};
use crate::ram_buffer::{RamBudget, RamRingBuffer};
use crate::recovery::{BufferIndex, RecoveryIndex, RecoveryOutcome, WindowBounds};
use crate::scorer::{FocusAlgorithm, FocusScorer, FrameScore};
use crate::segment::SegmentMeta;
use crate::smart_pause::FrameWindowSource;
use crate::stats::BufferMetrics;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything needed to open a buffer.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    pub stream_id: String,
    pub data_dir: PathBuf,
    pub ram_budget: RamBudget,
    pub disk: DiskStoreOptions,
    pub quality: u8,
    pub focus_algorithm: FocusAlgorithm,
    pub score_cache_capacity: usize,
    pub index_max_age: Duration,
}

impl BufferOptions {
    /// Defaults with segments under `data_dir/segments`.
    pub fn new(stream_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            stream_id: stream_id.into(),
            disk: DiskStoreOptions::new(data_dir.join("segments")),
            data_dir,
            ram_budget: RamBudget::Bytes(512 * 1024 * 1024),
            quality: DEFAULT_QUALITY,
            focus_algorithm: FocusAlgorithm::Laplacian,
            score_cache_capacity: 1024,
            index_max_age: Duration::from_secs(3600),
        }
    }
}

/// Keeps the persisted index in step with disk manifest commits.
struct IndexObserver {
    stream_id: String,
    recovery: Arc<RecoveryIndex>,
    ram: Weak<RamRingBuffer>,
}

impl ManifestObserver for IndexObserver {
    fn manifest_committed(&self, segments: &[SegmentMeta], next_segment_id: SegmentId) {
        let ram_bounds = self.ram.upgrade().and_then(|ram| ram_bounds(&ram));
        let result = self.recovery.persist_with(|| {
            build_index(&self.stream_id, segments.to_vec(), next_segment_id, ram_bounds)
        });
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist recovery index after manifest change");
        }
    }
}

fn ram_bounds(ram: &RamRingBuffer) -> Option<WindowBounds> {
    let oldest = ram.oldest()?;
    let newest = ram.newest()?;
    Some(WindowBounds {
        earliest_sequence: oldest.sequence,
        earliest_timestamp: oldest.captured_at,
        latest_sequence: newest.sequence,
        latest_timestamp: newest.captured_at,
    })
}

fn merge_bounds(disk: Option<WindowBounds>, ram: Option<WindowBounds>) -> Option<WindowBounds> {
    match (disk, ram) {
        (Some(disk), Some(ram)) => Some(disk.union(ram)),
        (disk, ram) => disk.or(ram),
    }
}

fn build_index(
    stream_id: &str,
    segments: Vec<SegmentMeta>,
    next_segment_id: SegmentId,
    ram: Option<WindowBounds>,
) -> BufferIndex {
    let window = merge_bounds(WindowBounds::from_manifest(&segments), ram);
    BufferIndex::new(stream_id, Utc::now(), window, segments, next_segment_id)
}

/// The RAM and disk tiers behind one push path.
pub struct FrameBuffer {
    stream_id: String,
    ram: Arc<RamRingBuffer>,
    disk: Arc<DiskSegmentStore>,
    compressor: FrameCompressor,
    scorer: Arc<FocusScorer>,
    recovery: Arc<RecoveryIndex>,
    frames_ingested: AtomicU64,
    frames_rejected: AtomicU64,
}

impl FrameBuffer {
    /// Open the buffer, reattaching to a valid recovery index when one exists.
    pub fn open(options: BufferOptions) -> Result<(Arc<Self>, RecoveryOutcome), BufferError> {
        std::fs::create_dir_all(&options.data_dir)?;

        let recovery = Arc::new(RecoveryIndex::new(
            &options.data_dir,
            options.disk.dir.clone(),
            options.index_max_age,
        ));
        let mut outcome = recovery.resolve(&options.stream_id, Utc::now());

        let reattached = match &outcome {
            RecoveryOutcome::Reattached(index) => Some((
                DiskSegmentStore::reattach(
                    options.disk.clone(),
                    index.segments.clone(),
                    index.next_segment_id,
                ),
                index.window.map(|w| w.latest_sequence),
            )),
            RecoveryOutcome::Fresh { .. } => None,
        };

        let mut floor = None;
        let disk = match reattached {
            Some((Ok(disk), recorded)) => {
                let on_disk =
                    WindowBounds::from_manifest(&disk.manifest()).map(|w| w.latest_sequence);
                floor = recorded.max(on_disk);
                disk
            }
            Some((Err(e), _)) => {
                warn!(error = %e, "Reattach failed, starting fresh buffer");
                recovery.discard();
                outcome = RecoveryOutcome::Fresh {
                    reason: RecoveryStaleError::Unreadable(e.to_string()),
                };
                DiskSegmentStore::open_fresh(options.disk.clone())?
            }
            None => DiskSegmentStore::open_fresh(options.disk.clone())?,
        };
        let disk = Arc::new(disk);

        let mut ram = RamRingBuffer::new(options.ram_budget).with_sink(disk.clone());
        if let Some(floor) = floor {
            ram = ram.with_sequence_floor(floor);
        }
        let ram = Arc::new(ram);

        disk.set_observer(Arc::new(IndexObserver {
            stream_id: options.stream_id.clone(),
            recovery: recovery.clone(),
            ram: Arc::downgrade(&ram),
        }));

        let buffer = Arc::new(Self {
            stream_id: options.stream_id,
            ram,
            disk,
            compressor: FrameCompressor::new(options.quality),
            scorer: Arc::new(FocusScorer::new(
                options.focus_algorithm,
                options.score_cache_capacity,
            )),
            recovery,
            frames_ingested: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
        });

        info!(
            stream_id = %buffer.stream_id,
            reattached = outcome.is_reattached(),
            next_sequence = buffer.next_sequence(),
            segments = buffer.disk.manifest().len(),
            "Frame buffer opened"
        );
        Ok((buffer, outcome))
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Validate, compress and push a decoded frame. Never blocks on disk I/O.
    pub fn ingest(&self, frame: RawFrame) -> Result<u64, BufferError> {
        if let Some(last) = self.ram.last_sequence() {
            if frame.sequence <= last {
                self.reject();
                warn!(last, received = frame.sequence, "Dropping out-of-order frame");
                return Err(SequenceGapError {
                    last,
                    received: frame.sequence,
                }
                .into());
            }
        }

        if let Err(e) = frame.validate() {
            self.reject();
            warn!(sequence = frame.sequence, error = %e, "Dropping invalid frame");
            return Err(e);
        }

        let entry = self.compressor.compress(&frame).map_err(|e| {
            self.reject();
            warn!(sequence = frame.sequence, error = %e, "Failed to compress frame");
            BufferError::from(e)
        })?;
        self.push_entry(entry)
    }

    /// Push an already compressed frame.
    pub fn push_entry(&self, entry: FrameEntry) -> Result<u64, BufferError> {
        let sequence = entry.sequence;
        match self.ram.push(entry) {
            Ok(evicted) => {
                self.frames_ingested.fetch_add(1, Ordering::Relaxed);
                if evicted > 0 {
                    debug!(sequence, evicted, "Evicted frames to disk");
                }
                Ok(sequence)
            }
            Err(gap) => {
                self.reject();
                Err(gap.into())
            }
        }
    }

    fn reject(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("replay.frames.rejected").increment(1);
    }

    /// Sequence number a producer should use next.
    pub fn next_sequence(&self) -> u64 {
        self.ram.last_sequence().map_or(1, |last| last + 1)
    }

    pub fn ram(&self) -> &Arc<RamRingBuffer> {
        &self.ram
    }

    pub fn disk(&self) -> &Arc<DiskSegmentStore> {
        &self.disk
    }

    pub fn scorer(&self) -> &Arc<FocusScorer> {
        &self.scorer
    }

    pub fn recovery(&self) -> &Arc<RecoveryIndex> {
        &self.recovery
    }

    /// Earliest and latest frame held by either tier.
    pub fn window_bounds(&self) -> Option<WindowBounds> {
        merge_bounds(
            WindowBounds::from_manifest(&self.disk.manifest()),
            ram_bounds(&self.ram),
        )
    }

    /// Current recovery snapshot, not written.
    pub fn index_snapshot(&self) -> BufferIndex {
        build_index(
            &self.stream_id,
            self.disk.manifest(),
            self.disk.next_segment_id(),
            ram_bounds(&self.ram),
        )
    }

    /// Write the recovery index.
    pub fn persist_index(&self) -> Result<BufferIndex, BufferError> {
        let index = self.recovery.persist_with(|| self.index_snapshot())?;
        Ok(index)
    }

    /// Score the newest frame if it has no score yet and drop scores for
    /// frames that have left RAM.
    pub fn score_latest(&self) -> Option<FrameScore> {
        if let Some(oldest) = self.ram.oldest() {
            self.scorer.age_out(oldest.sequence);
        }

        let newest = self.ram.newest()?;
        match self.scorer.score_entry(&newest) {
            Ok(score) => {
                metrics::gauge!("replay.focus.score").set(score.value);
                Some(score)
            }
            Err(e) => {
                debug!(sequence = newest.sequence, error = %e, "Background scoring failed");
                None
            }
        }
    }

    pub fn metrics(&self) -> BufferMetrics {
        let disk_stats = self.disk.stats();
        let manifest = self.disk.manifest();
        let window = self.window_bounds();
        let buffer_duration_secs = window
            .map(|w| {
                w.latest_timestamp
                    .signed_duration_since(w.earliest_timestamp)
                    .num_milliseconds() as f64
                    / 1000.0
            })
            .unwrap_or(0.0);

        BufferMetrics {
            collected_at: Utc::now(),
            stream_id: self.stream_id.clone(),
            buffer_duration_secs,
            window,
            ram_frames: self.ram.len(),
            ram_bytes: self.ram.bytes_used(),
            ram_duration_secs: self.ram.duration().as_secs_f64(),
            disk_segments: manifest.len(),
            disk_bytes: manifest.iter().map(|m| m.byte_size).sum(),
            disk_writes_dropped: disk_stats.writes_dropped,
            disk_degraded: disk_stats.degraded,
            focus_score: self.scorer.latest().map(|s| s.value),
            scoring_throughput: self.scorer.throughput(),
            frames_ingested: self.frames_ingested.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
        }
    }

    /// Spill RAM to disk, seal the open segment and write the index.
    ///
    /// Blocking; call from a blocking context on shutdown.
    pub fn shutdown(&self) -> Result<BufferIndex, BufferError> {
        let spilled = self.ram.drain();
        let spilled_count = spilled.len();
        let chunk = self.disk.options().queue_capacity.max(1);
        for batch in spilled.chunks(chunk) {
            for entry in batch {
                self.disk.enqueue(entry.clone());
            }
            self.disk.flush();
        }

        self.disk.shutdown();
        let index = self.persist_index()?;

        info!(
            stream_id = %self.stream_id,
            spilled = spilled_count,
            segments = index.segments.len(),
            "Frame buffer shut down"
        );
        Ok(index)
    }
}

impl FrameWindowSource for FrameBuffer {
    fn ram_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Arc<FrameEntry>> {
        self.ram.query(from, to)
    }

    fn disk_covers(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.disk.covers(from, to)
    }

    fn disk_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<FrameEntry> {
        let read = self.disk.read(ReadRange::Time { from, to });
        if !read.is_complete() {
            warn!(
                unreadable = read.unreadable.len(),
                partial = read.partial.len(),
                recovered = read.frames.len(),
                "Disk backfill returned partial window"
            );
        }
        read.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameTier, PixelFormat};
    use crate::stats::{StatsListener, StatsReporter};
    use parking_lot::Mutex;

    fn options(dir: &std::path::Path, frames: usize) -> BufferOptions {
        let mut options = BufferOptions::new("camera-1", dir);
        options.ram_budget = RamBudget::Frames(frames);
        options.disk.segment_duration = Duration::from_secs(1);
        options
    }

    fn raw(sequence: u64, base: DateTime<Utc>) -> RawFrame {
        let pixels: Vec<u8> = (0..16 * 16).map(|i| ((i * 13 + sequence as usize) % 256) as u8).collect();
        RawFrame::new(
            sequence,
            base + chrono::Duration::milliseconds(sequence as i64 * 100),
            16,
            16,
            PixelFormat::Gray8,
            pixels,
        )
    }

    #[test]
    fn test_capacity_five_keeps_newest_and_spills_rest() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let (buffer, outcome) = FrameBuffer::open(options(tmp.path(), 5)).unwrap();
        assert!(!outcome.is_reattached());

        let base = Utc::now();
        for seq in 1..=10 {
            buffer.ingest(raw(seq, base)).unwrap();
        }
        buffer.disk().flush();

        let ram: Vec<u64> = buffer.ram().snapshot().iter().map(|f| f.sequence).collect();
        assert_eq!(ram, vec![6, 7, 8, 9, 10]);

        let disk = buffer.disk().read(ReadRange::Sequence { first: 1, last: 10 });
        let on_disk: Vec<u64> = disk.frames.iter().map(|f| f.sequence).collect();
        assert_eq!(on_disk, vec![1, 2, 3, 4, 5]);
        assert!(disk.frames.iter().all(|f| matches!(f.tier, FrameTier::Disk(_))));
    }

    #[test]
    fn test_evicted_frames_visible_without_flush() {
        for _ in 0..20 {
            let tmp = tempfile::tempdir().expect("failed to create tempdir");
            let (buffer, _) = FrameBuffer::open(options(tmp.path(), 5)).unwrap();
            let base = Utc::now();
            for seq in 1..=10 {
                buffer.ingest(raw(seq, base)).unwrap();
            }

            let from = base;
            let to = base + chrono::Duration::seconds(2);
            let mut seen: Vec<u64> = buffer.ram_window(from, to).iter().map(|f| f.sequence).collect();
            seen.extend(buffer.disk_window(from, to).iter().map(|f| f.sequence));
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen, (1..=10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_disk_degraded_clears_after_directory_restored() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let (buffer, _) = FrameBuffer::open(options(tmp.path(), 2)).unwrap();
        let segments = buffer.disk().options().dir.clone();
        let base = Utc::now();

        std::fs::remove_dir_all(&segments).unwrap();
        for seq in 1..=6 {
            buffer.ingest(raw(seq, base)).unwrap();
        }
        buffer.disk().flush();
        assert!(buffer.metrics().disk_degraded);
        assert!(buffer.disk().stats().write_errors > 0);

        std::fs::create_dir_all(&segments).unwrap();
        for seq in 7..=12 {
            buffer.ingest(raw(seq, base)).unwrap();
        }
        buffer.disk().flush();
        assert!(!buffer.disk().stats().degraded);
        assert!(!buffer.metrics().disk_degraded);
        assert!(buffer.disk().stats().frames_written > 0);
    }

    #[test]
    fn test_window_survives_backward_capture_time() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let (buffer, _) = FrameBuffer::open(options(tmp.path(), 20)).unwrap();
        let base = Utc::now();
        for seq in 1..=10 {
            let mut frame = raw(seq, base);
            if seq == 8 {
                frame.captured_at = base - chrono::Duration::seconds(5);
            }
            buffer.ingest(frame).unwrap();
        }

        let window: Vec<u64> = buffer
            .ram_window(base, base + chrono::Duration::seconds(2))
            .iter()
            .map(|f| f.sequence)
            .collect();
        assert_eq!(window, vec![1, 2, 3, 4, 5, 6, 7, 9, 10]);
        assert_eq!(buffer.ram().stats().timestamp_regressions, 1);
    }

    #[test]
    fn test_ram_holds_exactly_capacity_most_recent() {
        for capacity in [1usize, 3, 8] {
            for pushes in [capacity + 1, capacity * 3] {
                let tmp = tempfile::tempdir().expect("failed to create tempdir");
                let (buffer, _) = FrameBuffer::open(options(tmp.path(), capacity)).unwrap();
                let base = Utc::now();
                for seq in 1..=pushes as u64 {
                    buffer.ingest(raw(seq, base)).unwrap();
                }
                buffer.disk().flush();

                let ram: Vec<u64> = buffer.ram().snapshot().iter().map(|f| f.sequence).collect();
                let expected: Vec<u64> = ((pushes - capacity + 1) as u64..=pushes as u64).collect();
                assert_eq!(ram, expected);

                let disk = buffer.disk().read(ReadRange::Sequence {
                    first: 1,
                    last: pushes as u64,
                });
                assert_eq!(disk.frames.len(), pushes - capacity);
            }
        }
    }

    #[test]
    fn test_ingest_rejects_bad_frames_and_continues() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let (buffer, _) = FrameBuffer::open(options(tmp.path(), 10)).unwrap();
        let base = Utc::now();

        buffer.ingest(raw(5, base)).unwrap();
        assert!(matches!(
            buffer.ingest(raw(3, base)),
            Err(BufferError::SequenceGap(SequenceGapError { last: 5, received: 3 }))
        ));

        let mut broken = raw(6, base);
        broken.data = bytes::Bytes::from_static(&[1, 2, 3]);
        assert!(matches!(buffer.ingest(broken), Err(BufferError::InvalidFrame(_))));

        buffer.ingest(raw(7, base)).unwrap();
        assert_eq!(buffer.next_sequence(), 8);
        assert_eq!(buffer.metrics().frames_rejected, 2);
        assert_eq!(buffer.metrics().frames_ingested, 2);
    }

    #[test]
    fn test_shutdown_then_reattach_restores_window() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let base = Utc::now() - chrono::Duration::seconds(30);
        let bounds_before = {
            let (buffer, _) = FrameBuffer::open(options(tmp.path(), 8)).unwrap();
            for seq in 1..=40 {
                buffer.ingest(raw(seq, base)).unwrap();
            }
            buffer.disk().flush();
            let bounds = buffer.window_bounds().unwrap();
            let index = buffer.shutdown().unwrap();
            assert!(index.segments.iter().all(|m| m.sealed));
            bounds
        };

        let (buffer, outcome) = FrameBuffer::open(options(tmp.path(), 8)).unwrap();
        let RecoveryOutcome::Reattached(index) = outcome else {
            panic!("expected reattach");
        };
        let restored = WindowBounds::from_manifest(&buffer.disk().manifest()).unwrap();
        assert_eq!(restored, index.disk_window().unwrap());
        assert_eq!(restored, bounds_before);

        assert_eq!(buffer.next_sequence(), 41);
        assert!(buffer.ingest(raw(40, base)).is_err());
        buffer.ingest(raw(41, base)).unwrap();
    }

    #[test]
    fn test_stream_change_starts_fresh() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        {
            let (buffer, _) = FrameBuffer::open(options(tmp.path(), 4)).unwrap();
            let base = Utc::now();
            for seq in 1..=12 {
                buffer.ingest(raw(seq, base)).unwrap();
            }
            buffer.shutdown().unwrap();
        }

        let mut other = options(tmp.path(), 4);
        other.stream_id = "camera-2".to_string();
        let (buffer, outcome) = FrameBuffer::open(other).unwrap();
        assert!(!outcome.is_reattached());
        assert!(buffer.disk().manifest().is_empty());
        assert_eq!(buffer.next_sequence(), 1);
    }

    #[test]
    fn test_index_follows_manifest_commits() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let (buffer, _) = FrameBuffer::open(options(tmp.path(), 2)).unwrap();
        let base = Utc::now();
        // 100ms apart with one-second segments: evicting frame 11 seals the first.
        for seq in 1..=14 {
            buffer.ingest(raw(seq, base)).unwrap();
        }
        buffer.disk().flush();

        let persisted = buffer.recovery().read().unwrap();
        assert!(persisted.segments.iter().any(|m| m.sealed && m.start_sequence == 1));
    }

    #[tokio::test]
    async fn test_window_source_backfills_from_disk() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let (buffer, _) = FrameBuffer::open(options(tmp.path(), 5)).unwrap();
        let base = Utc::now() - chrono::Duration::seconds(2);
        for seq in 1..=15 {
            buffer.ingest(raw(seq, base)).unwrap();
        }
        buffer.disk().flush();

        let from = base;
        let to = base + chrono::Duration::seconds(2);
        assert_eq!(buffer.ram_window(from, to).len(), 5);
        assert!(buffer.disk_covers(from, to));
        let disk: Vec<u64> = buffer.disk_window(from, to).iter().map(|f| f.sequence).collect();
        assert_eq!(disk, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_score_latest_and_stats_refresh() {
        #[derive(Default)]
        struct Capture(Mutex<Vec<BufferMetrics>>);
        impl StatsListener for Capture {
            fn on_metrics(&self, metrics: &BufferMetrics) {
                self.0.lock().push(metrics.clone());
            }
        }

        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let (buffer, _) = FrameBuffer::open(options(tmp.path(), 4)).unwrap();
        let base = Utc::now();
        for seq in 1..=6 {
            buffer.ingest(raw(seq, base)).unwrap();
        }
        let score = buffer.score_latest().unwrap();
        assert_eq!(score.sequence, 6);

        let reporter = StatsReporter::new(buffer.clone());
        let capture = Arc::new(Capture::default());
        reporter.add_listener(capture.clone());
        let metrics = reporter.refresh();

        assert_eq!(metrics.ram_frames, 4);
        assert_eq!(metrics.focus_score, Some(score.value));
        assert_eq!(metrics.frames_ingested, 6);
        assert!(metrics.buffer_duration_secs > 0.0);
        assert_eq!(capture.0.lock().len(), 1);
        assert_eq!(reporter.last(), Some(metrics));
    }
}
