//! Append-only, time-sharded overflow store for frames evicted from RAM.
//!
//! Eviction only enqueues; a dedicated writer thread drains the queue into the
//! open segment, rotates it by duration or size, and deletes sealed segments
//! that fall out of the retention window. Reads see queued frames too, so a
//! frame is readable from the moment RAM lets go of it.
//!
//! When the writer falls behind, the oldest queued write is dropped. Losing
//! old frames under disk pressure is accepted; stalling the producer is not.

use crate::compressor::PayloadHeader;
use crate::frame::{to_chrono, FrameEntry, FrameTier, SegmentId};
use crate::ram_buffer::EvictionSink;
use crate::segment::{self, SegmentMeta, SegmentWriter};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tuning for the disk tier.
#[derive(Debug, Clone)]
pub struct DiskStoreOptions {
    /// Directory holding segment files
    pub dir: PathBuf,
    /// Capture-time span after which the open segment rotates
    pub segment_duration: Duration,
    /// Size after which the open segment rotates
    pub segment_max_bytes: u64,
    /// Total retention window; older sealed segments are deleted
    pub retention: Duration,
    /// Maximum queued writes before the oldest is dropped
    pub queue_capacity: usize,
}

impl DiskStoreOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_duration: Duration::from_secs(60),
            segment_max_bytes: 256 * 1024 * 1024,
            retention: Duration::from_secs(40 * 60),
            queue_capacity: 1024,
        }
    }
}

/// Told about every manifest change before any file it stops referencing is
/// deleted.
pub trait ManifestObserver: Send + Sync {
    fn manifest_committed(&self, segments: &[SegmentMeta], next_segment_id: SegmentId);
}

/// Which frames a read should return.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadRange {
    Sequence { first: u64, last: u64 },
    Time { from: DateTime<Utc>, to: DateTime<Utc> },
}

impl ReadRange {
    fn overlaps(&self, meta: &SegmentMeta) -> bool {
        match *self {
            ReadRange::Sequence { first, last } => meta.overlaps_sequence(first, last),
            ReadRange::Time { from, to } => meta.overlaps_time(from, to),
        }
    }

    fn admits(&self, sequence: u64, captured_at: DateTime<Utc>) -> bool {
        match *self {
            ReadRange::Sequence { first, last } => (first..=last).contains(&sequence),
            ReadRange::Time { from, to } => captured_at >= from && captured_at <= to,
        }
    }

    fn contains(&self, entry: &FrameEntry) -> bool {
        self.admits(entry.sequence, entry.captured_at)
    }

    fn contains_header(&self, header: &PayloadHeader) -> bool {
        self.admits(header.sequence, header.captured_at)
    }
}

/// Result of a range read. Damaged segments shrink the result, never fail it.
#[derive(Debug, Default)]
pub struct DiskRead {
    /// Recovered frames in increasing sequence order
    pub frames: Vec<FrameEntry>,
    /// Segments that could not be opened at all
    pub unreadable: Vec<SegmentId>,
    /// Sealed segments that ended in a damaged record
    pub partial: Vec<SegmentId>,
}

impl DiskRead {
    pub fn is_complete(&self) -> bool {
        self.unreadable.is_empty() && self.partial.is_empty()
    }
}

/// Counters for the disk tier.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DiskStats {
    pub frames_queued: u64,
    pub frames_written: u64,
    pub writes_dropped: u64,
    pub write_errors: u64,
    pub expired_skipped: u64,
    pub segments_sealed: u64,
    pub segments_deleted: u64,
    pub queue_depth: usize,
    pub degraded: bool,
}

#[derive(Default)]
struct Counters {
    frames_queued: AtomicU64,
    frames_written: AtomicU64,
    writes_dropped: AtomicU64,
    write_errors: AtomicU64,
    expired_skipped: AtomicU64,
    segments_sealed: AtomicU64,
    segments_deleted: AtomicU64,
}

#[derive(Default)]
struct WriteQueue {
    pending: VecDeque<FrameEntry>,
    /// Batch the writer is appending; cleared once flushed to its segment
    writing: Vec<FrameEntry>,
    in_flight: bool,
    shutdown: bool,
}

impl WriteQueue {
    fn queued(&self) -> impl Iterator<Item = &FrameEntry> {
        self.writing.iter().chain(self.pending.iter())
    }

    /// Queue `entry`, returning the write dropped to make room, if any.
    fn push(&mut self, entry: FrameEntry, capacity: usize) -> Option<FrameEntry> {
        let dropped = if self.pending.len() >= capacity.max(1) {
            self.pending.pop_front()
        } else {
            None
        };
        self.pending.push_back(entry);
        dropped
    }
}

struct Manifest {
    sealed: Vec<SegmentMeta>,
    open: Option<SegmentMeta>,
    next_id: SegmentId,
}

impl Manifest {
    fn all(&self) -> Vec<SegmentMeta> {
        self.sealed.iter().cloned().chain(self.open.clone()).collect()
    }
}

struct WriterState {
    writer: Option<SegmentWriter>,
    newest: Option<DateTime<Utc>>,
}

struct Shared {
    options: DiskStoreOptions,
    queue: Mutex<WriteQueue>,
    work: Condvar,
    idle: Condvar,
    manifest: RwLock<Manifest>,
    observer: RwLock<Option<Arc<dyn ManifestObserver>>>,
    counters: Counters,
    degraded: AtomicBool,
}

/// Disk tier of the frame buffer.
pub struct DiskSegmentStore {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiskSegmentStore {
    /// Start an empty store, removing any segment files left in the directory.
    pub fn open_fresh(options: DiskStoreOptions) -> io::Result<Self> {
        std::fs::create_dir_all(&options.dir)?;

        let mut purged = 0usize;
        for entry in std::fs::read_dir(&options.dir)?.flatten() {
            let name = entry.file_name();
            if name.to_str().and_then(segment::parse_file_name).is_some() {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => purged += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to purge segment"),
                }
            }
        }
        if purged > 0 {
            info!(purged, dir = %options.dir.display(), "Purged stale segments");
        }

        Self::start(options, Vec::new(), 1)
    }

    /// Reattach to segments listed in a recovered manifest.
    ///
    /// Unsealed segments are repaired from their surviving records. Segment
    /// files newer than the manifest (opened after the last index write) are
    /// adopted; older unreferenced files are removed.
    pub fn reattach(
        options: DiskStoreOptions,
        manifest: Vec<SegmentMeta>,
        next_id: SegmentId,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&options.dir)?;

        let mut sealed = Vec::with_capacity(manifest.len());
        for meta in manifest {
            if meta.sealed {
                sealed.push(meta);
                continue;
            }
            match segment::repair(&options.dir, meta.id) {
                Ok(Some(repaired)) => sealed.push(repaired),
                Ok(None) => remove_segment_file(&options.dir, &meta.location),
                Err(e) => {
                    warn!(segment_id = meta.id, error = %e, "Dropping unrepairable segment");
                    remove_segment_file(&options.dir, &meta.location);
                }
            }
        }

        let known_max = sealed.iter().map(|m| m.id).max().unwrap_or(0);
        let last_sequence = sealed.last().map(|m| m.end_sequence);
        let mut orphans: Vec<SegmentId> = std::fs::read_dir(&options.dir)?
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(segment::parse_file_name))
            .filter(|id| !sealed.iter().any(|m| m.id == *id))
            .collect();
        orphans.sort_unstable();

        for id in orphans {
            if id <= known_max {
                remove_segment_file(&options.dir, &segment::file_name(id));
                continue;
            }
            match segment::repair(&options.dir, id) {
                Ok(Some(meta)) if last_sequence.map_or(true, |last| meta.start_sequence > last) => {
                    info!(segment_id = id, frames = meta.frame_count, "Adopted segment missing from index");
                    sealed.push(meta);
                }
                _ => remove_segment_file(&options.dir, &segment::file_name(id)),
            }
        }
        sealed.sort_by_key(|m| m.id);

        let next_id = next_id.max(sealed.iter().map(|m| m.id + 1).max().unwrap_or(1));
        Self::start(options, sealed, next_id)
    }

    fn start(
        options: DiskStoreOptions,
        sealed: Vec<SegmentMeta>,
        next_id: SegmentId,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            options,
            queue: Mutex::new(WriteQueue::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
            manifest: RwLock::new(Manifest {
                sealed,
                open: None,
                next_id,
            }),
            observer: RwLock::new(None),
            counters: Counters::default(),
            degraded: AtomicBool::new(false),
        });

        let worker = std::thread::Builder::new()
            .name("replay-disk-writer".to_string())
            .spawn({
                let shared = shared.clone();
                move || shared.run_writer()
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn options(&self) -> &DiskStoreOptions {
        &self.shared.options
    }

    pub fn set_observer(&self, observer: Arc<dyn ManifestObserver>) {
        *self.shared.observer.write() = Some(observer);
    }

    /// Queue a frame for writing. Never blocks on I/O.
    pub fn enqueue(&self, entry: FrameEntry) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                debug!(sequence = entry.sequence, "Disk store shut down, frame not persisted");
                return;
            }
            queue.push(entry, self.shared.options.queue_capacity)
        };
        self.shared.counters.frames_queued.fetch_add(1, Ordering::Relaxed);
        self.shared.work.notify_one();

        if let Some(dropped) = dropped {
            let total = self.shared.counters.writes_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 100 == 0 {
                warn!(
                    sequence = dropped.sequence,
                    writes_dropped = total,
                    "Disk write queue full, dropping oldest queued frame"
                );
            }
        }
    }

    /// Block until every queued write has been attempted.
    pub fn flush(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.pending.is_empty() || queue.in_flight {
            self.shared.idle.wait(&mut queue);
        }
    }

    /// Frames in `range` recoverable from disk, including queued writes.
    pub fn read(&self, range: ReadRange) -> DiskRead {
        // Queue first: a frame leaves the queue only after its segment is flushed.
        let queued = self.queued_where(|entry| range.contains(entry));

        let segments: Vec<SegmentMeta> = self
            .manifest()
            .into_iter()
            .filter(|meta| range.overlaps(meta))
            .collect();

        let mut result = DiskRead::default();
        for meta in segments {
            let path = self.shared.options.dir.join(&meta.location);
            match segment::read_segment_where(&path, |header| range.contains_header(header)) {
                Ok(contents) => {
                    if !contents.complete && meta.sealed {
                        warn!(segment_id = meta.id, "Segment damaged, returning partial frames");
                        result.partial.push(meta.id);
                    }
                    result.frames.extend(contents.frames);
                }
                // The open segment's header may still sit in the writer's buffer.
                Err(e) if !meta.sealed => {
                    debug!(segment_id = meta.id, error = %e, "Open segment not yet readable");
                }
                Err(e) => {
                    warn!(segment_id = meta.id, error = %e, "Segment unreadable");
                    result.unreadable.push(meta.id);
                }
            }
        }
        result.frames.extend(queued);

        // Stable sort keeps the segment copy of a frame that is also still queued.
        result.frames.sort_by_key(|f| f.sequence);
        result.frames.dedup_by_key(|f| f.sequence);
        result
    }

    /// Whether any queued write or segment holds frames captured in `[from, to]`.
    pub fn covers(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let queued = self
            .shared
            .queue
            .lock()
            .queued()
            .any(|entry| entry.captured_at >= from && entry.captured_at <= to);
        if queued {
            return true;
        }

        let manifest = self.shared.manifest.read();
        manifest
            .sealed
            .iter()
            .chain(manifest.open.iter())
            .any(|meta| meta.overlaps_time(from, to))
    }

    /// Queued frames matching `keep`, tagged with the segment they are headed for.
    fn queued_where(&self, keep: impl Fn(&FrameEntry) -> bool) -> Vec<FrameEntry> {
        let target = {
            let manifest = self.shared.manifest.read();
            manifest.open.as_ref().map_or(manifest.next_id, |meta| meta.id)
        };
        self.shared
            .queue
            .lock()
            .queued()
            .filter(|entry| keep(*entry))
            .map(|entry| entry.clone().into_tier(FrameTier::Disk(target)))
            .collect()
    }

    /// Sealed segments followed by the open one, oldest first.
    pub fn manifest(&self) -> Vec<SegmentMeta> {
        self.shared.manifest.read().all()
    }

    pub fn next_segment_id(&self) -> SegmentId {
        self.shared.manifest.read().next_id
    }

    pub fn usage_bytes(&self) -> u64 {
        let manifest = self.shared.manifest.read();
        manifest
            .sealed
            .iter()
            .chain(manifest.open.iter())
            .map(|meta| meta.byte_size)
            .sum()
    }

    pub fn stats(&self) -> DiskStats {
        let c = &self.shared.counters;
        DiskStats {
            frames_queued: c.frames_queued.load(Ordering::Relaxed),
            frames_written: c.frames_written.load(Ordering::Relaxed),
            writes_dropped: c.writes_dropped.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
            expired_skipped: c.expired_skipped.load(Ordering::Relaxed),
            segments_sealed: c.segments_sealed.load(Ordering::Relaxed),
            segments_deleted: c.segments_deleted.load(Ordering::Relaxed),
            queue_depth: self.shared.queue.lock().pending.len(),
            degraded: self.shared.degraded.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue, seal the open segment and stop the writer thread.
    pub fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.work.notify_all();

        let mut worker = self.worker.lock();
        // Dropped from the writer itself (last handle released by an observer).
        if worker
            .as_ref()
            .map_or(false, |w| w.thread().id() == std::thread::current().id())
        {
            return;
        }
        if let Some(worker) = worker.take() {
            if worker.join().is_err() {
                error!("Disk writer thread panicked");
            }
        }
    }
}

impl EvictionSink for DiskSegmentStore {
    fn on_evict(&self, entry: FrameEntry) {
        self.enqueue(entry);
    }
}

impl Drop for DiskSegmentStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run_writer(&self) {
        let mut state = WriterState {
            writer: None,
            newest: None,
        };

        loop {
            let batch: Vec<FrameEntry> = {
                let mut queue = self.queue.lock();
                while queue.pending.is_empty() && !queue.shutdown {
                    self.work.wait(&mut queue);
                }
                if queue.pending.is_empty() {
                    break;
                }
                queue.in_flight = true;
                let batch: Vec<FrameEntry> = queue.pending.drain(..).collect();
                queue.writing = batch.clone();
                batch
            };

            for entry in batch {
                self.write_one(&mut state, entry);
            }
            self.flush_open(&mut state);
            self.enforce_retention(&state);

            {
                let mut queue = self.queue.lock();
                queue.writing.clear();
                queue.in_flight = false;
            }
            self.idle.notify_all();
        }

        self.rotate(&mut state);
        self.queue.lock().in_flight = false;
        self.idle.notify_all();
        debug!("Disk writer stopped");
    }

    fn write_one(&self, state: &mut WriterState, entry: FrameEntry) {
        let newest = state
            .newest
            .map_or(entry.captured_at, |n| n.max(entry.captured_at));
        state.newest = Some(newest);

        if entry.captured_at < newest - to_chrono(self.options.retention) {
            self.counters.expired_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let needs_rotation = state.writer.as_ref().map_or(false, |writer| {
            let meta = writer.meta();
            meta.frame_count > 0
                && (entry.captured_at.signed_duration_since(meta.start_time)
                    >= to_chrono(self.options.segment_duration)
                    || writer.size_with(&entry) > self.options.segment_max_bytes)
        });
        if needs_rotation {
            self.rotate(state);
        }

        if state.writer.is_none() {
            let id = {
                let mut manifest = self.manifest.write();
                let id = manifest.next_id;
                manifest.next_id += 1;
                id
            };
            match SegmentWriter::create(&self.options.dir, id) {
                Ok(writer) => {
                    self.manifest.write().open = Some(writer.meta().clone());
                    state.writer = Some(writer);
                }
                Err(e) => {
                    self.record_write_error(&e, entry.sequence);
                    return;
                }
            }
        }

        let appended = match state.writer.as_mut() {
            Some(writer) => writer.append(&entry),
            None => return,
        };
        match appended {
            Ok(()) => {
                self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
                self.clear_degraded();
            }
            Err(e) => {
                self.record_write_error(&e, entry.sequence);
                self.rotate(state);
            }
        }
    }

    fn flush_open(&self, state: &mut WriterState) {
        let flushed = match state.writer.as_mut() {
            Some(writer) => writer.flush().map(|()| writer.meta().clone()),
            None => return,
        };
        match flushed {
            Ok(meta) => self.manifest.write().open = Some(meta),
            Err(e) => {
                self.record_write_error(&e, 0);
                self.rotate(state);
            }
        }
    }

    /// Seal the open segment, if any, and commit it to the manifest.
    fn rotate(&self, state: &mut WriterState) {
        let Some(writer) = state.writer.take() else {
            return;
        };

        if writer.meta().frame_count == 0 {
            let location = writer.meta().location.clone();
            drop(writer);
            self.manifest.write().open = None;
            remove_segment_file(&self.options.dir, &location);
            return;
        }

        match writer.seal() {
            Ok(meta) => {
                {
                    let mut manifest = self.manifest.write();
                    manifest.open = None;
                    manifest.sealed.push(meta);
                }
                self.counters.segments_sealed.fetch_add(1, Ordering::Relaxed);
                self.clear_degraded();
                self.notify_observer();
            }
            Err(e) => {
                self.record_write_error(&e, 0);
                self.manifest.write().open = None;
            }
        }
    }

    fn enforce_retention(&self, state: &WriterState) {
        let Some(newest) = state.newest else {
            return;
        };
        let cutoff = newest - to_chrono(self.options.retention);

        let expired: Vec<SegmentMeta> = {
            let mut manifest = self.manifest.write();
            let count = manifest
                .sealed
                .iter()
                .take_while(|meta| meta.end_time < cutoff)
                .count();
            manifest.sealed.drain(..count).collect()
        };
        if expired.is_empty() {
            return;
        }

        // The manifest no longer references these files; publish that first.
        self.notify_observer();

        for meta in expired {
            remove_segment_file(&self.options.dir, &meta.location);
            self.counters.segments_deleted.fetch_add(1, Ordering::Relaxed);
            info!(
                segment_id = meta.id,
                end_sequence = meta.end_sequence,
                "Deleted segment outside retention window"
            );
        }
    }

    fn notify_observer(&self) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            let (segments, next_id) = {
                let manifest = self.manifest.read();
                (manifest.all(), manifest.next_id)
            };
            observer.manifest_committed(&segments, next_id);
        }
    }

    fn record_write_error(&self, err: &io::Error, sequence: u64) {
        self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(error = %err, sequence, "Disk write failed, buffer degraded to RAM-only");
        } else {
            debug!(error = %err, sequence, "Disk write failed");
        }
    }

    fn clear_degraded(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(
                write_errors = self.counters.write_errors.load(Ordering::Relaxed),
                "Disk writes recovered"
            );
        }
    }
}

fn remove_segment_file(dir: &std::path::Path, location: &str) {
    let path = dir.join(location);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete segment");
        }
    }
}
