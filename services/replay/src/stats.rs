//! Polled buffer metrics.

use crate::buffer::FrameBuffer;
use crate::recovery::WindowBounds;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Point-in-time view of the buffer for the stats collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferMetrics {
    pub collected_at: DateTime<Utc>,
    pub stream_id: String,

    /// Span from the earliest to the latest retained frame, both tiers
    pub buffer_duration_secs: f64,
    pub window: Option<WindowBounds>,

    pub ram_frames: usize,
    pub ram_bytes: usize,
    pub ram_duration_secs: f64,

    pub disk_segments: usize,
    pub disk_bytes: u64,
    pub disk_writes_dropped: u64,
    pub disk_degraded: bool,

    /// Latest focus score computed
    pub focus_score: Option<f64>,
    /// Scores per second
    pub scoring_throughput: f64,

    pub frames_ingested: u64,
    pub frames_rejected: u64,
}

impl BufferMetrics {
    /// Publish as `metrics` gauges.
    pub fn publish(&self) {
        metrics::gauge!("replay.ram.bytes").set(self.ram_bytes as f64);
        metrics::gauge!("replay.ram.frames").set(self.ram_frames as f64);
        metrics::gauge!("replay.disk.bytes").set(self.disk_bytes as f64);
        metrics::gauge!("replay.disk.segments").set(self.disk_segments as f64);
        metrics::gauge!("replay.buffer.duration_seconds").set(self.buffer_duration_secs);
        metrics::gauge!("replay.scoring.throughput").set(self.scoring_throughput);
        if let Some(score) = self.focus_score {
            metrics::gauge!("replay.focus.score").set(score);
        }
        metrics::counter!("replay.disk.writes_dropped").absolute(self.disk_writes_dropped);
    }
}

/// Receives every refreshed metrics snapshot.
pub trait StatsListener: Send + Sync {
    fn on_metrics(&self, metrics: &BufferMetrics);
}

/// Collects metrics from the buffer and fans them out.
pub struct StatsReporter {
    buffer: Arc<FrameBuffer>,
    listeners: RwLock<Vec<Arc<dyn StatsListener>>>,
    last: RwLock<Option<BufferMetrics>>,
}

impl StatsReporter {
    pub fn new(buffer: Arc<FrameBuffer>) -> Self {
        Self {
            buffer,
            listeners: RwLock::new(Vec::new()),
            last: RwLock::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StatsListener>) {
        self.listeners.write().push(listener);
    }

    pub fn refresh(&self) -> BufferMetrics {
        let metrics = self.buffer.metrics();
        metrics.publish();

        debug!(
            ram_frames = metrics.ram_frames,
            ram_bytes = metrics.ram_bytes,
            disk_bytes = metrics.disk_bytes,
            buffer_secs = format!("{:.1}", metrics.buffer_duration_secs),
            focus_score = metrics.focus_score,
            throughput = format!("{:.2}", metrics.scoring_throughput),
            "Buffer stats"
        );

        for listener in self.listeners.read().iter() {
            listener.on_metrics(&metrics);
        }
        *self.last.write() = Some(metrics.clone());
        metrics
    }

    pub fn last(&self) -> Option<BufferMetrics> {
        self.last.read().clone()
    }
}
