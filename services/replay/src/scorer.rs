//! Focus scoring.
//!
//! Sharpness is measured on the luma plane with a [`SharpnessMetric`]. The
//! scorer keeps a bounded score history keyed by sequence number and a rolling
//! throughput figure (scores per second).

use crate::compressor::FrameCompressor;
use crate::error::CodecError;
use crate::frame::{FrameEntry, RawFrame};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{trace, warn};

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(5);

/// Sharpness algorithms selectable by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusAlgorithm {
    Laplacian,
    Tenengrad,
    Sobel,
}

impl Default for FocusAlgorithm {
    fn default() -> Self {
        FocusAlgorithm::Laplacian
    }
}

impl std::fmt::Display for FocusAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FocusAlgorithm::Laplacian => "laplacian",
            FocusAlgorithm::Tenengrad => "tenengrad",
            FocusAlgorithm::Sobel => "sobel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("Failed to decode frame for scoring: {0}")]
    Decode(#[from] CodecError),

    #[error("Frame too small to score")]
    TooSmall,

    #[error("Metric produced a non-finite score")]
    NonFinite,
}

/// Row-major 8-bit luma.
#[derive(Debug, Clone)]
pub struct LumaPlane {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl LumaPlane {
    pub fn from_frame(frame: &RawFrame) -> Self {
        Self {
            width: frame.width as usize,
            height: frame.height as usize,
            pixels: frame.to_luma(),
        }
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> i32 {
        self.pixels[y * self.width + x] as i32
    }
}

/// A sharpness measure over a luma plane. Higher is sharper.
pub trait SharpnessMetric: Send + Sync {
    fn algorithm(&self) -> FocusAlgorithm;

    /// `None` when the plane is too small for the kernel.
    fn score(&self, plane: &LumaPlane) -> Option<f64>;
}

/// Variance of the 4-neighbour Laplacian.
#[derive(Debug, Default, Clone, Copy)]
pub struct LaplacianVariance;

impl SharpnessMetric for LaplacianVariance {
    fn algorithm(&self) -> FocusAlgorithm {
        FocusAlgorithm::Laplacian
    }

    fn score(&self, plane: &LumaPlane) -> Option<f64> {
        if plane.width < 3 || plane.height < 3 {
            return None;
        }

        let mut sum = 0.0_f64;
        let mut sum_sq = 0.0_f64;
        let mut count = 0u64;
        for y in 1..plane.height - 1 {
            for x in 1..plane.width - 1 {
                let lap = 4 * plane.at(x, y)
                    - plane.at(x - 1, y)
                    - plane.at(x + 1, y)
                    - plane.at(x, y - 1)
                    - plane.at(x, y + 1);
                let lap = lap as f64;
                sum += lap;
                sum_sq += lap * lap;
                count += 1;
            }
        }

        let n = count as f64;
        let mean = sum / n;
        Some((sum_sq / n - mean * mean).max(0.0))
    }
}

/// Mean squared Sobel gradient magnitude.
#[derive(Debug, Default, Clone, Copy)]
pub struct TenengradEnergy;

impl SharpnessMetric for TenengradEnergy {
    fn algorithm(&self) -> FocusAlgorithm {
        FocusAlgorithm::Tenengrad
    }

    fn score(&self, plane: &LumaPlane) -> Option<f64> {
        if plane.width < 3 || plane.height < 3 {
            return None;
        }

        let mut energy = 0.0_f64;
        let mut count = 0u64;
        for y in 1..plane.height - 1 {
            for x in 1..plane.width - 1 {
                let gx = (plane.at(x + 1, y - 1) + 2 * plane.at(x + 1, y) + plane.at(x + 1, y + 1))
                    - (plane.at(x - 1, y - 1) + 2 * plane.at(x - 1, y) + plane.at(x - 1, y + 1));
                let gy = (plane.at(x - 1, y + 1) + 2 * plane.at(x, y + 1) + plane.at(x + 1, y + 1))
                    - (plane.at(x - 1, y - 1) + 2 * plane.at(x, y - 1) + plane.at(x + 1, y - 1));
                energy += (gx * gx + gy * gy) as f64;
                count += 1;
            }
        }

        Some(energy / count as f64)
    }
}

/// Metric implementing `algorithm`, or the Laplacian default when the
/// requested one is not available.
pub fn metric_for(algorithm: FocusAlgorithm) -> Arc<dyn SharpnessMetric> {
    match algorithm {
        FocusAlgorithm::Laplacian => Arc::new(LaplacianVariance),
        FocusAlgorithm::Tenengrad => Arc::new(TenengradEnergy),
        unavailable => {
            warn!(
                requested = %unavailable,
                fallback = %FocusAlgorithm::Laplacian,
                "Focus algorithm not available, using default"
            );
            Arc::new(LaplacianVariance)
        }
    }
}

/// One computed score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameScore {
    pub sequence: u64,
    pub value: f64,
    pub algorithm: FocusAlgorithm,
    pub computed_at: DateTime<Utc>,
}

struct ScoreCache {
    scores: BTreeMap<u64, FrameScore>,
    capacity: usize,
    latest: Option<FrameScore>,
}

/// Scores frames and remembers the results.
pub struct FocusScorer {
    metric: Arc<dyn SharpnessMetric>,
    requested: FocusAlgorithm,
    compressor: FrameCompressor,
    cache: RwLock<ScoreCache>,
    completions: Mutex<VecDeque<Instant>>,
}

impl FocusScorer {
    pub fn new(algorithm: FocusAlgorithm, cache_capacity: usize) -> Self {
        let mut scorer = Self::with_metric(metric_for(algorithm), cache_capacity);
        scorer.requested = algorithm;
        scorer
    }

    pub fn with_metric(metric: Arc<dyn SharpnessMetric>, cache_capacity: usize) -> Self {
        Self {
            requested: metric.algorithm(),
            metric,
            compressor: FrameCompressor::default(),
            cache: RwLock::new(ScoreCache {
                scores: BTreeMap::new(),
                capacity: cache_capacity.max(1),
                latest: None,
            }),
            completions: Mutex::new(VecDeque::new()),
        }
    }

    /// Algorithm actually in use.
    pub fn algorithm(&self) -> FocusAlgorithm {
        self.metric.algorithm()
    }

    /// Algorithm asked for by configuration.
    pub fn requested_algorithm(&self) -> FocusAlgorithm {
        self.requested
    }

    /// Score a decoded frame without touching the cache.
    pub fn score(&self, frame: &RawFrame) -> Result<f64, ScoringError> {
        let plane = LumaPlane::from_frame(frame);
        let value = self.metric.score(&plane).ok_or(ScoringError::TooSmall)?;
        if !value.is_finite() {
            return Err(ScoringError::NonFinite);
        }
        Ok(value)
    }

    /// Cached score for `entry`, computing and caching it when absent.
    pub fn score_entry(&self, entry: &FrameEntry) -> Result<FrameScore, ScoringError> {
        if let Some(cached) = self.cached(entry.sequence) {
            return Ok(cached);
        }

        let frame = self.compressor.decompress(entry)?;
        let value = self.score(&frame)?;
        let score = FrameScore {
            sequence: entry.sequence,
            value,
            algorithm: self.algorithm(),
            computed_at: Utc::now(),
        };
        self.record(score);
        self.mark_completion();

        trace!(sequence = entry.sequence, score = value, "Scored frame");
        Ok(score)
    }

    /// Insert a score, evicting the lowest sequences beyond capacity.
    pub fn record(&self, score: FrameScore) {
        let mut cache = self.cache.write();
        cache.scores.insert(score.sequence, score);
        while cache.scores.len() > cache.capacity {
            cache.scores.pop_first();
        }
        if cache
            .latest
            .map_or(true, |latest| score.sequence >= latest.sequence)
        {
            cache.latest = Some(score);
        }
    }

    pub fn cached(&self, sequence: u64) -> Option<FrameScore> {
        self.cache.read().scores.get(&sequence).copied()
    }

    /// Drop scores for frames older than `min_sequence`.
    pub fn age_out(&self, min_sequence: u64) -> usize {
        let mut cache = self.cache.write();
        let before = cache.scores.len();
        cache.scores = cache.scores.split_off(&min_sequence);
        before - cache.scores.len()
    }

    /// Score of the most recent frame scored.
    pub fn latest(&self) -> Option<FrameScore> {
        self.cache.read().latest
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().scores.len()
    }

    /// Scores computed per second over the last few seconds.
    pub fn throughput(&self) -> f64 {
        let mut completions = self.completions.lock();
        prune(&mut completions, Instant::now());
        completions.len() as f64 / THROUGHPUT_WINDOW.as_secs_f64()
    }

    fn mark_completion(&self) {
        let now = Instant::now();
        let mut completions = self.completions.lock();
        completions.push_back(now);
        prune(&mut completions, now);
    }
}

fn prune(completions: &mut VecDeque<Instant>, now: Instant) {
    while completions
        .front()
        .map_or(false, |t| now.duration_since(*t) > THROUGHPUT_WINDOW)
    {
        completions.pop_front();
    }
}
