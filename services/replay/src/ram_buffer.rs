//! Bounded in-memory ring of the most recent compressed frames.
//!
//! Single writer (the ingest path), many readers. Readers copy `Arc` handles
//! out under a short read lock and work on that snapshot, so a Smart Pause or
//! stats poll never holds the writer off for longer than the copy.

use crate::error::SequenceGapError;
use crate::frame::{to_chrono, FrameEntry};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Receives frames pushed out of RAM.
///
/// Called with the ring's write lock held, so a frame is never missing from
/// both tiers at once. Must not block.
pub trait EvictionSink: Send + Sync {
    fn on_evict(&self, entry: FrameEntry);
}

/// Capacity limit of the ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RamBudget {
    /// Total compressed payload bytes
    Bytes(usize),
    /// Number of frames
    Frames(usize),
    /// Span between oldest and newest capture time
    Duration(Duration),
}

/// Counters for the RAM tier.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RamStats {
    pub frames_pushed: u64,
    pub frames_evicted: u64,
    pub sequence_gaps_dropped: u64,
    pub forward_jumps: u64,
    /// Frames captured earlier than the frame before them
    pub timestamp_regressions: u64,
}

struct Ring {
    entries: VecDeque<Arc<FrameEntry>>,
    bytes: usize,
    last_sequence: Option<u64>,
}

impl Ring {
    fn over_budget(&self, budget: RamBudget) -> bool {
        // The newest frame always stays, whatever its size.
        if self.entries.len() <= 1 {
            return false;
        }
        match budget {
            RamBudget::Bytes(max) => self.bytes > max,
            RamBudget::Frames(max) => self.entries.len() > max.max(1),
            RamBudget::Duration(max) => match (self.entries.front(), self.entries.back()) {
                (Some(oldest), Some(newest)) => {
                    newest.captured_at.signed_duration_since(oldest.captured_at) > to_chrono(max)
                }
                _ => false,
            },
        }
    }
}

/// RAM tier of the frame buffer.
pub struct RamRingBuffer {
    budget: RamBudget,
    ring: RwLock<Ring>,
    sink: Option<Arc<dyn EvictionSink>>,
    stats: Mutex<RamStats>,
}

impl RamRingBuffer {
    pub fn new(budget: RamBudget) -> Self {
        Self {
            budget,
            ring: RwLock::new(Ring {
                entries: VecDeque::new(),
                bytes: 0,
                last_sequence: None,
            }),
            sink: None,
            stats: Mutex::new(RamStats::default()),
        }
    }

    /// Hand evicted frames to `sink` instead of dropping them.
    pub fn with_sink(mut self, sink: Arc<dyn EvictionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Require every future push to be above `sequence`.
    pub fn with_sequence_floor(self, sequence: u64) -> Self {
        self.ring.write().last_sequence = Some(sequence);
        self
    }

    pub fn budget(&self) -> RamBudget {
        self.budget
    }

    /// Append a frame, evicting the oldest while over budget.
    ///
    /// Returns how many frames were evicted. A frame whose sequence is not
    /// above the last accepted one is dropped and reported as a gap.
    pub fn push(&self, entry: FrameEntry) -> Result<usize, SequenceGapError> {
        let sequence = entry.sequence;
        let mut evicted = 0usize;
        let mut jumped = false;
        let mut regressed = false;

        {
            let mut ring = self.ring.write();
            if let Some(last) = ring.last_sequence {
                if sequence <= last {
                    drop(ring);
                    self.stats.lock().sequence_gaps_dropped += 1;
                    warn!(last, received = sequence, "Dropping out-of-order frame");
                    return Err(SequenceGapError {
                        last,
                        received: sequence,
                    });
                }
                jumped = sequence > last + 1;
            }
            if let Some(newest) = ring.entries.back() {
                regressed = entry.captured_at < newest.captured_at;
            }

            ring.bytes += entry.byte_size();
            ring.last_sequence = Some(sequence);
            ring.entries.push_back(Arc::new(entry));

            while ring.over_budget(self.budget) {
                let Some(oldest) = ring.entries.pop_front() else {
                    break;
                };
                ring.bytes -= oldest.byte_size();
                evicted += 1;
                if let Some(sink) = &self.sink {
                    sink.on_evict(Arc::try_unwrap(oldest).unwrap_or_else(|shared| (*shared).clone()));
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.frames_pushed += 1;
            stats.frames_evicted += evicted as u64;
            if jumped {
                stats.forward_jumps += 1;
            }
            if regressed {
                stats.timestamp_regressions += 1;
            }
        }
        if jumped {
            trace!(sequence, "Sequence jumped forward");
        }
        if regressed {
            warn!(sequence, "Frame captured earlier than its predecessor");
        }

        Ok(evicted)
    }

    /// Frames captured in `[from, to]`, ordered by sequence.
    ///
    /// Capture times are not assumed monotonic; every held frame is checked.
    pub fn query(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Arc<FrameEntry>> {
        let ring = self.ring.read();
        ring.entries
            .iter()
            .filter(|entry| entry.captured_at >= from && entry.captured_at <= to)
            .cloned()
            .collect()
    }

    /// Frames captured in the trailing `lookback` ending at `now`.
    pub fn trailing(&self, lookback: Duration, now: DateTime<Utc>) -> Vec<Arc<FrameEntry>> {
        self.query(now - to_chrono(lookback), now)
    }

    /// Every frame currently held, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<FrameEntry>> {
        self.ring.read().entries.iter().cloned().collect()
    }

    /// Remove every frame, oldest first. The sequence floor is kept.
    pub fn drain(&self) -> Vec<FrameEntry> {
        let entries: Vec<Arc<FrameEntry>> = {
            let mut ring = self.ring.write();
            ring.bytes = 0;
            ring.entries.drain(..).collect()
        };
        entries
            .into_iter()
            .map(|entry| Arc::try_unwrap(entry).unwrap_or_else(|shared| (*shared).clone()))
            .collect()
    }

    pub fn get(&self, sequence: u64) -> Option<Arc<FrameEntry>> {
        let ring = self.ring.read();
        let idx = ring
            .entries
            .binary_search_by_key(&sequence, |entry| entry.sequence)
            .ok()?;
        ring.entries.get(idx).cloned()
    }

    pub fn oldest(&self) -> Option<Arc<FrameEntry>> {
        self.ring.read().entries.front().cloned()
    }

    pub fn newest(&self) -> Option<Arc<FrameEntry>> {
        self.ring.read().entries.back().cloned()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.ring.read().last_sequence
    }

    pub fn len(&self) -> usize {
        self.ring.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().entries.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.ring.read().bytes
    }

    /// Capture-time span between the oldest and newest frame.
    pub fn duration(&self) -> Duration {
        let ring = self.ring.read();
        match (ring.entries.front(), ring.entries.back()) {
            (Some(oldest), Some(newest)) => newest
                .captured_at
                .signed_duration_since(oldest.captured_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    pub fn stats(&self) -> RamStats {
        self.stats.lock().clone()
    }
}
