//! Replay Buffer
//!
//! Continuous frame buffer for a live video feed. Recent frames are kept
//! compressed in a RAM ring; frames evicted from RAM overflow into rotating
//! disk segments. A recovery index lets a restarted process reattach to the
//! disk window it left behind. On request, Smart Pause scores the last few
//! seconds for sharpness and seeks the player onto the best frame.
//!
//! ## Architecture
//!
//! ```text
//!  RawFrame ──▶ FrameCompressor ──▶ RamRingBuffer ──evict──▶ DiskSegmentStore
//!                                        │                         │
//!                                        │                  ManifestObserver
//!                                        │                         ▼
//!                                        │                   RecoveryIndex
//!                                        ▼
//!                 FocusScorer ◀── SmartPauseCoordinator ──▶ PlaybackEngine
//! ```
//!
//! [`FrameBuffer`] owns the pipeline from ingest down to disk;
//! [`SmartPauseCoordinator`] reads its window through [`FrameWindowSource`].

pub mod buffer;
pub mod compressor;
pub mod config;
pub mod disk_store;
pub mod error;
pub mod frame;
pub mod playback;
pub mod ram_buffer;
pub mod recovery;
pub mod scorer;
pub mod segment;
pub mod smart_pause;
pub mod source;
pub mod stats;
pub mod ticker;

pub use buffer::{BufferOptions, FrameBuffer};
pub use compressor::FrameCompressor;
pub use config::ReplayConfig;
pub use disk_store::{DiskRead, DiskSegmentStore, DiskStats, DiskStoreOptions, ReadRange};
pub use error::{
    BufferError, CodecError, ConfigurationError, RecoveryStaleError, SequenceGapError,
    SmartPauseFailure,
};
pub use frame::{FrameEntry, FrameTier, PixelFormat, RawFrame, SegmentId};
pub use playback::{LoggingPlaybackEngine, PlaybackEngine, SeekCommand, SeekError, SeekMode};
pub use ram_buffer::{EvictionSink, RamBudget, RamRingBuffer, RamStats};
pub use recovery::{BufferIndex, RecoveryIndex, RecoveryOutcome, WindowBounds};
pub use scorer::{FocusAlgorithm, FocusScorer, FrameScore, SharpnessMetric};
pub use segment::SegmentMeta;
pub use smart_pause::{
    FrameWindowSource, SmartPauseCoordinator, SmartPauseDiagnostics, SmartPauseListener,
    SmartPauseOutcome, SmartPauseSettings, SmartPauseState,
};
pub use source::SyntheticSource;
pub use stats::{BufferMetrics, StatsListener, StatsReporter};
pub use ticker::Ticker;
