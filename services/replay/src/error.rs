//! Error taxonomy for the replay buffer.
//!
//! Buffer, disk and recovery errors are contained inside the crate and degrade
//! to a smaller retention window or a fresh buffer. Only Smart Pause outcomes
//! reach callers, and those arrive as a typed [`SmartPauseFailure`] inside the
//! diagnostics record.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised on the ingest path and by the storage tiers.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error(transparent)]
    SequenceGap(#[from] SequenceGapError),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A frame arrived with a sequence number at or below the last accepted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Sequence gap: received {received} after {last}")]
pub struct SequenceGapError {
    pub last: u64,
    pub received: u64,
}

/// Errors from encoding or decoding a compressed frame payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Quality {0} outside valid range 1..=100")]
    InvalidQuality(u8),

    #[error("Pixel buffer is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Unsupported frame dimensions {width}x{height}")]
    Dimensions { width: u32, height: u32 },

    #[error("Payload truncated")]
    Truncated,

    #[error("Payload magic mismatch")]
    BadMagic,

    #[error("Unknown pixel format code {0}")]
    UnknownFormat(u8),

    #[error("Timestamp out of range: {0}us")]
    Timestamp(i64),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),
}

/// Reasons a persisted recovery index is not trusted.
///
/// Any of these sends the buffer down the fresh-start branch.
#[derive(Debug, Error)]
pub enum RecoveryStaleError {
    #[error("No recovery index present")]
    Missing,

    #[error("Recovery index unreadable: {0}")]
    Unreadable(String),

    #[error("Recovery index version {found} not supported")]
    UnsupportedVersion { found: u32 },

    #[error("Recovery index belongs to stream {found}, expected {expected}")]
    StreamMismatch { expected: String, found: String },

    #[error("Recovery index is {age_secs}s old, limit {max_age_secs}s")]
    TooOld { age_secs: i64, max_age_secs: u64 },

    #[error("Referenced segment missing or invalid: {0}")]
    SegmentMissing(PathBuf),

    #[error("Recovery index references no segments")]
    Empty,
}

/// Soft configuration problems. Each one falls back to a safe default.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("Unknown RAM size class '{0}'")]
    InvalidSizeClass(String),

    #[error("Retention of {0} minutes is not one of 20, 30 or 40")]
    InvalidRetention(u64),

    #[error("Lookback of {0}s outside 1..=5s")]
    LookbackOutOfRange(f64),

    #[error("Compression quality {0} outside 1..=100")]
    InvalidQuality(u8),
}

/// Why a Smart Pause run did not land on a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SmartPauseFailure {
    #[error("No frames available in the lookback window")]
    NoFramesAvailable,

    #[error("Active source does not support seeking")]
    NoSeekCapability,

    #[error("Playback engine rejected the seek: {0}")]
    SeekFailed(String),

    #[error("No scoring algorithm could run on the candidate frames")]
    ScoringUnavailable,
}

pub type Result<T, E = BufferError> = std::result::Result<T, E>;
