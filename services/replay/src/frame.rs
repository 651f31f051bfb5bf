//! Frame types shared by every tier.

use crate::error::BufferError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of an on-disk segment. Monotonic per buffer.
pub type SegmentId = u64;

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Rgba32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 => 4,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 => 2,
            PixelFormat::Rgba32 => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PixelFormat::Gray8),
            2 => Some(PixelFormat::Rgb24),
            3 => Some(PixelFormat::Rgba32),
            _ => None,
        }
    }
}

/// A decoded frame as delivered by the playback engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Producer-assigned, strictly increasing frame identity
    pub sequence: u64,

    /// Wall-clock capture time
    pub captured_at: DateTime<Utc>,

    /// Position on the source timeline (absent for live-only sources)
    pub playback_offset: Option<Duration>,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Tightly packed pixel rows
    pub data: Bytes,
}

impl RawFrame {
    pub fn new(
        sequence: u64,
        captured_at: DateTime<Utc>,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            sequence,
            captured_at,
            playback_offset: None,
            width,
            height,
            format,
            data: data.into(),
        }
    }

    pub fn with_playback_offset(mut self, offset: Duration) -> Self {
        self.playback_offset = Some(offset);
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn expected_len(&self) -> usize {
        self.pixel_count() * self.format.bytes_per_pixel()
    }

    /// Reject frames whose buffer does not match the declared geometry.
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.width == 0 || self.height == 0 {
            return Err(BufferError::InvalidFrame(format!(
                "empty dimensions {}x{}",
                self.width, self.height
            )));
        }
        if self.data.len() != self.expected_len() {
            return Err(BufferError::InvalidFrame(format!(
                "{} bytes for {}x{} {:?}, expected {}",
                self.data.len(),
                self.width,
                self.height,
                self.format,
                self.expected_len()
            )));
        }
        Ok(())
    }

    /// Luma plane using integer BT.601 weights.
    pub fn to_luma(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Gray8 => self.data.to_vec(),
            PixelFormat::Rgb24 => self.data.chunks_exact(3).map(luma).collect(),
            PixelFormat::Rgba32 => self.data.chunks_exact(4).map(luma).collect(),
        }
    }
}

fn luma(px: &[u8]) -> u8 {
    ((77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8) as u8
}

/// Which tier currently owns a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTier {
    Ram,
    Disk(SegmentId),
}

/// A compressed frame as held by the RAM and disk tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEntry {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub playback_offset: Option<Duration>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Compressed payload, self-describing (see `compressor`)
    pub payload: Bytes,

    pub tier: FrameTier,
}

impl FrameEntry {
    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }

    /// Age relative to `now`, zero for frames stamped in the future.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.captured_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn into_tier(mut self, tier: FrameTier) -> Self {
        self.tier = tier;
        self
    }
}

pub(crate) fn micros_to_utc(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// Saturating conversion for window arithmetic.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
