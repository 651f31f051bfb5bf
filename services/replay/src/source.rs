//! Synthetic frame producer for running the service without a decoder.
//!
//! Emits a moving Gray8 checkerboard. Only every `blur_period`-th frame is left
//! sharp; the rest are box-blurred so the focus scorer has a spread to pick from.

use crate::frame::{PixelFormat, RawFrame};
use chrono::Utc;
use std::time::{Duration, Instant};

const CELL: u32 = 8;

pub struct SyntheticSource {
    width: u32,
    height: u32,
    next_sequence: u64,
    blur_period: u64,
    started: Instant,
}

impl SyntheticSource {
    /// `first_sequence` continues numbering after a recovered window.
    pub fn new(width: u32, height: u32, first_sequence: u64) -> Self {
        Self {
            width,
            height,
            next_sequence: first_sequence.max(1),
            blur_period: 4,
            started: Instant::now(),
        }
    }

    pub fn with_blur_period(mut self, period: u64) -> Self {
        self.blur_period = period.max(1);
        self
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn is_sharp(&self, sequence: u64) -> bool {
        sequence % self.blur_period == 0
    }

    pub fn next_frame(&mut self) -> RawFrame {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut pixels = self.checkerboard(sequence);
        if !self.is_sharp(sequence) {
            pixels = box_blur(&pixels, self.width as usize, self.height as usize);
        }

        RawFrame::new(
            sequence,
            Utc::now(),
            self.width,
            self.height,
            PixelFormat::Gray8,
            pixels,
        )
        .with_playback_offset(self.elapsed())
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn checkerboard(&self, sequence: u64) -> Vec<u8> {
        let shift = (sequence % CELL as u64) as u32;
        let mut pixels = Vec::with_capacity((self.width * self.height) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let on = (((x + shift) / CELL) + (y / CELL)) % 2 == 0;
                pixels.push(if on { 220 } else { 30 });
            }
        }
        pixels
    }
}

/// 3x3 box blur; border pixels are copied.
fn box_blur(pixels: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = pixels.to_vec();
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let mut sum = 0u32;
            for dy in 0..3 {
                for dx in 0..3 {
                    sum += pixels[(y + dy - 1) * width + (x + dx - 1)] as u32;
                }
            }
            out[y * width + x] = (sum / 9) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::{FocusAlgorithm, FocusScorer};

    #[test]
    fn test_sequences_increase_from_start() {
        let mut source = SyntheticSource::new(32, 24, 41);
        let first = source.next_frame();
        let second = source.next_frame();
        assert_eq!(first.sequence, 41);
        assert_eq!(second.sequence, 42);
        assert_eq!(source.next_sequence(), 43);
        assert!(first.validate().is_ok());
        assert_eq!(first.data.len(), 32 * 24);
        assert!(first.playback_offset.is_some());
    }

    #[test]
    fn test_sharp_frames_score_higher() {
        let scorer = FocusScorer::new(FocusAlgorithm::Laplacian, 16);
        let mut source = SyntheticSource::new(64, 48, 1).with_blur_period(4);

        let frames: Vec<_> = (0..4).map(|_| source.next_frame()).collect();
        let sharp = frames.iter().find(|f| f.sequence == 4).unwrap();
        let blurred = frames.iter().find(|f| f.sequence == 2).unwrap();

        let sharp_score = scorer.score(sharp).unwrap();
        let blurred_score = scorer.score(blurred).unwrap();
        assert!(
            sharp_score > blurred_score,
            "sharp {sharp_score} <= blurred {blurred_score}"
        );
    }

    #[test]
    fn test_blur_flattens_edges() {
        let pixels = vec![0, 0, 0, 0, 255, 0, 0, 0, 0];
        let out = box_blur(&pixels, 3, 3);
        assert_eq!(out[4], 28);
        assert_eq!(out[0], 0);
    }
}
