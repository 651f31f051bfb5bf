//! Frame compression shared by the RAM and disk tiers.
//!
//! A compressed payload is self-describing: a fixed header carrying the frame
//! identity and geometry followed by a JPEG body.
//!
//! ```text
//! magic "RPF1" | format u8 | quality u8 | flags u8 | reserved u8
//! sequence u64 | captured_at i64 (us) | playback_offset u64 (us)
//! width u32 | height u32 | JPEG ...
//! ```
//!
//! Encoding is deterministic: the same frame and quality always produce the
//! same bytes.

use crate::error::CodecError;
use crate::frame::{micros_to_utc, FrameEntry, FrameTier, PixelFormat, RawFrame};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageFormat};
use std::time::Duration;

const MAGIC: &[u8; 4] = b"RPF1";
const FLAG_PLAYBACK_OFFSET: u8 = 0b0000_0001;
const MAX_JPEG_DIMENSION: u32 = 65_535;

pub const HEADER_LEN: usize = 40;
pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;
pub const DEFAULT_QUALITY: u8 = 80;

/// Identity and geometry carried in front of every payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayloadHeader {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub playback_offset: Option<Duration>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub quality: u8,
}

/// Compress a raw frame at the given JPEG quality.
pub fn encode(frame: &RawFrame, quality: u8) -> Result<Bytes, CodecError> {
    if !(MIN_QUALITY..=MAX_QUALITY).contains(&quality) {
        return Err(CodecError::InvalidQuality(quality));
    }
    if frame.width == 0
        || frame.height == 0
        || frame.width > MAX_JPEG_DIMENSION
        || frame.height > MAX_JPEG_DIMENSION
    {
        return Err(CodecError::Dimensions {
            width: frame.width,
            height: frame.height,
        });
    }
    if frame.data.len() != frame.expected_len() {
        return Err(CodecError::FrameSize {
            expected: frame.expected_len(),
            actual: frame.data.len(),
        });
    }

    let mut jpeg = Vec::with_capacity(frame.data.len() / 8);
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
        match frame.format {
            PixelFormat::Gray8 => {
                encoder.encode(&frame.data, frame.width, frame.height, ColorType::L8)?
            }
            PixelFormat::Rgb24 => {
                encoder.encode(&frame.data, frame.width, frame.height, ColorType::Rgb8)?
            }
            PixelFormat::Rgba32 => {
                // JPEG has no alpha channel; decode restores it as opaque.
                let rgb: Vec<u8> = frame
                    .data
                    .chunks_exact(4)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect();
                encoder.encode(&rgb, frame.width, frame.height, ColorType::Rgb8)?
            }
        }
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + jpeg.len());
    buf.put_slice(MAGIC);
    buf.put_u8(frame.format.code());
    buf.put_u8(quality);
    buf.put_u8(if frame.playback_offset.is_some() {
        FLAG_PLAYBACK_OFFSET
    } else {
        0
    });
    buf.put_u8(0);
    buf.put_u64(frame.sequence);
    buf.put_i64(frame.captured_at.timestamp_micros());
    buf.put_u64(
        frame
            .playback_offset
            .map(|offset| offset.as_micros() as u64)
            .unwrap_or(0),
    );
    buf.put_u32(frame.width);
    buf.put_u32(frame.height);
    buf.put_slice(&jpeg);

    Ok(buf.freeze())
}

/// Parse only the payload header, leaving the JPEG body untouched.
pub fn read_header(bytes: &[u8]) -> Result<PayloadHeader, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated);
    }
    if &bytes[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }

    let mut cur = &bytes[4..HEADER_LEN];
    let format_code = cur.get_u8();
    let format = PixelFormat::from_code(format_code).ok_or(CodecError::UnknownFormat(format_code))?;
    let quality = cur.get_u8();
    let flags = cur.get_u8();
    let _reserved = cur.get_u8();
    let sequence = cur.get_u64();
    let captured_micros = cur.get_i64();
    let offset_micros = cur.get_u64();
    let width = cur.get_u32();
    let height = cur.get_u32();

    let captured_at = micros_to_utc(captured_micros).ok_or(CodecError::Timestamp(captured_micros))?;
    let playback_offset =
        (flags & FLAG_PLAYBACK_OFFSET != 0).then(|| Duration::from_micros(offset_micros));

    Ok(PayloadHeader {
        sequence,
        captured_at,
        playback_offset,
        width,
        height,
        format,
        quality,
    })
}

/// Decompress a payload back into a raw frame.
pub fn decode(bytes: &[u8]) -> Result<RawFrame, CodecError> {
    let header = read_header(bytes)?;
    let image = image::load_from_memory_with_format(&bytes[HEADER_LEN..], ImageFormat::Jpeg)?;

    if image.width() != header.width || image.height() != header.height {
        return Err(CodecError::Dimensions {
            width: image.width(),
            height: image.height(),
        });
    }

    let data = match header.format {
        PixelFormat::Gray8 => image.into_luma8().into_raw(),
        PixelFormat::Rgb24 => image.into_rgb8().into_raw(),
        PixelFormat::Rgba32 => image.into_rgba8().into_raw(),
    };

    Ok(RawFrame {
        sequence: header.sequence,
        captured_at: header.captured_at,
        playback_offset: header.playback_offset,
        width: header.width,
        height: header.height,
        format: header.format,
        data: Bytes::from(data),
    })
}

/// Rebuild a tier entry from a stored payload without decoding pixels.
pub fn entry_from_payload(payload: Bytes, tier: FrameTier) -> Result<FrameEntry, CodecError> {
    let header = read_header(&payload)?;
    Ok(FrameEntry {
        sequence: header.sequence,
        captured_at: header.captured_at,
        playback_offset: header.playback_offset,
        width: header.width,
        height: header.height,
        format: header.format,
        payload,
        tier,
    })
}

/// Compressor bound to the configured quality.
#[derive(Debug, Clone, Copy)]
pub struct FrameCompressor {
    quality: u8,
}

impl FrameCompressor {
    /// Out-of-range qualities are clamped into `1..=100`.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(MIN_QUALITY, MAX_QUALITY),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn compress(&self, frame: &RawFrame) -> Result<FrameEntry, CodecError> {
        // Built from the header so RAM and disk copies agree to the microsecond.
        entry_from_payload(encode(frame, self.quality)?, FrameTier::Ram)
    }

    pub fn decompress(&self, entry: &FrameEntry) -> Result<RawFrame, CodecError> {
        decode(&entry.payload)
    }
}

impl Default for FrameCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}
