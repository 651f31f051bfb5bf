//! On-disk segment format.
//!
//! Each segment is one file, `seg-{id:010}.rseg`: a fixed 64-byte header
//! followed by length-prefixed compressed frame records.
//!
//! ```text
//! header:  magic "RSEG" | version u16 | flags u16 | segment_id u64
//!          start_seq u64 | end_seq u64 | start_ts i64 | end_ts i64
//!          frame_count u32 | reserved (12)
//! record:  len u32 | payload[len]
//! ```
//!
//! The header is written as a placeholder when a segment opens and rewritten
//! with the final bounds and the sealed flag when it rotates. Records are
//! appended in increasing sequence order.

use crate::compressor::{self, PayloadHeader};
use crate::frame::{micros_to_utc, FrameEntry, FrameTier, SegmentId};
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const MAGIC: &[u8; 4] = b"RSEG";
const VERSION: u16 = 1;
const FLAG_SEALED: u16 = 0b1;
const RECORD_PREFIX_LEN: u64 = 4;

pub const HEADER_LEN: usize = 64;
pub const FILE_EXTENSION: &str = "rseg";

/// Manifest entry describing one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: SegmentId,
    /// File name relative to the segment directory
    pub location: String,
    pub start_sequence: u64,
    pub end_sequence: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub frame_count: u32,
    pub byte_size: u64,
    pub sealed: bool,
}

impl SegmentMeta {
    pub fn overlaps_time(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.frame_count > 0 && self.start_time <= to && self.end_time >= from
    }

    pub fn overlaps_sequence(&self, first: u64, last: u64) -> bool {
        self.frame_count > 0 && self.start_sequence <= last && self.end_sequence >= first
    }
}

pub fn file_name(id: SegmentId) -> String {
    format!("seg-{id:010}.{FILE_EXTENSION}")
}

/// Segment id encoded in a file name, if it is one of ours.
pub fn parse_file_name(name: &str) -> Option<SegmentId> {
    name.strip_prefix("seg-")?
        .strip_suffix(&format!(".{FILE_EXTENSION}"))?
        .parse()
        .ok()
}

/// Decoded fixed-size header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentHeader {
    pub segment_id: SegmentId,
    pub sealed: bool,
    pub start_sequence: u64,
    pub end_sequence: u64,
    pub start_micros: i64,
    pub end_micros: i64,
    pub frame_count: u32,
}

impl SegmentHeader {
    fn placeholder(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            sealed: false,
            start_sequence: 0,
            end_sequence: 0,
            start_micros: 0,
            end_micros: 0,
            frame_count: 0,
        }
    }

    fn from_meta(meta: &SegmentMeta) -> Self {
        Self {
            segment_id: meta.id,
            sealed: meta.sealed,
            start_sequence: meta.start_sequence,
            end_sequence: meta.end_sequence,
            start_micros: meta.start_time.timestamp_micros(),
            end_micros: meta.end_time.timestamp_micros(),
            frame_count: meta.frame_count,
        }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u16(if self.sealed { FLAG_SEALED } else { 0 });
        buf.put_u64(self.segment_id);
        buf.put_u64(self.start_sequence);
        buf.put_u64(self.end_sequence);
        buf.put_i64(self.start_micros);
        buf.put_i64(self.end_micros);
        buf.put_u32(self.frame_count);
        buf.resize(HEADER_LEN, 0);

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    fn decode(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(invalid("bad segment header"));
        }
        let mut cur = &bytes[4..HEADER_LEN];
        let version = cur.get_u16();
        if version != VERSION {
            return Err(invalid(&format!("unsupported segment version {version}")));
        }
        let flags = cur.get_u16();
        Ok(Self {
            segment_id: cur.get_u64(),
            sealed: flags & FLAG_SEALED != 0,
            start_sequence: cur.get_u64(),
            end_sequence: cur.get_u64(),
            start_micros: cur.get_i64(),
            end_micros: cur.get_i64(),
            frame_count: cur.get_u32(),
        })
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Appends records to the currently open segment.
pub struct SegmentWriter {
    file: BufWriter<File>,
    path: PathBuf,
    meta: SegmentMeta,
}

impl SegmentWriter {
    pub fn create(dir: &Path, id: SegmentId) -> io::Result<Self> {
        let location = file_name(id);
        let path = dir.join(&location);
        let mut file = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)?,
        );
        file.write_all(&SegmentHeader::placeholder(id).encode())?;

        debug!(segment_id = id, path = %path.display(), "Opened segment");

        Ok(Self {
            file,
            path,
            meta: SegmentMeta {
                id,
                location,
                start_sequence: 0,
                end_sequence: 0,
                start_time: DateTime::<Utc>::default(),
                end_time: DateTime::<Utc>::default(),
                frame_count: 0,
                byte_size: HEADER_LEN as u64,
                sealed: false,
            },
        })
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes the segment would occupy after appending `entry`.
    pub fn size_with(&self, entry: &FrameEntry) -> u64 {
        self.meta.byte_size + RECORD_PREFIX_LEN + entry.byte_size() as u64
    }

    pub fn append(&mut self, entry: &FrameEntry) -> io::Result<()> {
        let len = u32::try_from(entry.byte_size()).map_err(|_| invalid("frame too large"))?;
        self.file.write_all(&len.to_be_bytes())?;
        self.file.write_all(&entry.payload)?;

        if self.meta.frame_count == 0 {
            self.meta.start_sequence = entry.sequence;
            self.meta.start_time = entry.captured_at;
        }
        self.meta.end_sequence = entry.sequence;
        self.meta.end_time = entry.captured_at;
        self.meta.frame_count += 1;
        self.meta.byte_size += RECORD_PREFIX_LEN + len as u64;
        Ok(())
    }

    /// Make appended records visible to readers.
    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    /// Rewrite the header with final bounds and mark the segment immutable.
    pub fn seal(self) -> io::Result<SegmentMeta> {
        let mut meta = self.meta;
        meta.sealed = true;

        let mut file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&SegmentHeader::from_meta(&meta).encode())?;
        file.sync_all()?;

        debug!(
            segment_id = meta.id,
            frames = meta.frame_count,
            bytes = meta.byte_size,
            "Sealed segment"
        );
        Ok(meta)
    }
}

/// Everything recoverable from one segment file.
#[derive(Debug)]
pub struct SegmentContents {
    pub header: SegmentHeader,
    pub frames: Vec<FrameEntry>,
    /// False when reading stopped at a truncated or corrupt record
    pub complete: bool,
}

/// Read a segment, keeping every record up to the first damaged one.
pub fn read_segment(path: &Path) -> io::Result<SegmentContents> {
    read_segment_where(path, |_| true)
}

/// Stream a segment's records, loading only those whose payload header
/// `keep` accepts. Rejected records are skipped without reading their body.
pub fn read_segment_where<F>(path: &Path, mut keep: F) -> io::Result<SegmentContents>
where
    F: FnMut(&PayloadHeader) -> bool,
{
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut raw_header = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw_header)?;
    let header = SegmentHeader::decode(&raw_header)?;
    let tier = FrameTier::Disk(header.segment_id);

    let mut offset = HEADER_LEN as u64;
    let mut frames = Vec::new();
    let mut complete = true;
    let mut last_sequence: Option<u64> = None;
    let mut prefix = [0u8; RECORD_PREFIX_LEN as usize];
    let mut payload_header = [0u8; compressor::HEADER_LEN];

    while offset < file_len {
        if offset + RECORD_PREFIX_LEN > file_len {
            complete = false;
            break;
        }
        reader.read_exact(&mut prefix)?;
        let len = u32::from_be_bytes(prefix) as u64;
        if len < compressor::HEADER_LEN as u64 || offset + RECORD_PREFIX_LEN + len > file_len {
            complete = false;
            break;
        }

        reader.read_exact(&mut payload_header)?;
        let decoded = match compressor::read_header(&payload_header) {
            Ok(decoded) if last_sequence.map_or(true, |last| decoded.sequence > last) => decoded,
            _ => {
                complete = false;
                break;
            }
        };
        last_sequence = Some(decoded.sequence);

        let body_len = len - compressor::HEADER_LEN as u64;
        if keep(&decoded) {
            let mut payload = BytesMut::zeroed(len as usize);
            payload[..compressor::HEADER_LEN].copy_from_slice(&payload_header);
            reader.read_exact(&mut payload[compressor::HEADER_LEN..])?;
            match compressor::entry_from_payload(payload.freeze(), tier) {
                Ok(entry) => frames.push(entry),
                Err(_) => {
                    complete = false;
                    break;
                }
            }
        } else {
            reader.seek_relative(body_len as i64)?;
        }
        offset += RECORD_PREFIX_LEN + len;
    }

    Ok(SegmentContents {
        header,
        frames,
        complete,
    })
}

/// Read only the header of a segment file.
pub fn read_header(path: &Path) -> io::Result<SegmentHeader> {
    let mut buf = [0u8; HEADER_LEN];
    File::open(path)?.read_exact(&mut buf)?;
    SegmentHeader::decode(&buf)
}

/// Rebuild bounds of an unsealed segment from its surviving records and seal it.
///
/// Returns `None` when nothing usable survived.
pub fn repair(dir: &Path, id: SegmentId) -> io::Result<Option<SegmentMeta>> {
    let location = file_name(id);
    let path = dir.join(&location);
    let contents = read_segment(&path)?;
    if contents.frames.is_empty() {
        return Ok(None);
    }

    let first = &contents.frames[0];
    let last = &contents.frames[contents.frames.len() - 1];
    let byte_size = HEADER_LEN as u64
        + contents
            .frames
            .iter()
            .map(|f| RECORD_PREFIX_LEN + f.byte_size() as u64)
            .sum::<u64>();

    let meta = SegmentMeta {
        id,
        location,
        start_sequence: first.sequence,
        end_sequence: last.sequence,
        start_time: first.captured_at,
        end_time: last.captured_at,
        frame_count: contents.frames.len() as u32,
        byte_size,
        sealed: true,
    };

    let mut file = OpenOptions::new().write(true).open(&path)?;
    // Drop any torn tail record.
    file.set_len(byte_size)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&SegmentHeader::from_meta(&meta).encode())?;
    file.sync_all()?;

    Ok(Some(meta))
}

/// Check that a manifest entry still matches the file on disk.
pub fn verify(dir: &Path, meta: &SegmentMeta) -> bool {
    let path = dir.join(&meta.location);
    match (read_header(&path), std::fs::metadata(&path)) {
        (Ok(header), Ok(stat)) => {
            let size_ok = if meta.sealed {
                stat.len() >= meta.byte_size
            } else {
                stat.len() >= HEADER_LEN as u64
            };
            header.segment_id == meta.id && size_ok
        }
        _ => false,
    }
}

impl SegmentHeader {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        micros_to_utc(self.start_micros)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        micros_to_utc(self.end_micros)
    }
}
