//! Length-framed tile record codec.
//!
//! # Layout
//!
//! ```text
//! shard   := frame*
//! frame   := len:u64le payload[len]
//! payload := version:u8 slide_len:u16le slide[slide_len] location? image[..]
//! location:= loc_x:i64le loc_y:i64le          (version 2 only)
//! ```
//!
//! Counting only reads frame headers and seeks over payloads, so manifests of
//! large shards can be built without loading tile data.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ShardError;

/// Payload version without tile locations.
const VERSION_BASIC: u8 = 1;

/// Payload version with tile locations.
const VERSION_LOCATED: u8 = 2;

/// Size of the frame length header.
const FRAME_HEADER_SIZE: u64 = 8;

// =============================================================================
// Record types
// =============================================================================

/// A single extracted tile stored in a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    /// Slide the tile was extracted from
    pub slide: String,

    /// Base-level pixel location of the tile, if recorded
    pub location: Option<(i64, i64)>,

    /// Encoded image bytes
    pub image: Bytes,
}

impl TileRecord {
    pub fn new(slide: impl Into<String>, image: impl Into<Bytes>) -> Self {
        Self {
            slide: slide.into(),
            location: None,
            image: image.into(),
        }
    }

    pub fn with_location(mut self, x: i64, y: i64) -> Self {
        self.location = Some((x, y));
        self
    }
}

/// Feature layout of the records in a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSchema {
    /// slide + image
    Basic,
    /// slide + location + image
    Located,
}

// =============================================================================
// ShardCodec
// =============================================================================

/// Read/write contract for shard files.
pub trait ShardCodec: Send + Sync {
    /// Count the records in a shard.
    fn count_records(&self, path: &Path) -> Result<usize, ShardError>;

    /// Read every record of a shard.
    fn read_records(&self, path: &Path) -> Result<Vec<TileRecord>, ShardError>;

    /// Write records to a new shard, replacing any existing file.
    fn write_records(&self, path: &Path, records: &[TileRecord]) -> Result<(), ShardError>;

    /// Detect the record schema from the first record.
    fn detect_schema(&self, path: &Path) -> Result<RecordSchema, ShardError>;
}

/// Default codec for the length-framed shard format.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedCodec;

fn io_err(path: &Path, err: std::io::Error) -> ShardError {
    ShardError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

impl FramedCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a record payload.
    pub fn encode(record: &TileRecord) -> Bytes {
        let slide = record.slide.as_bytes();
        let mut buf = BytesMut::with_capacity(1 + 2 + slide.len() + 16 + record.image.len());
        match record.location {
            Some((x, y)) => {
                buf.put_u8(VERSION_LOCATED);
                buf.put_u16_le(slide.len() as u16);
                buf.put_slice(slide);
                buf.put_i64_le(x);
                buf.put_i64_le(y);
            }
            None => {
                buf.put_u8(VERSION_BASIC);
                buf.put_u16_le(slide.len() as u16);
                buf.put_slice(slide);
            }
        }
        buf.put_slice(&record.image);
        buf.freeze()
    }

    /// Decode a record payload.
    pub fn decode(path: &Path, mut payload: Bytes) -> Result<TileRecord, ShardError> {
        let corrupt = |message: &str| ShardError::CorruptRecord {
            path: path.to_path_buf(),
            message: message.to_string(),
        };

        if payload.remaining() < 3 {
            return Err(corrupt("payload shorter than header"));
        }
        let version = payload.get_u8();
        let slide_len = payload.get_u16_le() as usize;
        if payload.remaining() < slide_len {
            return Err(corrupt("slide name exceeds payload"));
        }
        let slide = String::from_utf8(payload.split_to(slide_len).to_vec())
            .map_err(|_| corrupt("slide name is not UTF-8"))?;

        let location = match version {
            VERSION_BASIC => None,
            VERSION_LOCATED => {
                if payload.remaining() < 16 {
                    return Err(corrupt("location exceeds payload"));
                }
                Some((payload.get_i64_le(), payload.get_i64_le()))
            }
            other => return Err(corrupt(&format!("unknown record version {other}"))),
        };

        Ok(TileRecord {
            slide,
            location,
            image: payload,
        })
    }

    /// Read the next frame header; `None` at a clean end of file.
    fn next_frame_len(
        reader: &mut impl Read,
        path: &Path,
        offset: u64,
    ) -> Result<Option<u64>, ShardError> {
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        let mut filled = 0;
        while filled < header.len() {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(ShardError::Truncated {
                        path: path.to_path_buf(),
                        offset,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_err(path, e)),
            }
        }
        Ok(Some(u64::from_le_bytes(header)))
    }
}

impl ShardCodec for FramedCodec {
    fn count_records(&self, path: &Path) -> Result<usize, ShardError> {
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let file_len = file.metadata().map_err(|e| io_err(path, e))?.len();
        let mut reader = BufReader::new(file);

        let mut offset = 0u64;
        let mut count = 0;
        while let Some(len) = Self::next_frame_len(&mut reader, path, offset)? {
            let end = offset + FRAME_HEADER_SIZE + len;
            if end > file_len {
                return Err(ShardError::Truncated {
                    path: path.to_path_buf(),
                    offset,
                });
            }
            reader
                .seek(SeekFrom::Start(end))
                .map_err(|e| io_err(path, e))?;
            offset = end;
            count += 1;
        }
        Ok(count)
    }

    fn read_records(&self, path: &Path) -> Result<Vec<TileRecord>, ShardError> {
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let mut reader = BufReader::new(file);

        let mut offset = 0u64;
        let mut records = Vec::new();
        while let Some(len) = Self::next_frame_len(&mut reader, path, offset)? {
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => ShardError::Truncated {
                    path: path.to_path_buf(),
                    offset,
                },
                _ => io_err(path, e),
            })?;
            records.push(Self::decode(path, Bytes::from(payload))?);
            offset += FRAME_HEADER_SIZE + len;
        }
        Ok(records)
    }

    fn write_records(&self, path: &Path, records: &[TileRecord]) -> Result<(), ShardError> {
        let file = File::create(path).map_err(|e| io_err(path, e))?;
        let mut writer = BufWriter::new(file);
        for record in records {
            let payload = Self::encode(record);
            writer
                .write_all(&(payload.len() as u64).to_le_bytes())
                .map_err(|e| io_err(path, e))?;
            writer.write_all(&payload).map_err(|e| io_err(path, e))?;
        }
        writer.flush().map_err(|e| io_err(path, e))
    }

    fn detect_schema(&self, path: &Path) -> Result<RecordSchema, ShardError> {
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let mut reader = BufReader::new(file);
        let len = Self::next_frame_len(&mut reader, path, 0)?
            .ok_or_else(|| ShardError::Empty(path.to_path_buf()))?;
        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|_| ShardError::Truncated {
                path: path.to_path_buf(),
                offset: 0,
            })?;
        let record = Self::decode(path, Bytes::from(payload))?;
        Ok(match record.location {
            Some(_) => RecordSchema::Located,
            None => RecordSchema::Basic,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<TileRecord> {
        (0..n)
            .map(|i| {
                TileRecord::new("slide-1", vec![i as u8; 32]).with_location(i as i64 * 10, 5)
            })
            .collect()
    }

    #[test]
    fn test_count_without_reading_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide-1.tfrecords");
        FramedCodec.write_records(&path, &records(7)).unwrap();

        assert_eq!(FramedCodec.count_records(&path).unwrap(), 7);
    }

    #[test]
    fn test_empty_shard_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tfrecords");
        FramedCodec.write_records(&path, &[]).unwrap();

        assert_eq!(FramedCodec.count_records(&path).unwrap(), 0);
        assert!(matches!(
            FramedCodec.detect_schema(&path),
            Err(ShardError::Empty(_))
        ));
    }

    #[test]
    fn test_truncated_shard_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tfrecords");
        FramedCodec.write_records(&path, &records(2)).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(matches!(
            FramedCodec.count_records(&path),
            Err(ShardError::Truncated { .. })
        ));
    }

    #[test]
    fn test_read_back_preserves_location_and_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide-1.tfrecords");
        let written = records(3);
        FramedCodec.write_records(&path, &written).unwrap();

        let read = FramedCodec.read_records(&path).unwrap();
        assert_eq!(read, written);
        assert_eq!(
            FramedCodec.detect_schema(&path).unwrap(),
            RecordSchema::Located
        );
    }

    #[test]
    fn test_basic_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.tfrecords");
        FramedCodec
            .write_records(&path, &[TileRecord::new("b", vec![1, 2, 3])])
            .unwrap();

        assert_eq!(FramedCodec.detect_schema(&path).unwrap(), RecordSchema::Basic);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let payload = Bytes::from_static(&[9, 0, 0]);
        let result = FramedCodec::decode(Path::new("x"), payload);
        assert!(matches!(result, Err(ShardError::CorruptRecord { .. })));
    }
}
