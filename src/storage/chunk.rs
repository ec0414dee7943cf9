//! Chunk encoding for strata data files
//!
//! A chunk is the column of one measurement inside a chunk group. Payloads
//! are built as:
//! 1. Sort points by timestamp
//! 2. Delta-encode timestamps (store differences from the previous point)
//! 3. Serialize to compact binary format (bincode)
//! 4. LZ4 compress the result
//!
//! On disk a chunk record is self-delimiting and self-checking:
//!
//! ```text
//! measurement: u16 len + UTF-8
//! statistics:  count u32, min_ts i64, max_ts i64, min_val f64, max_val f64
//! payload:     u32 len + compressed bytes
//! checksum:    CRC32 over the compressed bytes
//! ```

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::io::{
    read_f64, read_i64, read_str16, read_u32, write_f64, write_i64, write_str16, write_u32,
};
use crate::storage::types::{Point, TimeRange};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Serialized size of `ChunkStats` in a chunk record
pub const STATS_SIZE: usize = 4 + 8 + 8 + 8 + 8;

/// Upper bound on a single chunk payload; larger length words mean a
/// corrupt or torn record
pub const MAX_CHUNK_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Per-chunk statistics, written alongside every chunk
///
/// Recovery rebuilds the per-device time-range index from these without
/// decoding any payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkStats {
    /// Number of points in the chunk
    pub count: u32,
    /// Smallest timestamp (inclusive)
    pub min_timestamp: i64,
    /// Largest timestamp (inclusive)
    pub max_timestamp: i64,
    /// Smallest value
    pub min_value: f64,
    /// Largest value
    pub max_value: f64,
}

impl ChunkStats {
    /// Compute statistics over a point slice; None if empty
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut stats = Self {
            count: points.len() as u32,
            min_timestamp: first.timestamp,
            max_timestamp: first.timestamp,
            min_value: first.value,
            max_value: first.value,
        };
        for point in &points[1..] {
            stats.min_timestamp = stats.min_timestamp.min(point.timestamp);
            stats.max_timestamp = stats.max_timestamp.max(point.timestamp);
            stats.min_value = stats.min_value.min(point.value);
            stats.max_value = stats.max_value.max(point.value);
        }
        Some(stats)
    }

    /// Inclusive time span covered by the chunk
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.min_timestamp, self.max_timestamp)
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write_u32(w, self.count)?;
        write_i64(w, self.min_timestamp)?;
        write_i64(w, self.max_timestamp)?;
        write_f64(w, self.min_value)?;
        write_f64(w, self.max_value)?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            count: read_u32(r)?,
            min_timestamp: read_i64(r)?,
            max_timestamp: read_i64(r)?,
            min_value: read_f64(r)?,
            max_value: read_f64(r)?,
        })
    }
}

/// Intermediate format for delta-encoded points
#[derive(Debug, Serialize, Deserialize)]
struct EncodedSeries {
    /// Base timestamp (first point's timestamp)
    base_timestamp: i64,
    /// Delta-encoded timestamps (differences from previous)
    timestamp_deltas: Vec<i64>,
    /// Values, stored as-is
    values: Vec<f64>,
}

/// Compress a point slice using delta encoding + LZ4
///
/// Input is sorted by timestamp before encoding.
pub fn compress_points(points: &[Point]) -> StorageResult<Vec<u8>> {
    if points.is_empty() {
        return Ok(Vec::new());
    }

    let mut sorted: Vec<&Point> = points.iter().collect();
    sorted.sort_by_key(|p| p.timestamp);

    let base_timestamp = sorted[0].timestamp;
    let mut timestamp_deltas = Vec::with_capacity(sorted.len());
    let mut prev_ts = base_timestamp;
    for point in &sorted {
        timestamp_deltas.push(point.timestamp - prev_ts);
        prev_ts = point.timestamp;
    }

    let values: Vec<f64> = sorted.iter().map(|p| p.value).collect();

    let series = EncodedSeries {
        base_timestamp,
        timestamp_deltas,
        values,
    };

    let serialized = bincode::serialize(&series)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress a chunk payload back to points, sorted by timestamp
pub fn decompress_points(data: &[u8]) -> StorageResult<Vec<Point>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;

    let series: EncodedSeries = bincode::deserialize(&decompressed)?;

    if series.values.len() != series.timestamp_deltas.len() {
        return Err(StorageError::Corruption(
            "chunk payload has mismatched timestamp and value counts".to_string(),
        ));
    }

    let mut points = Vec::with_capacity(series.timestamp_deltas.len());
    let mut current_timestamp = series.base_timestamp;
    for (i, delta) in series.timestamp_deltas.iter().enumerate() {
        current_timestamp += delta;
        points.push(Point::new(current_timestamp, series.values[i]));
    }

    Ok(points)
}

/// One measurement column, encoded and ready to be written into a group
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    /// Measurement name within the device
    pub measurement: String,
    /// Statistics over the encoded points
    pub stats: ChunkStats,
    /// Compressed payload bytes
    pub payload: Vec<u8>,
}

impl EncodedChunk {
    /// Encode a series of points for one measurement
    pub fn encode(measurement: impl Into<String>, points: &[Point]) -> StorageResult<Self> {
        let stats = ChunkStats::from_points(points).ok_or_else(|| {
            StorageError::WriterState("cannot encode an empty series".to_string())
        })?;
        let payload = compress_points(points)?;
        Ok(Self {
            measurement: measurement.into(),
            stats,
            payload,
        })
    }

    /// Decode the payload back to points
    pub fn decode(&self) -> StorageResult<Vec<Point>> {
        decompress_points(&self.payload)
    }

    /// Size of the full chunk record on disk
    pub fn encoded_len(&self) -> u64 {
        (2 + self.measurement.len() + STATS_SIZE + 4 + self.payload.len() + 4) as u64
    }

    /// Write the full chunk record (measurement, stats, payload, checksum)
    pub fn write_to<W: Write>(&self, w: &mut W) -> StorageResult<u64> {
        write_str16(w, &self.measurement)?;
        self.stats.write_to(w)?;
        write_u32(w, self.payload.len() as u32)?;
        w.write_all(&self.payload)?;
        write_u32(w, crc32fast::hash(&self.payload))?;
        Ok(self.encoded_len())
    }

    /// Read one chunk record, verifying the payload checksum
    pub fn read_from<R: Read>(r: &mut R) -> StorageResult<Self> {
        let measurement = read_str16(r)?;
        let stats = ChunkStats::read_from(r)?;

        let payload_len = read_u32(r)?;
        if payload_len > MAX_CHUNK_PAYLOAD {
            return Err(StorageError::Corruption(format!(
                "chunk payload length {} exceeds maximum {}",
                payload_len, MAX_CHUNK_PAYLOAD
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        r.read_exact(&mut payload)?;

        let stored_crc = read_u32(r)?;
        let computed_crc = crc32fast::hash(&payload);
        if stored_crc != computed_crc {
            return Err(StorageError::Corruption(format!(
                "chunk '{}' checksum mismatch: stored {:#010x}, computed {:#010x}",
                measurement, stored_crc, computed_crc
            )));
        }

        Ok(Self {
            measurement,
            stats,
            payload,
        })
    }
}
