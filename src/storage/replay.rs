//! Self-describing replay units
//!
//! The record shapes shared by data-file replay (rebuilding or merging
//! sealed files) and log-shaped consumers: every unit is self-delimiting,
//! so a reader that does not care about a unit can still skip it safely.
//!
//! Wire format per unit:
//! - flag: u8 (0 = chunk, 1 = deletion; anything else is a fatal format
//!   error, never skipped silently)
//! - chunk: device (u16 len + UTF-8) + full chunk record (see chunk.rs)
//! - deletion: device + measurement (u16 len + UTF-8 each) + start i64 +
//!   end i64
//!
//! A data file's tombstones live in a `.tomb` side file holding serialized
//! deletion units, flag byte included, so the same decoder walks both.

use crate::storage::chunk::EncodedChunk;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::DataFileWriter;
use crate::storage::io::{read_i64, read_str16, read_u8, write_i64, write_str16, write_u8};
use crate::storage::types::{DeviceId, TimeRange};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

/// Flag byte of a chunk unit
pub const FLAG_CHUNK: u8 = 0;

/// Flag byte of a deletion unit
pub const FLAG_DELETION: u8 = 1;

/// One chunk plus where it belongs
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkUnit {
    /// Device whose group receives the chunk
    pub device: DeviceId,
    /// The encoded chunk record (measurement, stats, payload)
    pub chunk: EncodedChunk,
}

impl ChunkUnit {
    pub fn new(device: DeviceId, chunk: EncodedChunk) -> Self {
        Self { device, chunk }
    }

    /// Append into the live writer, opening or switching chunk groups as
    /// the device changes
    pub fn apply(&self, writer: &mut DataFileWriter) -> StorageResult<()> {
        if writer.current_device() != Some(&self.device) {
            if writer.current_device().is_some() {
                writer.end_group()?;
            }
            writer.begin_group(&self.device)?;
        }
        writer.append_encoded_chunk(&self.chunk)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        write_u8(w, FLAG_CHUNK)?;
        write_str16(w, self.device.as_str())?;
        self.chunk.write_to(w)?;
        Ok(())
    }
}

/// A tombstone: points to delete, identified by device, measurement, and
/// an inclusive time range
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionUnit {
    /// Device the deletion applies to
    pub device: DeviceId,
    /// Measurement selector; empty selects every measurement of the device
    pub measurement: String,
    /// Inclusive time range of deleted points
    pub range: TimeRange,
}

impl DeletionUnit {
    pub fn new(device: DeviceId, measurement: impl Into<String>, range: TimeRange) -> Self {
        Self {
            device,
            measurement: measurement.into(),
            range,
        }
    }

    /// Whether this deletion selects the given series
    pub fn selects(&self, device: &DeviceId, measurement: &str) -> bool {
        self.device == *device
            && (self.measurement.is_empty() || self.measurement == measurement)
    }

    /// Record as a tombstone on the live writer
    pub fn apply(&self, writer: &mut DataFileWriter) -> StorageResult<()> {
        writer.record_deletion(self.clone());
        Ok(())
    }

    fn write_to<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        write_u8(w, FLAG_DELETION)?;
        write_str16(w, self.device.as_str())?;
        write_str16(w, &self.measurement)?;
        write_i64(w, self.range.start)?;
        write_i64(w, self.range.end)?;
        Ok(())
    }
}

/// A decoded replay unit
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayUnit {
    Chunk(ChunkUnit),
    Deletion(DeletionUnit),
}

impl ReplayUnit {
    /// True for units that modify existing data rather than append new data
    pub fn is_modification(&self) -> bool {
        matches!(self, ReplayUnit::Deletion(_))
    }

    /// Device the unit targets
    pub fn device(&self) -> &DeviceId {
        match self {
            ReplayUnit::Chunk(unit) => &unit.device,
            ReplayUnit::Deletion(unit) => &unit.device,
        }
    }

    /// Size of the unit's variant body: compressed payload bytes for a
    /// chunk, encoded selector + range for a deletion
    pub fn data_size(&self) -> u64 {
        match self {
            ReplayUnit::Chunk(unit) => unit.chunk.payload.len() as u64,
            ReplayUnit::Deletion(unit) => {
                (2 + unit.device.as_str().len() + 2 + unit.measurement.len() + 8 + 8) as u64
            }
        }
    }

    /// Serialize the unit, flag byte first
    pub fn serialize<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        match self {
            ReplayUnit::Chunk(unit) => unit.write_to(w),
            ReplayUnit::Deletion(unit) => unit.write_to(w),
        }
    }

    /// Deserialize one unit
    ///
    /// An unrecognized flag byte is a fatal format error: the stream
    /// cannot be resynchronized past an unknown variant.
    pub fn deserialize<R: Read>(r: &mut R) -> StorageResult<Self> {
        let flag = read_u8(r)?;
        Self::deserialize_body(flag, r)
    }

    /// Deserialize one unit, or None at a clean end of the stream
    pub fn deserialize_opt<R: Read>(r: &mut R) -> StorageResult<Option<Self>> {
        let flag = match read_u8(r) {
            Ok(flag) => flag,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::deserialize_body(flag, r).map(Some)
    }

    fn deserialize_body<R: Read>(flag: u8, r: &mut R) -> StorageResult<Self> {
        match flag {
            FLAG_CHUNK => {
                let device = read_device(r)?;
                let chunk = EncodedChunk::read_from(r)?;
                Ok(ReplayUnit::Chunk(ChunkUnit::new(device, chunk)))
            }
            FLAG_DELETION => {
                let device = read_device(r)?;
                let measurement = read_str16(r)?;
                let start = read_i64(r)?;
                let end = read_i64(r)?;
                let range = TimeRange::try_new(start, end).ok_or_else(|| {
                    StorageError::Corruption(format!(
                        "deletion range is inverted: {} > {}",
                        start, end
                    ))
                })?;
                Ok(ReplayUnit::Deletion(DeletionUnit::new(
                    device,
                    measurement,
                    range,
                )))
            }
            other => Err(StorageError::UnknownUnitFlag(other)),
        }
    }

    /// Replay against a live writer: chunks are appended, deletions become
    /// tombstones
    pub fn apply(&self, writer: &mut DataFileWriter) -> StorageResult<()> {
        match self {
            ReplayUnit::Chunk(unit) => unit.apply(writer),
            ReplayUnit::Deletion(unit) => unit.apply(writer),
        }
    }
}

fn read_device<R: Read>(r: &mut R) -> StorageResult<DeviceId> {
    let device = read_str16(r)?;
    DeviceId::try_new(device)
        .ok_or_else(|| StorageError::Corruption("replay unit device is empty".to_string()))
}

/// Streaming reader over serialized replay units
pub struct UnitReader<R: Read> {
    reader: R,
    units_read: u64,
}

impl<R: Read> UnitReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            units_read: 0,
        }
    }

    pub fn units_read(&self) -> u64 {
        self.units_read
    }
}

impl<R: Read> Iterator for UnitReader<R> {
    type Item = StorageResult<ReplayUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        match ReplayUnit::deserialize_opt(&mut self.reader) {
            Ok(Some(unit)) => {
                self.units_read += 1;
                Some(Ok(unit))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Write a tombstone side file for the given deletions
pub(crate) fn write_tombstone_file(
    path: impl AsRef<Path>,
    units: &[DeletionUnit],
) -> StorageResult<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    for unit in units {
        unit.write_to(&mut writer)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Read a data file's tombstones; a missing side file means none
pub fn read_tombstone_file(path: impl AsRef<Path>) -> StorageResult<Vec<DeletionUnit>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = UnitReader::new(BufReader::new(File::open(path)?));
    let mut units = Vec::new();
    for unit in reader {
        match unit? {
            ReplayUnit::Deletion(unit) => units.push(unit),
            ReplayUnit::Chunk(_) => {
                return Err(StorageError::Corruption(format!(
                    "{} contains a chunk unit",
                    path.display()
                )))
            }
        }
    }
    Ok(units)
}

/// Decompose a sealed data file into replay units: every chunk in group
/// order, then the tombstones from the side file
pub fn extract_units(
    reader: &mut crate::storage::file::DataFileReader,
) -> StorageResult<Vec<ReplayUnit>> {
    let mut units = Vec::new();

    for group_idx in 0..reader.groups().len() {
        let group = reader.read_group(group_idx)?;
        for chunk in group.chunks {
            units.push(ReplayUnit::Chunk(ChunkUnit::new(
                group.device.clone(),
                chunk,
            )));
        }
    }

    let tomb_path = crate::storage::file::tombstone_path(reader.path());
    for deletion in read_tombstone_file(tomb_path)? {
        units.push(ReplayUnit::Deletion(deletion));
    }

    Ok(units)
}
