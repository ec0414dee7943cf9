//! Data file format for strata storage
//!
//! A data file holds sealed columnar time-series data: a sequence of chunk
//! groups (one device per group, one chunk per measurement), indexed by a
//! footer at the end of the file.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (8 bytes)                        │
//! │   magic: [u8; 4] = "STRA"               │
//! │   version: u16                          │
//! │   reserved: u16                         │
//! ├─────────────────────────────────────────┤
//! │ CHUNK GROUPS (variable)                 │
//! │   For each group:                       │
//! │     marker: u8 = 0x47                   │
//! │     device: u16 len + UTF-8             │
//! │     chunk_count: u16                    │
//! │     data_len: u32                       │
//! │     chunk records (see chunk.rs)        │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   marker: u8 = 0x46                     │
//! │   For each group:                       │
//! │     device: u16 len + UTF-8             │
//! │     offset: u64                         │
//! │     length: u64                         │
//! │     min_ts: i64                         │
//! │     max_ts: i64                         │
//! │   footer_size: u32                      │
//! │   footer_checksum: u32                  │
//! │   tail magic: [u8; 4] = "STRA"          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Group headers are written with placeholder counts and patched when the
//! group ends, so a crash mid-group leaves a header whose declared extent
//! disagrees with the bytes present. Recovery relies on that: a group is
//! valid only if its header, every chunk record, and every chunk checksum
//! can be walked to completion.

use crate::index::TimeRangeIndex;
use crate::storage::chunk::EncodedChunk;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::io::{
    read_i64, read_str16, read_u16, read_u32, read_u64, write_i64, write_str16, write_u16,
    write_u32, write_u64,
};
use crate::storage::replay::{write_tombstone_file, DeletionUnit};
use crate::storage::types::{DeviceId, Point, TimeRange};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the head and tail of every data file
pub const FILE_MAGIC: [u8; 4] = *b"STRA";

/// Current data file format version
pub const FILE_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 8;

/// First byte of every chunk group
pub const GROUP_MARKER: u8 = 0x47;

/// First byte of the footer
pub const FOOTER_MARKER: u8 = 0x46;

/// Fixed tail: footer_size u32 + footer_checksum u32 + tail magic
pub const FILE_TAIL_SIZE: usize = 12;

/// Upper bound on the footer region; larger size words are corrupt
const MAX_FOOTER_SIZE: u32 = 64 * 1024 * 1024;

/// Extension of data files discovered by the engine
pub const DATA_FILE_EXT: &str = "tsd";

/// Suffix appended to a data file's name for its companion index
pub const RANGES_SUFFIX: &str = ".ranges";

/// Suffix appended to a data file's name for its tombstone file
pub const TOMBSTONE_SUFFIX: &str = ".tomb";

/// Companion index path for a data file (`x.tsd` -> `x.tsd.ranges`)
pub fn ranges_path(data_file: &Path) -> PathBuf {
    let mut name = data_file.as_os_str().to_os_string();
    name.push(RANGES_SUFFIX);
    PathBuf::from(name)
}

/// Tombstone path for a data file (`x.tsd` -> `x.tsd.tomb`)
pub fn tombstone_path(data_file: &Path) -> PathBuf {
    let mut name = data_file.as_os_str().to_os_string();
    name.push(TOMBSTONE_SUFFIX);
    PathBuf::from(name)
}

/// Data file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version
    pub version: u16,
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            version: FILE_VERSION,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        // bytes 6-7 reserved
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> StorageResult<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != FILE_MAGIC {
            return Err(StorageError::InvalidFile(format!(
                "invalid magic: {:?}",
                magic
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > FILE_VERSION {
            return Err(StorageError::InvalidFile(format!(
                "unsupported version: {}",
                version
            )));
        }

        Ok(Self { version })
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Footer entry describing one chunk group
///
/// The forward scanner produces the same shape, so a repaired file's fresh
/// footer is built directly from scan results.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    /// Device that owns the group
    pub device: DeviceId,
    /// Offset of the group's marker byte from the start of the file
    pub offset: u64,
    /// Total group length in bytes, header included
    pub length: u64,
    /// Smallest timestamp across the group's chunks
    pub min_timestamp: i64,
    /// Largest timestamp across the group's chunks
    pub max_timestamp: i64,
}

impl GroupEntry {
    /// Offset of the first byte after the group
    pub fn end_offset(&self) -> u64 {
        self.offset + self.length
    }

    /// Inclusive time span covered by the group
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.min_timestamp, self.max_timestamp)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        write_str16(w, self.device.as_str())?;
        write_u64(w, self.offset)?;
        write_u64(w, self.length)?;
        write_i64(w, self.min_timestamp)?;
        write_i64(w, self.max_timestamp)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> StorageResult<Self> {
        let device = read_str16(r)?;
        let device = DeviceId::try_new(device)
            .ok_or_else(|| StorageError::Corruption("empty device in footer entry".to_string()))?;
        Ok(Self {
            device,
            offset: read_u64(r)?,
            length: read_u64(r)?,
            min_timestamp: read_i64(r)?,
            max_timestamp: read_i64(r)?,
        })
    }
}

/// Parsed chunk group header (marker byte already consumed)
#[derive(Debug, Clone)]
pub(crate) struct GroupHeader {
    pub device: DeviceId,
    pub chunk_count: u16,
    pub data_len: u32,
}

impl GroupHeader {
    /// On-disk size of the header, marker byte included
    pub fn encoded_len(&self) -> u64 {
        (1 + 2 + self.device.as_str().len() + 2 + 4) as u64
    }
}

pub(crate) fn read_group_header<R: Read>(r: &mut R) -> StorageResult<GroupHeader> {
    let device = read_str16(r)?;
    let device = DeviceId::try_new(device)
        .ok_or_else(|| StorageError::Corruption("empty device in group header".to_string()))?;
    let chunk_count = read_u16(r)?;
    let data_len = read_u32(r)?;
    Ok(GroupHeader {
        device,
        chunk_count,
        data_len,
    })
}

/// Write the footer (entries, size, checksum, tail magic) for the given
/// groups. Returns the number of bytes written.
pub(crate) fn write_footer<W: Write>(w: &mut W, groups: &[GroupEntry]) -> StorageResult<u64> {
    let mut footer_data = Vec::with_capacity(1 + groups.len() * 48);
    footer_data.push(FOOTER_MARKER);
    for group in groups {
        group.write_to(&mut footer_data)?;
    }

    let checksum = crc32fast::hash(&footer_data);

    w.write_all(&footer_data)?;
    write_u32(w, footer_data.len() as u32)?;
    write_u32(w, checksum)?;
    w.write_all(&FILE_MAGIC)?;

    Ok(footer_data.len() as u64 + FILE_TAIL_SIZE as u64)
}

/// Follow the footer from the end of the file.
///
/// Returns `Ok(Some(entries))` only when the tail magic, footer checksum,
/// and entry layout all validate and the entries tile the data region
/// exactly (first at the header end, each starting where the previous
/// ended, the last ending at the footer start). Any structural problem is
/// `Ok(None)`; only genuine I/O failures are errors.
pub(crate) fn read_footer<R: Read + Seek>(
    r: &mut R,
    file_len: u64,
) -> StorageResult<Option<Vec<GroupEntry>>> {
    // Smallest sealed file: header + empty footer (marker only) + tail
    if file_len < (HEADER_SIZE + 1 + FILE_TAIL_SIZE) as u64 {
        return Ok(None);
    }

    r.seek(SeekFrom::End(-(FILE_TAIL_SIZE as i64)))?;
    let footer_size = read_u32(r)?;
    let stored_checksum = read_u32(r)?;
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;

    if magic != FILE_MAGIC {
        return Ok(None);
    }
    if footer_size == 0 || footer_size > MAX_FOOTER_SIZE {
        return Ok(None);
    }
    let footer_start = match file_len.checked_sub(FILE_TAIL_SIZE as u64 + footer_size as u64) {
        Some(start) if start >= HEADER_SIZE as u64 => start,
        _ => return Ok(None),
    };

    r.seek(SeekFrom::Start(footer_start))?;
    let mut footer_data = vec![0u8; footer_size as usize];
    r.read_exact(&mut footer_data)?;

    if crc32fast::hash(&footer_data) != stored_checksum {
        return Ok(None);
    }
    if footer_data[0] != FOOTER_MARKER {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&footer_data[1..]);
    let entries_len = (footer_size - 1) as u64;
    let mut entries = Vec::new();
    while cursor.position() < entries_len {
        match GroupEntry::read_from(&mut cursor) {
            Ok(entry) => entries.push(entry),
            Err(_) => return Ok(None),
        }
    }

    // Entries must tile the data region exactly
    let mut expected = HEADER_SIZE as u64;
    for entry in &entries {
        if entry.offset != expected || entry.length == 0 {
            return Ok(None);
        }
        expected = entry.end_offset();
    }
    if expected != footer_start {
        return Ok(None);
    }

    Ok(Some(entries))
}

/// State of the chunk group currently being written
struct OpenGroup {
    device: DeviceId,
    start_offset: u64,
    header_len: u64,
    chunk_count: u16,
    data_len: u64,
    min_timestamp: i64,
    max_timestamp: i64,
}

/// Writer for a new data file
///
/// Groups are opened, filled with chunks, and closed; `seal` writes the
/// footer, fsyncs, flushes tombstones, and hands back the accumulated
/// time-range index for the caller to persist as the companion file.
/// Dropping the writer without sealing leaves a torn file, which is
/// exactly what recovery exists to repair.
pub struct DataFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    groups: Vec<GroupEntry>,
    ranges: TimeRangeIndex,
    tombstones: Vec<DeletionUnit>,
    current: Option<OpenGroup>,
}

impl DataFileWriter {
    /// Create a new data file, writing the header
    pub fn create(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(&FileHeader::new().to_bytes())?;

        Ok(Self {
            path,
            writer,
            offset: HEADER_SIZE as u64,
            groups: Vec::new(),
            ranges: TimeRangeIndex::new(),
            tombstones: Vec::new(),
            current: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Groups closed so far
    pub fn groups(&self) -> &[GroupEntry] {
        &self.groups
    }

    /// Device of the currently open group, if any
    pub fn current_device(&self) -> Option<&DeviceId> {
        self.current.as_ref().map(|g| &g.device)
    }

    /// Start a chunk group for a device
    ///
    /// The header is written with placeholder counts and patched by
    /// `end_group`.
    pub fn begin_group(&mut self, device: &DeviceId) -> StorageResult<()> {
        if let Some(open) = &self.current {
            return Err(StorageError::WriterState(format!(
                "chunk group for '{}' is still open",
                open.device
            )));
        }

        let start_offset = self.offset;
        self.writer.write_all(&[GROUP_MARKER])?;
        write_str16(&mut self.writer, device.as_str())?;
        write_u16(&mut self.writer, 0)?;
        write_u32(&mut self.writer, 0)?;

        let header_len = (1 + 2 + device.as_str().len() + 2 + 4) as u64;
        self.offset += header_len;
        self.current = Some(OpenGroup {
            device: device.clone(),
            start_offset,
            header_len,
            chunk_count: 0,
            data_len: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
        });

        Ok(())
    }

    /// Encode and append one measurement series into the open group
    pub fn write_series(&mut self, measurement: &str, points: &[Point]) -> StorageResult<()> {
        let chunk = EncodedChunk::encode(measurement, points)?;
        self.append_encoded_chunk(&chunk)
    }

    /// Append an already-encoded chunk into the open group (replay path)
    pub fn append_encoded_chunk(&mut self, chunk: &EncodedChunk) -> StorageResult<()> {
        let group = self
            .current
            .as_mut()
            .ok_or_else(|| StorageError::WriterState("no open chunk group".to_string()))?;

        if group.chunk_count == u16::MAX {
            return Err(StorageError::WriterState(
                "too many chunks in one group".to_string(),
            ));
        }
        if group.data_len + chunk.encoded_len() > u32::MAX as u64 {
            return Err(StorageError::WriterState(
                "chunk group data exceeds u32 length field".to_string(),
            ));
        }

        let written = chunk.write_to(&mut self.writer)?;
        group.chunk_count += 1;
        group.data_len += written;
        group.min_timestamp = group.min_timestamp.min(chunk.stats.min_timestamp);
        group.max_timestamp = group.max_timestamp.max(chunk.stats.max_timestamp);
        self.offset += written;

        Ok(())
    }

    /// Close the open group, patching its header with final counts
    pub fn end_group(&mut self) -> StorageResult<()> {
        let group = self
            .current
            .take()
            .ok_or_else(|| StorageError::WriterState("no open chunk group".to_string()))?;

        if group.chunk_count == 0 {
            return Err(StorageError::WriterState(
                "chunk group must contain at least one chunk".to_string(),
            ));
        }

        // Patch chunk_count + data_len in the group header
        self.writer.flush()?;
        let patch_pos = group.start_offset + 1 + 2 + group.device.as_str().len() as u64;
        self.writer.seek(SeekFrom::Start(patch_pos))?;
        write_u16(&mut self.writer, group.chunk_count)?;
        write_u32(&mut self.writer, group.data_len as u32)?;
        self.writer.seek(SeekFrom::Start(self.offset))?;

        self.ranges
            .update_start_time(&group.device, group.min_timestamp);
        self.ranges
            .update_end_time(&group.device, group.max_timestamp);

        self.groups.push(GroupEntry {
            device: group.device,
            offset: group.start_offset,
            length: group.header_len + group.data_len,
            min_timestamp: group.min_timestamp,
            max_timestamp: group.max_timestamp,
        });

        Ok(())
    }

    /// Write one device's measurements as a single chunk group
    pub fn write_group<S, P>(&mut self, device: &DeviceId, series: &[(S, P)]) -> StorageResult<()>
    where
        S: AsRef<str>,
        P: AsRef<[Point]>,
    {
        self.begin_group(device)?;
        for (measurement, points) in series {
            self.write_series(measurement.as_ref(), points.as_ref())?;
        }
        self.end_group()
    }

    /// Record a deletion; flushed to the tombstone file on seal
    pub fn record_deletion(&mut self, unit: DeletionUnit) {
        self.tombstones.push(unit);
    }

    /// Seal the file: close any open group, write footer + tail magic,
    /// fsync, flush tombstones. Returns the accumulated time-range index;
    /// persisting it as the companion file is the caller's job.
    pub fn seal(mut self) -> StorageResult<TimeRangeIndex> {
        if self.current.is_some() {
            self.end_group()?;
        }

        write_footer(&mut self.writer, &self.groups)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        if !self.tombstones.is_empty() {
            write_tombstone_file(&tombstone_path(&self.path), &self.tombstones)?;
        }

        Ok(self.ranges)
    }
}

/// One decoded chunk group
#[derive(Debug, Clone)]
pub struct ChunkGroup {
    pub device: DeviceId,
    pub chunks: Vec<EncodedChunk>,
}

/// Reader for a sealed data file
///
/// Opening trusts the footer; a file whose footer does not validate must
/// go through recovery first.
pub struct DataFileReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: FileHeader,
    groups: Vec<GroupEntry>,
}

impl DataFileReader {
    /// Open a sealed data file
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header_buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_buf)?;
        let header = FileHeader::from_bytes(&header_buf)?;

        let groups = read_footer(&mut reader, file_len)?.ok_or_else(|| {
            StorageError::InvalidFile(format!(
                "{} has a missing or invalid footer; run recovery",
                path.display()
            ))
        })?;

        Ok(Self {
            path,
            reader,
            header,
            groups,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Footer entries, in file order
    pub fn groups(&self) -> &[GroupEntry] {
        &self.groups
    }

    /// Devices present in the file, with duplicates for multi-group devices
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.groups.iter().map(|g| &g.device)
    }

    /// Read and verify one chunk group
    pub fn read_group(&mut self, group_idx: usize) -> StorageResult<ChunkGroup> {
        let entry = self.groups.get(group_idx).cloned().ok_or_else(|| {
            StorageError::InvalidFile(format!("group index out of range: {}", group_idx))
        })?;

        self.reader.seek(SeekFrom::Start(entry.offset))?;

        let mut marker = [0u8; 1];
        self.reader.read_exact(&mut marker)?;
        if marker[0] != GROUP_MARKER {
            return Err(StorageError::Corruption(format!(
                "group {} has marker {:#04x}",
                group_idx, marker[0]
            )));
        }

        let header = read_group_header(&mut self.reader)?;
        if header.device != entry.device {
            return Err(StorageError::Corruption(format!(
                "group {} device mismatch: footer says '{}', header says '{}'",
                group_idx, entry.device, header.device
            )));
        }

        let mut chunks = Vec::with_capacity(header.chunk_count as usize);
        for _ in 0..header.chunk_count {
            chunks.push(EncodedChunk::read_from(&mut self.reader)?);
        }

        Ok(ChunkGroup {
            device: header.device,
            chunks,
        })
    }
}
