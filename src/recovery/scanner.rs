//! Data file structure scanner
//!
//! Two independent checks, combined by `scan_file`:
//!
//! 1. Footer validation (`file::read_footer`): follow the tail magic and
//!    footer checksum; if the entries tile the data region exactly, the
//!    whole file is trusted without touching chunk bytes.
//! 2. Forward scan (`GroupWalker`): walk chunk groups from the data region
//!    start, verifying every header field, chunk record, and payload
//!    checksum. Stops at the first structural violation; everything before
//!    it is the valid region.
//!
//! The walker is an iterator with a one-shot completion token: the walk
//! summary (boundary offset, groups walked) appears exactly once, when the
//! iterator exhausts. Callers read the token instead of tracking shared
//! state alongside the iteration.
//!
//! Truncation evidence (EOF-shaped reads, bad checksums, implausible
//! lengths) ends the walk; only genuine I/O failures surface as errors.

use crate::storage::chunk::EncodedChunk;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::{
    read_footer, read_group_header, FileHeader, GroupEntry, FILE_MAGIC, FOOTER_MARKER,
    GROUP_MARKER, HEADER_SIZE,
};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

/// Outcome of scanning one data file
#[derive(Debug)]
pub enum ScanVerdict {
    /// The footer validates; the whole file is intact
    Intact {
        /// Footer entries, in file order
        groups: Vec<GroupEntry>,
    },
    /// The footer is absent or broken; the forward scan found
    /// `valid_len` bytes of complete chunk groups
    Truncated {
        /// Byte length of the valid region (file start through the last
        /// complete group; 0 when even the header is unusable)
        valid_len: u64,
        /// Groups inside the valid region, in file order
        groups: Vec<GroupEntry>,
    },
}

impl ScanVerdict {
    pub fn is_intact(&self) -> bool {
        matches!(self, ScanVerdict::Intact { .. })
    }

    /// Groups in the valid region, in file order
    pub fn groups(&self) -> &[GroupEntry] {
        match self {
            ScanVerdict::Intact { groups } => groups,
            ScanVerdict::Truncated { groups, .. } => groups,
        }
    }
}

/// Completion token of a finished walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkSummary {
    /// File offset one past the last complete chunk group
    pub boundary: u64,
    /// Number of complete groups walked
    pub groups_walked: usize,
    /// The walk ended at a footer marker rather than EOF or garbage
    pub hit_footer: bool,
}

/// Forward iterator over complete chunk groups
///
/// Yields one `GroupEntry` per fully verified group. When iteration ends,
/// the completion token is set exactly once; `summary()` stays `None`
/// while the walk is in progress or after a fatal error.
pub struct GroupWalker<R: Read + Seek> {
    reader: R,
    file_len: u64,
    offset: u64,
    done: Option<WalkSummary>,
    groups_walked: usize,
}

impl<R: Read + Seek> GroupWalker<R> {
    pub fn new(reader: R, file_len: u64) -> Self {
        Self {
            reader,
            file_len,
            offset: HEADER_SIZE as u64,
            done: None,
            groups_walked: 0,
        }
    }

    /// The completion token, once the walk has exhausted
    pub fn summary(&self) -> Option<&WalkSummary> {
        self.done.as_ref()
    }

    pub fn into_summary(self) -> Option<WalkSummary> {
        self.done
    }

    fn finish(&mut self, hit_footer: bool) {
        if self.done.is_none() {
            tracing::debug!(
                boundary = self.offset,
                groups = self.groups_walked,
                hit_footer,
                "group walk finished"
            );
            self.done = Some(WalkSummary {
                boundary: self.offset,
                groups_walked: self.groups_walked,
                hit_footer,
            });
        }
    }

    /// Parse the group starting at `self.offset` (marker already read).
    ///
    /// `Ok(None)` means the bytes are not a complete group: truncation
    /// evidence, not an error.
    fn read_group(&mut self) -> StorageResult<Option<GroupEntry>> {
        let header = match read_group_header(&mut self.reader) {
            Ok(header) => header,
            Err(e) => return structural_or_fatal(e),
        };

        if header.chunk_count == 0 {
            return Ok(None);
        }
        let group_len = header.encoded_len() + header.data_len as u64;
        if self.offset + group_len > self.file_len {
            return Ok(None);
        }

        let mut consumed = 0u64;
        let mut min_timestamp = i64::MAX;
        let mut max_timestamp = i64::MIN;
        for _ in 0..header.chunk_count {
            let chunk = match EncodedChunk::read_from(&mut self.reader) {
                Ok(chunk) => chunk,
                Err(e) => return structural_or_fatal(e),
            };
            consumed += chunk.encoded_len();
            if consumed > header.data_len as u64 {
                return Ok(None);
            }
            min_timestamp = min_timestamp.min(chunk.stats.min_timestamp);
            max_timestamp = max_timestamp.max(chunk.stats.max_timestamp);
        }

        // Chunks must fill the declared extent exactly
        if consumed != header.data_len as u64 {
            return Ok(None);
        }

        Ok(Some(GroupEntry {
            device: header.device,
            offset: self.offset,
            length: group_len,
            min_timestamp,
            max_timestamp,
        }))
    }
}

/// Split structural violations (stop the walk) from fatal I/O errors
fn structural_or_fatal(e: StorageError) -> StorageResult<Option<GroupEntry>> {
    match e {
        StorageError::Io(io) if io.kind() != ErrorKind::UnexpectedEof => {
            Err(StorageError::Io(io))
        }
        _ => Ok(None),
    }
}

impl<R: Read + Seek> Iterator for GroupWalker<R> {
    type Item = StorageResult<GroupEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done.is_some() {
            return None;
        }
        if self.offset >= self.file_len {
            self.finish(false);
            return None;
        }

        if let Err(e) = self.reader.seek(SeekFrom::Start(self.offset)) {
            return Some(Err(e.into()));
        }

        let mut marker = [0u8; 1];
        match self.reader.read_exact(&mut marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.finish(false);
                return None;
            }
            Err(e) => return Some(Err(e.into())),
        }

        match marker[0] {
            GROUP_MARKER => match self.read_group() {
                Ok(Some(entry)) => {
                    self.offset = entry.end_offset();
                    self.groups_walked += 1;
                    Some(Ok(entry))
                }
                Ok(None) => {
                    self.finish(false);
                    None
                }
                Err(e) => Some(Err(e)),
            },
            FOOTER_MARKER => {
                self.finish(true);
                None
            }
            _ => {
                self.finish(false);
                None
            }
        }
    }
}

/// Run the forward scan over an open file
pub fn scan_groups<R: Read + Seek>(
    reader: R,
    file_len: u64,
) -> StorageResult<(Vec<GroupEntry>, WalkSummary)> {
    let mut walker = GroupWalker::new(reader, file_len);
    let mut groups = Vec::new();
    for entry in walker.by_ref() {
        groups.push(entry?);
    }
    match walker.into_summary() {
        Some(summary) => Ok((groups, summary)),
        None => Err(StorageError::Corruption(
            "group walk ended without a completion token".to_string(),
        )),
    }
}

/// Scan one data file: trust the footer when it validates, otherwise fall
/// back to the forward walk
///
/// A wrong magic or a newer format version is fatal: such a file is not
/// ours to repair. A header shorter than `HEADER_SIZE` is treated as an
/// empty valid region (the whole file is a torn write).
pub fn scan_file(path: impl AsRef<Path>) -> StorageResult<ScanVerdict> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    if file_len >= 4 {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != FILE_MAGIC {
            return Err(StorageError::InvalidFile(format!(
                "{}: invalid magic {:?}",
                path.display(),
                magic
            )));
        }
    }
    if file_len < HEADER_SIZE as u64 {
        return Ok(ScanVerdict::Truncated {
            valid_len: 0,
            groups: Vec::new(),
        });
    }

    file.seek(SeekFrom::Start(0))?;
    let mut header_buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_buf)?;
    FileHeader::from_bytes(&header_buf)?;

    if let Some(groups) = read_footer(&mut file, file_len)? {
        return Ok(ScanVerdict::Intact { groups });
    }

    let (groups, summary) = scan_groups(&mut file, file_len)?;
    Ok(ScanVerdict::Truncated {
        valid_len: summary.boundary,
        groups,
    })
}
