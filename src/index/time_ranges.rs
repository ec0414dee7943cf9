//! Per-device time-range index
//!
//! The in-memory form of a data file's companion index. Maps each device to
//! the inclusive `[start, end]` span of its data in the file; updates widen,
//! never narrow. Queries consult the index to skip files without opening
//! them, so a recovered file must always carry a faithful companion.
//!
//! Companion file format (little-endian, no count prefix, no trailer):
//! ```text
//! For each device:
//!   device: u32 len + UTF-8
//!   start:  i64
//!   end:    i64
//! ```
//! A zero-length file is an empty index. Anything that does not parse as a
//! whole number of well-formed tuples is corrupt; the caller rebuilds from
//! chunk statistics instead of failing recovery.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::GroupEntry;
use crate::storage::io::{read_i64, read_u8, write_i64, write_str32, MAX_STR_LEN};
use crate::storage::types::{DeviceId, TimeRange};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

/// Tracked bounds for one device
///
/// Starts at the empty sentinel; each update pulls one side toward the
/// observed timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
struct DeviceRange {
    start: i64,
    end: i64,
}

impl DeviceRange {
    const EMPTY: Self = Self {
        start: i64::MAX,
        end: i64::MIN,
    };
}

/// Per-device inclusive time bounds for one data file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeRangeIndex {
    ranges: BTreeMap<DeviceId, DeviceRange>,
}

impl TimeRangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from scanned chunk-group entries
    pub fn rebuild_from(groups: &[GroupEntry]) -> Self {
        let mut index = Self::new();
        for group in groups {
            index.update_group(group);
        }
        index
    }

    /// Widen a device's start bound toward `timestamp`
    pub fn update_start_time(&mut self, device: &DeviceId, timestamp: i64) {
        let entry = self
            .ranges
            .entry(device.clone())
            .or_insert(DeviceRange::EMPTY);
        entry.start = entry.start.min(timestamp);
    }

    /// Widen a device's end bound toward `timestamp`
    pub fn update_end_time(&mut self, device: &DeviceId, timestamp: i64) {
        let entry = self
            .ranges
            .entry(device.clone())
            .or_insert(DeviceRange::EMPTY);
        entry.end = entry.end.max(timestamp);
    }

    /// Fold one chunk group's bounds into the index
    pub fn update_group(&mut self, group: &GroupEntry) {
        self.update_start_time(&group.device, group.min_timestamp);
        self.update_end_time(&group.device, group.max_timestamp);
    }

    /// Recorded start bound, if the device has been observed
    pub fn start_time(&self, device: &DeviceId) -> Option<i64> {
        self.ranges
            .get(device)
            .and_then(|r| (r.start != i64::MAX).then_some(r.start))
    }

    /// Recorded end bound, if the device has been observed
    pub fn end_time(&self, device: &DeviceId) -> Option<i64> {
        self.ranges
            .get(device)
            .and_then(|r| (r.end != i64::MIN).then_some(r.end))
    }

    /// Full recorded range, if both bounds have been observed
    pub fn time_range(&self, device: &DeviceId) -> Option<TimeRange> {
        let range = self.ranges.get(device)?;
        TimeRange::try_new(range.start, range.end)
    }

    /// Devices with at least one recorded bound
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.ranges.keys()
    }

    /// Iterate fully-observed device ranges in device order
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, TimeRange)> {
        self.ranges
            .iter()
            .filter_map(|(device, r)| TimeRange::try_new(r.start, r.end).map(|tr| (device, tr)))
    }

    pub fn device_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True when every scanned group's bounds fall inside the recorded
    /// bounds. A false result means the companion disagrees with the file
    /// and must be rebuilt; the file is authoritative.
    pub fn covers(&self, groups: &[GroupEntry]) -> bool {
        groups.iter().all(|group| {
            match (self.start_time(&group.device), self.end_time(&group.device)) {
                (Some(start), Some(end)) => {
                    start <= group.min_timestamp && end >= group.max_timestamp
                }
                _ => false,
            }
        })
    }

    /// Serialize in the companion format
    pub fn serialize<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        for (device, range) in &self.ranges {
            write_str32(w, device.as_str())?;
            write_i64(w, range.start)?;
            write_i64(w, range.end)?;
        }
        Ok(())
    }

    /// Deserialize from the companion format
    ///
    /// Every failure mode (truncated tuple, garbage length, invalid UTF-8,
    /// inverted bounds) comes back as `Corruption` so recovery can treat
    /// it as "rebuild", never as fatal.
    pub fn deserialize<R: Read>(r: &mut R) -> StorageResult<Self> {
        fn truncated(e: std::io::Error) -> StorageError {
            if e.kind() == ErrorKind::UnexpectedEof {
                StorageError::Corruption("companion index truncated mid-entry".to_string())
            } else {
                StorageError::Io(e)
            }
        }

        let mut index = Self::new();
        loop {
            // EOF before a tuple starts is the clean end of the file
            let first = match read_u8(r) {
                Ok(b) => b,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let mut rest = [0u8; 3];
            r.read_exact(&mut rest).map_err(truncated)?;
            let len = u32::from_le_bytes([first, rest[0], rest[1], rest[2]]) as usize;

            if len == 0 || len > MAX_STR_LEN {
                return Err(StorageError::Corruption(format!(
                    "companion index device length {} is implausible",
                    len
                )));
            }

            let mut name = vec![0u8; len];
            r.read_exact(&mut name).map_err(truncated)?;
            let device = String::from_utf8(name).map_err(|_| {
                StorageError::Corruption("companion index device is not valid UTF-8".to_string())
            })?;
            let device = DeviceId::try_new(device).ok_or_else(|| {
                StorageError::Corruption("companion index device is empty".to_string())
            })?;

            let start = read_i64(r).map_err(truncated)?;
            let end = read_i64(r).map_err(truncated)?;
            if start > end {
                return Err(StorageError::Corruption(format!(
                    "companion index range for '{}' is inverted: {} > {}",
                    device, start, end
                )));
            }

            index.update_start_time(&device, start);
            index.update_end_time(&device, end);
        }

        Ok(index)
    }

    /// Load a companion file
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        Self::deserialize(&mut reader)
    }

    /// Persist as a companion file
    ///
    /// Written to a temporary sibling and renamed into place, so a crash
    /// mid-write never leaves a half-written companion under the real name.
    pub fn save(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let path = path.as_ref();
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);

        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            self.serialize(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn group(device: &str, offset: u64, min_ts: i64, max_ts: i64) -> GroupEntry {
        GroupEntry {
            device: DeviceId::new(device),
            offset,
            length: 64,
            min_timestamp: min_ts,
            max_timestamp: max_ts,
        }
    }

    #[test]
    fn test_widen_never_narrow() {
        let device = DeviceId::new("d1");
        let mut index = TimeRangeIndex::new();

        index.update_start_time(&device, 500);
        index.update_end_time(&device, 900);
        assert_eq!(index.start_time(&device), Some(500));
        assert_eq!(index.end_time(&device), Some(900));

        // Narrower updates are ignored
        index.update_start_time(&device, 700);
        index.update_end_time(&device, 800);
        assert_eq!(index.start_time(&device), Some(500));
        assert_eq!(index.end_time(&device), Some(900));

        // Wider updates take effect
        index.update_start_time(&device, 100);
        index.update_end_time(&device, 2000);
        assert_eq!(index.time_range(&device), Some(TimeRange::new(100, 2000)));
    }

    #[test]
    fn test_unknown_device() {
        let index = TimeRangeIndex::new();
        let device = DeviceId::new("nowhere");
        assert_eq!(index.start_time(&device), None);
        assert_eq!(index.end_time(&device), None);
        assert_eq!(index.time_range(&device), None);
    }

    #[test]
    fn test_half_observed_device() {
        let device = DeviceId::new("d1");
        let mut index = TimeRangeIndex::new();
        index.update_start_time(&device, 42);

        assert_eq!(index.start_time(&device), Some(42));
        assert_eq!(index.end_time(&device), None);
        assert_eq!(index.time_range(&device), None);
    }

    #[test]
    fn test_serialized_bytes_are_exact() {
        let mut index = TimeRangeIndex::new();
        let device = DeviceId::new("d1");
        index.update_start_time(&device, 1);
        index.update_end_time(&device, 2);

        let mut buf = Vec::new();
        index.serialize(&mut buf).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"d1");
        expected.extend_from_slice(&1i64.to_le_bytes());
        expected.extend_from_slice(&2i64.to_le_bytes());
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let mut index = TimeRangeIndex::new();
        for (name, start, end) in [("a.1", -5i64, 10i64), ("b.2", 100, 200)] {
            let device = DeviceId::new(name);
            index.update_start_time(&device, start);
            index.update_end_time(&device, end);
        }

        let mut buf = Vec::new();
        index.serialize(&mut buf).unwrap();
        let restored = TimeRangeIndex::deserialize(&mut Cursor::new(buf)).unwrap();

        assert_eq!(restored, index);
    }

    #[test]
    fn test_deserialize_empty_is_empty_index() {
        let index = TimeRangeIndex::deserialize(&mut Cursor::new(Vec::new())).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        // A single stray byte cannot be a tuple
        let err = TimeRangeIndex::deserialize(&mut Cursor::new(vec![1u8])).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));

        // Implausible length word
        let err =
            TimeRangeIndex::deserialize(&mut Cursor::new(vec![0xFF, 0xFF, 0xFF, 0xFF, 0x61]))
                .unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_deserialize_rejects_truncated_tuple() {
        let mut index = TimeRangeIndex::new();
        let device = DeviceId::new("d1");
        index.update_start_time(&device, 1);
        index.update_end_time(&device, 2);

        let mut buf = Vec::new();
        index.serialize(&mut buf).unwrap();
        buf.truncate(buf.len() - 4);

        let err = TimeRangeIndex::deserialize(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_deserialize_rejects_inverted_range() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(b"d1");
        buf.extend_from_slice(&9i64.to_le_bytes());
        buf.extend_from_slice(&3i64.to_le_bytes());

        let err = TimeRangeIndex::deserialize(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_covers() {
        let mut index = TimeRangeIndex::new();
        let d1 = DeviceId::new("d1");
        index.update_start_time(&d1, 1);
        index.update_end_time(&d1, 10);

        assert!(index.covers(&[group("d1", 8, 2, 9)]));
        assert!(index.covers(&[group("d1", 8, 1, 10)]));

        // Group wider than the recorded range
        assert!(!index.covers(&[group("d1", 8, 0, 9)]));
        assert!(!index.covers(&[group("d1", 8, 2, 11)]));

        // Device missing from the index
        assert!(!index.covers(&[group("d2", 8, 2, 9)]));

        // Empty group set is trivially covered
        assert!(index.covers(&[]));
    }

    #[test]
    fn test_rebuild_from_groups_merges_devices() {
        let index = TimeRangeIndex::rebuild_from(&[
            group("d1", 8, 1, 2),
            group("d2", 100, 3, 3),
            group("d2", 200, 4, 4),
        ]);

        assert_eq!(index.device_count(), 2);
        assert_eq!(
            index.time_range(&DeviceId::new("d2")),
            Some(TimeRange::new(3, 4))
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.tsd.ranges");

        let mut index = TimeRangeIndex::new();
        let device = DeviceId::new("plant.line1");
        index.update_start_time(&device, 1000);
        index.update_end_time(&device, 9000);

        index.save(&path).unwrap();
        let restored = TimeRangeIndex::load(&path).unwrap();

        assert_eq!(restored, index);
        // The temporary sibling is renamed away
        assert!(!dir.path().join("000001.tsd.ranges.tmp").exists());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = TimeRangeIndex::load(dir.path().join("absent.ranges")).unwrap_err();
        match err {
            StorageError::Io(e) => assert_eq!(e.kind(), ErrorKind::NotFound),
            other => panic!("expected Io error, got {:?}", other),
        }
    }
}
