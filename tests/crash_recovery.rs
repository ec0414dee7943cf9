//! End-to-end crash recovery scenarios
//!
//! Each test builds a sealed data file, damages it the way an unclean
//! shutdown would, then recovers and checks the file is query-ready.

use std::path::{Path, PathBuf};

use tempfile::tempdir;

use strata::recovery::{RecoveryPerformer, RecoveryState};
use strata::storage::{
    decompress_points, ranges_path, read_tombstone_file, tombstone_path, DataFileReader,
    DataFileWriter, DeletionUnit, DeviceId, EngineConfig, GroupEntry, Point, StorageEngine,
    TimeRange,
};
use strata::TimeRangeIndex;

fn points(ts: &[i64]) -> Vec<Point> {
    ts.iter().map(|&t| Point::new(t, t as f64 * 1.5)).collect()
}

/// The reference fixture: D1 with points at t=1,2 and D2 with points at
/// t=3 and t=4 written as two separately flushed groups.
fn write_reference_file(path: &Path, with_companion: bool) -> Vec<GroupEntry> {
    let mut writer = DataFileWriter::create(path).unwrap();
    let d1 = DeviceId::new("plant.d1");
    let d2 = DeviceId::new("plant.d2");
    writer.write_group(&d1, &[("flow", points(&[1, 2]))]).unwrap();
    writer.write_group(&d2, &[("flow", points(&[3]))]).unwrap();
    writer.write_group(&d2, &[("flow", points(&[4]))]).unwrap();
    let groups = writer.groups().to_vec();
    let index = writer.seal().unwrap();
    if with_companion {
        index.save(ranges_path(path)).unwrap();
    }
    groups
}

fn device_range(index: &TimeRangeIndex, device: &str) -> TimeRange {
    index.time_range(&DeviceId::new(device)).unwrap()
}

fn truncate_to(path: &Path, len: u64) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
}

#[test]
fn test_complete_file_with_companion_recovers_clean() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ref.tsd");
    write_reference_file(&path, true);
    let before = std::fs::read(&path).unwrap();

    let mut performer = RecoveryPerformer::new(&path);
    let outcome = performer.recover().unwrap();

    assert!(!outcome.has_crashed);
    assert!(!outcome.can_write);
    assert!(!performer.was_repaired());

    let index = performer.index().unwrap();
    assert_eq!(device_range(index, "plant.d1"), TimeRange::new(1, 2));
    assert_eq!(device_range(index, "plant.d2"), TimeRange::new(3, 4));

    // Neither the data file nor the companion was rewritten
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_truncation_inside_second_d2_group() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ref.tsd");
    let groups = write_reference_file(&path, true);

    // Cut strictly inside D2's second group: only t=3 survives
    truncate_to(&path, groups[2].offset + groups[2].length / 2);

    let mut performer = RecoveryPerformer::new(&path);
    let outcome = performer.recover().unwrap();

    assert!(outcome.has_crashed);
    assert!(!outcome.can_write);

    let index = performer.index().unwrap();
    assert_eq!(device_range(index, "plant.d1"), TimeRange::new(1, 2));
    assert_eq!(device_range(index, "plant.d2"), TimeRange::new(3, 3));

    // The file is a readable sealed file again, with exactly one chunk
    // left for D2, ending at t=3
    let mut reader = DataFileReader::open(&path).unwrap();
    assert_eq!(reader.groups().len(), 2);
    let d2_group = reader.read_group(1).unwrap();
    assert_eq!(d2_group.device.as_str(), "plant.d2");
    assert_eq!(d2_group.chunks.len(), 1);
    let survivors = decompress_points(&d2_group.chunks[0].payload).unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].timestamp, 3);

    // The rewritten companion agrees with the index
    let reloaded = TimeRangeIndex::load(ranges_path(&path)).unwrap();
    assert_eq!(device_range(&reloaded, "plant.d2"), TimeRange::new(3, 3));
}

#[test]
fn test_missing_companion_rebuilds_exact_ranges() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ref.tsd");
    write_reference_file(&path, false);

    let mut performer = RecoveryPerformer::new(&path);
    let outcome = performer.recover().unwrap();

    assert!(!outcome.has_crashed);
    assert!(performer.was_repaired());

    let reloaded = TimeRangeIndex::load(ranges_path(&path)).unwrap();
    assert_eq!(reloaded.device_count(), 2);
    assert_eq!(device_range(&reloaded, "plant.d1"), TimeRange::new(1, 2));
    assert_eq!(device_range(&reloaded, "plant.d2"), TimeRange::new(3, 4));
}

#[test]
fn test_garbage_companion_rewritten_without_crash() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ref.tsd");
    write_reference_file(&path, true);

    // A single garbage byte cannot deserialize
    std::fs::write(ranges_path(&path), [0xA5]).unwrap();

    let mut performer = RecoveryPerformer::new(&path);
    let outcome = performer.recover().unwrap();

    assert!(!outcome.has_crashed);
    assert!(performer.was_repaired());

    let reloaded = TimeRangeIndex::load(ranges_path(&path)).unwrap();
    assert_eq!(device_range(&reloaded, "plant.d1"), TimeRange::new(1, 2));
    assert_eq!(device_range(&reloaded, "plant.d2"), TimeRange::new(3, 4));
}

#[test]
fn test_recover_twice_returns_same_outcome() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ref.tsd");
    let groups = write_reference_file(&path, true);
    truncate_to(&path, groups[2].offset + 1);

    let mut performer = RecoveryPerformer::new(&path);
    let first = performer.recover().unwrap();
    let bytes_after_first = std::fs::read(&path).unwrap();

    let second = performer.recover().unwrap();
    assert_eq!(first, second);
    assert_eq!(performer.state(), RecoveryState::Finalized);
    assert_eq!(std::fs::read(&path).unwrap(), bytes_after_first);

    // A fresh pass over the repaired file finds it clean
    let mut fresh = RecoveryPerformer::new(&path);
    let outcome = fresh.recover().unwrap();
    assert!(!outcome.has_crashed);
    assert!(!fresh.was_repaired());
}

/// Cut the reference file at every byte offset short of its full length;
/// recovery must always produce a readable sealed file holding exactly
/// the groups that were complete before the cut.
#[test]
fn test_truncation_offset_sweep() {
    let dir = tempdir().unwrap();
    let master = dir.path().join("master.tsd");
    let groups = write_reference_file(&master, false);
    let bytes = std::fs::read(&master).unwrap();

    let header_end = groups[0].offset;

    for cut in 0..bytes.len() as u64 {
        let path = dir.path().join(format!("cut_{}.tsd", cut));
        std::fs::write(&path, &bytes[..cut as usize]).unwrap();

        let expected_groups = groups.iter().filter(|g| g.end_offset() <= cut).count();
        let expected_valid = if cut < header_end {
            0
        } else {
            groups
                .iter()
                .map(GroupEntry::end_offset)
                .filter(|&end| end <= cut)
                .max()
                .unwrap_or(header_end)
        };

        let mut performer = RecoveryPerformer::new(&path);
        let outcome = performer
            .recover()
            .unwrap_or_else(|e| panic!("recovery failed at cut {}: {}", cut, e));

        assert_eq!(
            outcome.has_crashed,
            expected_valid < cut,
            "has_crashed mismatch at cut {}",
            cut
        );

        let reader = DataFileReader::open(&path)
            .unwrap_or_else(|e| panic!("repaired file unreadable at cut {}: {}", cut, e));
        assert_eq!(
            reader.groups().len(),
            expected_groups,
            "surviving group count mismatch at cut {}",
            cut
        );
    }
}

#[test]
fn test_header_only_file_reseals_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.tsd");

    {
        DataFileWriter::create(&path).unwrap();
        // Dropped before any group or footer was written
    }

    let mut performer = RecoveryPerformer::new(&path);
    let outcome = performer.recover().unwrap();

    assert!(!outcome.has_crashed);
    assert!(performer.index().unwrap().is_empty());

    let reader = DataFileReader::open(&path).unwrap();
    assert!(reader.groups().is_empty());
}

#[test]
fn test_tombstones_survive_repair() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tomb.tsd");

    let groups = {
        let mut writer = DataFileWriter::create(&path).unwrap();
        let d1 = DeviceId::new("plant.d1");
        writer.write_group(&d1, &[("flow", points(&[1, 2]))]).unwrap();
        writer.write_group(&d1, &[("flow", points(&[5, 6]))]).unwrap();
        let groups = writer.groups().to_vec();
        writer.record_deletion(DeletionUnit::new(d1.clone(), "flow", TimeRange::new(1, 1)));
        writer.seal().unwrap();
        groups
    };

    truncate_to(&path, groups[1].offset + 2);

    let mut performer = RecoveryPerformer::new(&path);
    let outcome = performer.recover().unwrap();
    assert!(outcome.has_crashed);

    // The deletion side file is untouched by data file repair
    let tombstones = read_tombstone_file(tombstone_path(&path)).unwrap();
    assert_eq!(tombstones.len(), 1);
    assert!(tombstones[0].selects(&DeviceId::new("plant.d1"), "flow"));
    assert!(tombstones[0].range.contains(1));
}

#[tokio::test]
async fn test_engine_recovers_mixed_directory() {
    let dir = tempdir().unwrap();

    // One clean file, one torn mid-group, one sealed but footerless
    let clean = dir.path().join("clean.tsd");
    write_reference_file(&clean, true);

    let torn = dir.path().join("torn.tsd");
    let torn_groups = write_reference_file(&torn, true);
    truncate_to(&torn, torn_groups[2].offset + 3);

    let footerless = dir.path().join("footerless.tsd");
    {
        let mut writer = DataFileWriter::create(&footerless).unwrap();
        writer
            .write_group(&DeviceId::new("plant.d9"), &[("flow", points(&[70, 80]))])
            .unwrap();
        // Dropped without seal
    }

    let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();

    let report = engine.report();
    assert_eq!(report.total(), 3);
    assert_eq!(report.clean_count(), 1);
    assert_eq!(report.repaired_count(), 2);
    assert_eq!(report.crashed_count(), 1);
    assert_eq!(report.failed_count(), 0);

    // Ranges from all three files are served
    assert_eq!(
        engine.device_time_bounds(&DeviceId::new("plant.d1")).unwrap(),
        TimeRange::new(1, 2)
    );
    assert_eq!(
        engine.device_time_bounds(&DeviceId::new("plant.d9")).unwrap(),
        TimeRange::new(70, 80)
    );

    // The torn file lost D2's second group
    let torn_resource = engine
        .resources()
        .iter()
        .find(|r| r.path().ends_with("torn.tsd"))
        .unwrap();
    assert_eq!(
        torn_resource.ranges().time_range(&DeviceId::new("plant.d2")),
        Some(TimeRange::new(3, 3))
    );

    // Every repaired file opens straight away
    for resource in engine.resources() {
        DataFileReader::open(resource.path()).unwrap();
    }
}

#[tokio::test]
async fn test_engine_reopen_after_recovery_is_all_clean() {
    let dir = tempdir().unwrap();

    let torn = dir.path().join("torn.tsd");
    let torn_groups = write_reference_file(&torn, false);
    truncate_to(&torn, torn_groups[1].offset + 1);

    {
        let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();
        assert_eq!(engine.report().crashed_count(), 1);
    }

    // Second startup sees the repaired state, nothing left to do
    let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();
    assert_eq!(engine.report().clean_count(), 1);
    assert_eq!(engine.report().repaired_count(), 0);
    assert_eq!(engine.report().crashed_count(), 0);
}

fn reference_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join("a.tsd"), dir.join("b.tsd"))
}

#[tokio::test]
async fn test_fatal_file_does_not_block_others() {
    let dir = tempdir().unwrap();
    let (good, bad) = reference_paths(dir.path());
    write_reference_file(&good, true);
    std::fs::write(&bad, b"ELF\x7f definitely not ours").unwrap();

    let config = EngineConfig::new(dir.path());
    let (resources, report) = strata::storage::recover_data_dir(&config).await.unwrap();

    // The good file recovered despite its neighbor failing fatally
    assert_eq!(resources.len(), 1);
    assert!(resources[0].path().ends_with("a.tsd"));
    assert_eq!(report.failed_count(), 1);

    // The engine refuses to serve the directory as a whole
    assert!(StorageEngine::open(config).await.is_err());
}
