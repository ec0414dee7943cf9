//! strata storage engine startup
//!
//! The engine owns a directory of sealed data files. Opening it runs
//! crash recovery over every file before anything is served:
//!
//! - Discover `*.tsd` files under the data directory
//! - Recover each file on a blocking worker (bounded parallelism)
//! - Aggregate per-file outcomes into a `RecoveryReport`
//! - Refuse to serve if any file failed fatally
//!
//! Recovered files are registered as `FileResource`s; query planning asks
//! the registry for per-device time bounds and overlapping files.

use crate::index::TimeRangeIndex;
use crate::recovery::RecoveryPerformer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::DATA_FILE_EXT;
use crate::storage::types::{DeviceId, TimeRange};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory holding the data files
    pub data_dir: PathBuf,
    /// Concurrent recovery workers (0 = available parallelism)
    pub recovery_parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("strata_data"),
            recovery_parallelism: 0,
        }
    }
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    fn workers(&self) -> usize {
        if self.recovery_parallelism > 0 {
            return self.recovery_parallelism;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// A recovered, query-ready data file
#[derive(Debug)]
pub struct FileResource {
    path: PathBuf,
    ranges: TimeRangeIndex,
}

impl FileResource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Per-device time bounds for this file
    pub fn ranges(&self) -> &TimeRangeIndex {
        &self.ranges
    }

    /// Overall time span of the file across all devices
    pub fn time_bounds(&self) -> Option<TimeRange> {
        let mut bounds: Option<TimeRange> = None;
        for (_, range) in self.ranges.iter() {
            bounds = Some(match bounds {
                None => range,
                Some(b) => TimeRange::new(b.start.min(range.start), b.end.max(range.end)),
            });
        }
        bounds
    }
}

/// How recovery went for one file
#[derive(Debug, Clone, Serialize)]
pub struct FileRecovery {
    pub path: PathBuf,
    /// Data bytes were truncated away
    pub has_crashed: bool,
    /// The file and/or its companion needed repair
    pub repaired: bool,
}

/// A file whose recovery failed fatally
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Aggregated outcome of a recovery pass over one data directory
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    pub outcomes: Vec<FileRecovery>,
    pub failures: Vec<FileFailure>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.outcomes.len() + self.failures.len()
    }

    pub fn clean_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.repaired).count()
    }

    pub fn repaired_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.repaired).count()
    }

    pub fn crashed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.has_crashed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }
}

impl std::fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Files: {}, Clean: {}, Repaired: {}, Crashed: {}, Failed: {}",
            self.total(),
            self.clean_count(),
            self.repaired_count(),
            self.crashed_count(),
            self.failed_count()
        )
    }
}

/// List the data files under `dir`, in a stable order
pub fn discover_data_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|e| e == DATA_FILE_EXT).unwrap_or(false) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Recover every data file under the configured directory.
///
/// Per-file failures are isolated: a file that cannot be recovered lands in
/// the report's failures without affecting the others. Only directory-level
/// I/O errors (or a panicked worker) make this return `Err`.
pub async fn recover_data_dir(
    config: &EngineConfig,
) -> StorageResult<(Vec<FileResource>, RecoveryReport)> {
    let paths = discover_data_files(&config.data_dir)?;
    let workers = config.workers();
    tracing::info!(
        "Recovering {} data files in {:?} ({} workers)",
        paths.len(),
        config.data_dir,
        workers
    );

    let mut resources = Vec::with_capacity(paths.len());
    let mut report = RecoveryReport::default();

    for batch in paths.chunks(workers) {
        let mut handles = Vec::with_capacity(batch.len());
        for path in batch {
            let path = path.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let mut performer = RecoveryPerformer::new(&path);
                let outcome = performer.recover()?;
                let repaired = performer.was_repaired();
                let ranges = performer.into_index().unwrap_or_default();
                Ok::<_, StorageError>((outcome, repaired, ranges))
            }));
        }

        for (handle, path) in handles.into_iter().zip(batch) {
            let joined = handle.await.map_err(|e| {
                StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            match joined {
                Ok((outcome, repaired, ranges)) => {
                    report.outcomes.push(FileRecovery {
                        path: path.clone(),
                        has_crashed: outcome.has_crashed,
                        repaired,
                    });
                    resources.push(FileResource {
                        path: path.clone(),
                        ranges,
                    });
                }
                Err(e) => {
                    tracing::error!("Recovery of {:?} failed: {}", path, e);
                    report.failures.push(FileFailure {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    tracing::info!(
        "Recovery finished: {} clean, {} repaired, {} crashed, {} failed",
        report.clean_count(),
        report.repaired_count(),
        report.crashed_count(),
        report.failed_count()
    );

    Ok((resources, report))
}

/// The strata storage engine
///
/// Read-only once open: every registered file is sealed and recovered.
pub struct StorageEngine {
    config: EngineConfig,
    resources: Vec<FileResource>,
    report: RecoveryReport,
}

impl StorageEngine {
    /// Open the data directory, recovering every file first.
    ///
    /// Returns an error if any file fails fatally; partial corruption
    /// within the truncation model is self-healed and only shows up in
    /// the recovery report.
    pub async fn open(config: EngineConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let (resources, report) = recover_data_dir(&config).await?;
        if !report.failures.is_empty() {
            return Err(StorageError::Recovery {
                failed: report.failures.len(),
                total: report.total(),
            });
        }

        Ok(Self {
            config,
            resources,
            report,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Recovered files, sorted by path
    pub fn resources(&self) -> &[FileResource] {
        &self.resources
    }

    /// The startup recovery report
    pub fn report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Merged time bounds for one device across all files
    pub fn device_time_bounds(&self, device: &DeviceId) -> Option<TimeRange> {
        let mut bounds: Option<TimeRange> = None;
        for resource in &self.resources {
            if let Some(range) = resource.ranges.time_range(device) {
                bounds = Some(match bounds {
                    None => range,
                    Some(b) => TimeRange::new(b.start.min(range.start), b.end.max(range.end)),
                });
            }
        }
        bounds
    }

    /// Files whose data overlaps the given range
    pub fn files_overlapping(&self, range: TimeRange) -> Vec<&FileResource> {
        self.resources
            .iter()
            .filter(|r| {
                r.time_bounds()
                    .map(|b| b.overlaps(&range))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Engine-level statistics
    pub fn stats(&self) -> EngineStats {
        let devices: BTreeSet<&DeviceId> = self
            .resources
            .iter()
            .flat_map(|r| r.ranges.devices())
            .collect();
        let storage_size: u64 = self
            .resources
            .iter()
            .filter_map(|r| std::fs::metadata(&r.path).ok())
            .map(|m| m.len())
            .sum();

        EngineStats {
            file_count: self.resources.len(),
            device_count: devices.len(),
            repaired_files: self.report.repaired_count(),
            crashed_files: self.report.crashed_count(),
            storage_size_bytes: storage_size,
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub file_count: usize,
    pub device_count: usize,
    pub repaired_files: usize,
    pub crashed_files: usize,
    pub storage_size_bytes: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Files: {}, Devices: {}, Repaired: {}, Crashed: {}, Size: {:.2} KB",
            self.file_count,
            self.device_count,
            self.repaired_files,
            self.crashed_files,
            self.storage_size_bytes as f64 / 1024.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::{ranges_path, DataFileWriter};
    use crate::storage::types::Point;
    use tempfile::tempdir;

    fn points(ts: &[i64]) -> Vec<Point> {
        ts.iter().map(|&t| Point::new(t, t as f64)).collect()
    }

    fn seal_file(dir: &Path, name: &str, device: &str, ts: &[i64]) -> PathBuf {
        let path = dir.join(name);
        let mut writer = DataFileWriter::create(&path).unwrap();
        writer
            .write_group(&DeviceId::new(device), &[("m", points(ts))])
            .unwrap();
        let index = writer.seal().unwrap();
        index.save(ranges_path(&path)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_open_empty_dir() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();
        assert!(engine.resources().is_empty());
        assert_eq!(engine.stats().file_count, 0);
    }

    #[tokio::test]
    async fn test_open_clean_files() {
        let dir = tempdir().unwrap();
        seal_file(dir.path(), "a.tsd", "d1", &[1, 2]);
        seal_file(dir.path(), "b.tsd", "d2", &[10, 20]);

        let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();
        assert_eq!(engine.resources().len(), 2);
        assert_eq!(engine.report().clean_count(), 2);
        assert_eq!(engine.report().crashed_count(), 0);

        let bounds = engine.device_time_bounds(&DeviceId::new("d2")).unwrap();
        assert_eq!(bounds, TimeRange::new(10, 20));
    }

    #[tokio::test]
    async fn test_truncated_file_is_repaired_not_fatal() {
        let dir = tempdir().unwrap();
        seal_file(dir.path(), "a.tsd", "d1", &[1, 2]);
        let path = seal_file(dir.path(), "b.tsd", "d2", &[10, 20]);

        // Tear off the file's tail, strictly inside the group
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len / 2).unwrap();
        drop(file);

        let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();
        assert_eq!(engine.resources().len(), 2);
        assert_eq!(engine.report().crashed_count(), 1);
        // The torn group is gone entirely, so d2 has no data left
        assert!(engine.device_time_bounds(&DeviceId::new("d2")).is_none());
        assert!(engine.device_time_bounds(&DeviceId::new("d1")).is_some());
    }

    #[tokio::test]
    async fn test_foreign_file_is_fatal_and_isolated() {
        let dir = tempdir().unwrap();
        seal_file(dir.path(), "a.tsd", "d1", &[1, 2]);
        std::fs::write(dir.path().join("b.tsd"), b"not a data file").unwrap();

        let config = EngineConfig::new(dir.path());
        let (resources, report) = recover_data_dir(&config).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("b.tsd"));

        match StorageEngine::open(config).await {
            Err(StorageError::Recovery { failed, total }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected Recovery error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_device_bounds_merge_across_files() {
        let dir = tempdir().unwrap();
        seal_file(dir.path(), "a.tsd", "d1", &[1, 5]);
        seal_file(dir.path(), "b.tsd", "d1", &[8, 12]);

        let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();
        let bounds = engine.device_time_bounds(&DeviceId::new("d1")).unwrap();
        assert_eq!(bounds, TimeRange::new(1, 12));
    }

    #[tokio::test]
    async fn test_files_overlapping() {
        let dir = tempdir().unwrap();
        seal_file(dir.path(), "a.tsd", "d1", &[1, 5]);
        seal_file(dir.path(), "b.tsd", "d1", &[100, 200]);

        let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();
        let hits = engine.files_overlapping(TimeRange::new(90, 110));
        assert_eq!(hits.len(), 1);
        assert!(hits[0].path().ends_with("b.tsd"));

        let all = engine.files_overlapping(TimeRange::new(0, 1000));
        assert_eq!(all.len(), 2);

        let none = engine.files_overlapping(TimeRange::new(6, 99));
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_stats_display() {
        let dir = tempdir().unwrap();
        seal_file(dir.path(), "a.tsd", "d1", &[1, 2]);

        let engine = StorageEngine::open(EngineConfig::new(dir.path())).await.unwrap();
        let stats = engine.stats();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.device_count, 1);
        assert!(stats.storage_size_bytes > 0);
        assert!(format!("{}", stats).contains("Files: 1"));
    }
}
