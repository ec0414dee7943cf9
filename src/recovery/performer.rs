//! Sealed data file recovery
//!
//! One `RecoveryPerformer` per data file. `recover()` scans the file,
//! truncates it to the last complete chunk group when the tail is torn,
//! re-seals it with a fresh footer, and reconciles the companion
//! time-range index. Sealed files never reopen for appends; mutation past
//! recovery goes through the merge path.
//!
//! File handles are scoped to `recover()` and released on every exit path.

use crate::index::TimeRangeIndex;
use crate::recovery::scanner::{scan_file, ScanVerdict};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::{ranges_path, write_footer, FileHeader, GroupEntry, HEADER_SIZE};
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Recovery progress for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Nothing examined yet
    Unchecked,
    /// Structure scan completed
    Scanned,
    /// File and companion were already consistent
    Clean,
    /// File was truncated and/or the companion was rebuilt
    Repaired,
    /// Recovery finished; outcome is fixed
    Finalized,
}

/// What `recover()` established about one file
///
/// Produced once per recovery pass and never mutated afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Data bytes were truncated away during repair
    pub has_crashed: bool,
    /// Whether the file accepts further appends (never, once sealed)
    pub can_write: bool,
}

/// Recovers one sealed data file and its companion index
pub struct RecoveryPerformer {
    path: PathBuf,
    preloaded: Option<TimeRangeIndex>,
    state: RecoveryState,
    outcome: Option<RecoveryOutcome>,
    index: Option<TimeRangeIndex>,
    repaired: bool,
}

impl RecoveryPerformer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            preloaded: None,
            state: RecoveryState::Unchecked,
            outcome: None,
            index: None,
            repaired: false,
        }
    }

    /// Construct with an already-loaded time-range index, skipping the
    /// companion file read. The index is still checked against the file.
    pub fn with_index(path: impl Into<PathBuf>, index: TimeRangeIndex) -> Self {
        let mut performer = Self::new(path);
        performer.preloaded = Some(index);
        performer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// True iff recovery truncated data bytes. A rebuilt companion alone
    /// does not count as a crash.
    pub fn has_crashed(&self) -> bool {
        self.outcome.map(|o| o.has_crashed).unwrap_or(false)
    }

    /// Sealed files never reopen for direct appends
    pub fn can_write(&self) -> bool {
        false
    }

    /// The companion was rebuilt and/or the file was repaired
    pub fn was_repaired(&self) -> bool {
        self.repaired
    }

    /// The reconciled index, once `recover()` has succeeded
    pub fn index(&self) -> Option<&TimeRangeIndex> {
        self.index.as_ref()
    }

    pub fn into_index(self) -> Option<TimeRangeIndex> {
        self.index
    }

    /// Bring the file and its companion index back to a consistent state.
    ///
    /// Idempotent: a second call on a finalized performer returns the same
    /// outcome without touching disk.
    pub fn recover(&mut self) -> StorageResult<RecoveryOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }

        let verdict = scan_file(&self.path)?;
        self.state = RecoveryState::Scanned;

        let outcome = match verdict {
            ScanVerdict::Intact { groups } => self.reconcile_intact(groups)?,
            ScanVerdict::Truncated { valid_len, groups } => self.repair(valid_len, groups)?,
        };

        self.state = RecoveryState::Finalized;
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// The data file is structurally complete; decide whether the
    /// companion index can be trusted as-is.
    fn reconcile_intact(&mut self, groups: Vec<GroupEntry>) -> StorageResult<RecoveryOutcome> {
        let ranges = ranges_path(&self.path);

        let candidate = match self.preloaded.take() {
            Some(index) => Some(index),
            None => match TimeRangeIndex::load(&ranges) {
                Ok(index) => Some(index),
                Err(StorageError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    tracing::info!("No companion index for {:?}, rebuilding", self.path);
                    None
                }
                Err(e) => {
                    tracing::warn!(
                        "Companion index for {:?} unreadable ({}), rebuilding",
                        self.path,
                        e
                    );
                    None
                }
            },
        };

        if let Some(index) = candidate {
            if index.covers(&groups) {
                tracing::debug!("Data file {:?} is clean", self.path);
                self.state = RecoveryState::Clean;
                self.index = Some(index);
                return Ok(RecoveryOutcome {
                    has_crashed: false,
                    can_write: false,
                });
            }
            // The footer is authoritative when the two disagree
            tracing::warn!(
                "Time-range index for {:?} is narrower than the footer, rebuilding",
                self.path
            );
        }

        let index = TimeRangeIndex::rebuild_from(&groups);
        index.save(&ranges)?;
        tracing::info!(
            "Rebuilt companion index for {:?} ({} devices)",
            self.path,
            index.device_count()
        );

        self.state = RecoveryState::Repaired;
        self.repaired = true;
        self.index = Some(index);
        Ok(RecoveryOutcome {
            has_crashed: false,
            can_write: false,
        })
    }

    /// The file tail is torn. Rebuild the index from the surviving groups,
    /// persist it, then truncate and re-seal the data file.
    ///
    /// The companion is written before the data file is touched: if the
    /// write fails, the data file is left exactly as found.
    fn repair(&mut self, valid_len: u64, groups: Vec<GroupEntry>) -> StorageResult<RecoveryOutcome> {
        let index = TimeRangeIndex::rebuild_from(&groups);
        index.save(ranges_path(&self.path))?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let file_len = file.metadata()?.len();
        let has_crashed = valid_len < file_len;

        if has_crashed {
            tracing::warn!(
                "Truncating {:?} from {} to {} bytes ({} chunk groups survive)",
                self.path,
                file_len,
                valid_len,
                groups.len()
            );
            file.set_len(valid_len)?;
        }

        let mut writer = BufWriter::new(&file);
        if valid_len < HEADER_SIZE as u64 {
            // Even the header was torn; start the file over
            writer.seek(SeekFrom::Start(0))?;
            writer.write_all(&FileHeader::new().to_bytes())?;
        } else {
            writer.seek(SeekFrom::Start(valid_len))?;
        }
        write_footer(&mut writer, &groups)?;
        writer.flush()?;
        file.sync_all()?;

        tracing::info!(
            "Repaired {:?}: {} chunk groups, {} devices, crashed = {}",
            self.path,
            groups.len(),
            index.device_count(),
            has_crashed
        );

        self.state = RecoveryState::Repaired;
        self.repaired = true;
        self.index = Some(index);
        Ok(RecoveryOutcome {
            has_crashed,
            can_write: false,
        })
    }
}
