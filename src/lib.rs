//! # strata
//!
//! Crash-safe columnar storage layer for device time-series data: sealed
//! data files, per-device time-range indexes, and startup recovery.
//!
//! ## Features
//!
//! - **Sealed columnar files**: per-device chunk groups with LZ4-compressed
//!   chunks and per-chunk statistics
//! - **Companion indexes**: compact per-device time bounds beside each file
//! - **Crash recovery**: torn files are truncated to the last complete
//!   chunk group and re-sealed; stale or missing companions are rebuilt
//! - **Startup orchestration**: every file recovered concurrently before
//!   the engine serves anything
//!
//! ## Modules
//!
//! - [`storage`]: data file format, writer/reader, replay units, engine
//! - [`index`]: per-device time-range index and companion file I/O
//! - [`recovery`]: structure scanner and per-file recovery performer
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::storage::{EngineConfig, StorageEngine, DeviceId, TimeRange};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Recover and open the data directory
//!     let engine = StorageEngine::open(EngineConfig::new("./strata_data")).await?;
//!
//!     println!("{}", engine.report());
//!
//!     // Query planning facts from the registry
//!     let device = DeviceId::new("site1.turbine4");
//!     if let Some(bounds) = engine.device_time_bounds(&device) {
//!         println!("{} covers {}", device, bounds);
//!     }
//!     let candidates = engine.files_overlapping(TimeRange::new(0, 1_000_000));
//!     println!("{} files overlap", candidates.len());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod recovery;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    DataFileReader, DataFileWriter, DeviceId, EngineConfig, EngineStats, Point, RecoveryReport,
    StorageEngine, StorageError, StorageResult, TimeRange,
};

pub use index::TimeRangeIndex;

pub use recovery::{RecoveryOutcome, RecoveryPerformer, RecoveryState, ScanVerdict};

pub use config::{Config, ConfigError, LoggingConfig, RecoveryConfig, StorageConfig};
