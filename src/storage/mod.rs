//! strata storage layer
//!
//! Sealed columnar data files for device time series:
//!
//! - **types**: Core data structures (DeviceId, Point, TimeRange)
//! - **chunk**: Per-measurement chunk encoding (delta + LZ4) and statistics
//! - **file**: Data file format, writer and reader
//! - **replay**: Chunk/deletion replay units and tombstone files
//! - **engine**: Startup orchestration over a directory of data files
//! - **error**: Error types
//!
//! # File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ header: magic "STRA", version                 │
//! ├──────────────────────────────────────────────┤
//! │ chunk group (one device)                      │
//! │   chunk per measurement: stats + lz4 payload  │
//! │ chunk group ...                               │
//! ├──────────────────────────────────────────────┤
//! │ footer: group index, checksum, tail magic     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A `.ranges` companion beside each data file persists per-device time
//! bounds; `.tomb` holds deletion units applied at read/merge time. Both
//! are rebuilt by recovery when missing or stale.

pub mod chunk;
pub mod engine;
pub mod error;
pub mod file;
pub(crate) mod io;
pub mod replay;
pub mod types;

// Re-export commonly used types
pub use chunk::{compress_points, decompress_points, ChunkStats, EncodedChunk};
pub use engine::{
    discover_data_files, recover_data_dir, EngineConfig, EngineStats, FileFailure, FileRecovery,
    FileResource, RecoveryReport, StorageEngine,
};
pub use error::{StorageError, StorageResult};
pub use file::{ranges_path, tombstone_path, DataFileReader, DataFileWriter, GroupEntry};
pub use replay::{read_tombstone_file, ChunkUnit, DeletionUnit, ReplayUnit, UnitReader};
pub use types::{DeviceId, Point, TimeRange};
