//! Strata index structures
//!
//! Per-file metadata kept outside the data files themselves:
//!
//! - **TimeRangeIndex**: per-device inclusive time bounds, persisted as the
//!   data file's `.ranges` companion
//!
//! # Role in recovery
//!
//! ```text
//! Query: "files with plant.line1 data in [t1, t2]"
//!        ↓
//! TimeRangeIndex per file: device bounds → skip files outside the range
//!        ↓
//! Open only matching data files
//! ```
//!
//! Queries trust these companions blindly, so recovery rewrites them
//! whenever the data file and companion could disagree.

mod time_ranges;

pub use time_ranges::TimeRangeIndex;
