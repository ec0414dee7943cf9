//! Startup recovery for sealed data files
//!
//! After an unclean shutdown a data file may be cut mid-write or its
//! companion index may be missing or stale. Recovery brings every file
//! back to a query-ready state:
//!
//! - **scanner**: validates file structure, finds the last complete
//!   chunk group
//! - **performer**: truncates torn tails, re-seals the file, reconciles
//!   the companion time-range index
//!
//! ```text
//! scan_file ──▶ Intact ────▶ companion ok? ──▶ CLEAN
//!          │                            └─no─▶ rebuild companion
//!          └─▶ Truncated ─▶ rebuild index ─▶ truncate ─▶ re-seal
//! ```
//!
//! A repaired file reports `has_crashed = true` only when data bytes were
//! actually removed; a rebuilt companion alone is not a crash.

mod performer;
mod scanner;

pub use performer::{RecoveryOutcome, RecoveryPerformer, RecoveryState};
pub use scanner::{scan_file, scan_groups, GroupWalker, ScanVerdict, WalkSummary};
