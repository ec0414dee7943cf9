//! Core data types for the strata storage layer
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `DeviceId`: Hierarchical identifier of a data-producing device
//! - `Point`: A single timestamped measurement value
//! - `TimeRange`: An inclusive time interval

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hierarchical device identifier (e.g. `"factory1.line3.sensor7"`)
///
/// Devices own chunk groups in data files and entries in the time-range
/// index. The string form is what gets length-prefixed on disk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new device id
    ///
    /// # Panics
    /// Panics if the id is empty
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "DeviceId: id must not be empty");
        Self(id)
    }

    /// Create a device id, returning None if empty
    pub fn try_new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    /// The string form written to disk
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of the hierarchical id
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single timestamped measurement value
///
/// Timestamps are Unix milliseconds; values are `f64`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// The measured value
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Inclusive time interval: [start, end]
///
/// Both bounds are inclusive, matching the per-device ranges recorded in
/// chunk statistics and the companion index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: i64,
    /// End timestamp (inclusive), in milliseconds
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range
    ///
    /// # Panics
    /// Panics if start > end
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start <= end, "TimeRange: start must not exceed end");
        Self { start, end }
    }

    /// Create a time range, returning None if invalid
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Get intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        Self::try_new(start, end)
    }

    /// Get the duration in milliseconds
    pub fn duration_millis(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
