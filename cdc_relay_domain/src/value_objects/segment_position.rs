// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Segment Position Value Object
//!
//! A `(segment file, byte offset)` coordinate into the commit-log directory.
//! Segment files are named so that lexicographic order equals age order, so
//! the derived `Ord` (segment name first, byte offset second) gives the
//! replay ordering the offset monotonicity invariant is stated over.

use serde::{Deserialize, Serialize};

/// Position of an entry within the commit-log directory.
///
/// Comparison is lexicographic on `(segment_file, position)`; field order in
/// the struct is load-bearing for the derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentPosition {
    /// Segment file name (e.g., `CommitLog-7-1700000000.log`).
    pub segment_file: String,
    /// Byte offset within the segment.
    pub position: u64,
}

impl SegmentPosition {
    /// Creates a position from a segment name and byte offset.
    pub fn new(segment_file: impl Into<String>, position: u64) -> Self {
        Self {
            segment_file: segment_file.into(),
            position,
        }
    }
}

impl std::fmt::Display for SegmentPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.segment_file, self.position)
    }
}
