// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Replication Offset Entity
//!
//! A [`ReplicationOffset`] records how far the pipeline has progressed for
//! one `(table, keyspace, partition range, destination)` key. It is the
//! source of truth for replay positions: the persisted copy lives in each
//! destination's offsets table and is committed in the same transactional
//! boundary as the data batch (where the destination supports one).
//!
//! ## Lifecycle
//!
//! - Created on the first successful batch commit for a key.
//! - Updated atomically with each committed batch; timestamps and positions
//!   only move forward (see [`ReplicationOffset::advanced`]).
//! - Never deleted except by explicit retention sweeps.
//!
//! ## Monotonicity
//!
//! `last_event_timestamp_micros` is strictly monotonic per key. Violations
//! indicate a commit-ordering bug, not an operational fault, so the offset
//! manager turns them into the fatal `NonMonotonicOffset` error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::value_objects::{PartitionId, SegmentPosition};

/// Destination warehouse family.
///
/// Concrete warehouse drivers plug in behind the `EventSink` contract; the
/// pipeline core only distinguishes the three delivery families because
/// they differ in idempotency mechanism (transactional upsert vs
/// merge-on-read append).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Destination {
    /// Transactional relational warehouse (upsert-keyed idempotency).
    Relational,
    /// Columnar analytical warehouse (merge-on-read append, no transactions).
    Columnar,
    /// Time-series warehouse (relational-compatible, transactional).
    Timeseries,
}

impl Destination {
    /// All destination families, in a stable order.
    pub const ALL: [Destination; 3] = [
        Destination::Relational,
        Destination::Columnar,
        Destination::Timeseries,
    ];

    /// Lowercase tag used in metrics labels and DLQ file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Relational => "relational",
            Destination::Columnar => "columnar",
            Destination::Timeseries => "timeseries",
        }
    }

    /// Parses the lowercase tag back into a destination.
    pub fn parse(tag: &str) -> Result<Self, PipelineError> {
        match tag.to_ascii_lowercase().as_str() {
            "relational" => Ok(Destination::Relational),
            "columnar" => Ok(Destination::Columnar),
            "timeseries" => Ok(Destination::Timeseries),
            other => Err(PipelineError::InvalidParameter(format!(
                "Unknown destination tag: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one offset stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetKey {
    /// Replicated table name.
    pub table_name: String,
    /// Source keyspace.
    pub keyspace: String,
    /// Partition token range.
    pub partition_id: PartitionId,
    /// Destination the offset applies to.
    pub destination: Destination,
}

impl std::fmt::Display for OffsetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}:partition_{}:{}",
            self.keyspace, self.table_name, self.partition_id, self.destination
        )
    }
}

/// Progress record for one `(table, keyspace, partition range, destination)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationOffset {
    /// Unique identifier of this offset record.
    pub offset_id: Uuid,
    /// Replicated table name.
    pub table_name: String,
    /// Source keyspace.
    pub keyspace: String,
    /// Partition token range this offset covers.
    pub partition_id: PartitionId,
    /// Destination this offset applies to.
    pub destination: Destination,
    /// Commit-log segment file of the last committed batch.
    pub commitlog_file: String,
    /// Byte offset within the segment (position of the next unread entry).
    pub commitlog_position: u64,
    /// Writetime of the last successfully replicated event. Strictly
    /// monotonic per key.
    pub last_event_timestamp_micros: i64,
    /// Wall-clock commit time, used for replication-lag calculation.
    pub last_committed_at: DateTime<Utc>,
    /// Events replicated in the batch this offset records. The persisted
    /// offsets table accumulates this into a running total.
    pub events_replicated_count: u64,
}

impl ReplicationOffset {
    /// Creates a validated offset record with a fresh `offset_id` and
    /// `last_committed_at` stamped to the current wall clock.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table_name: impl Into<String>,
        keyspace: impl Into<String>,
        partition_id: PartitionId,
        destination: Destination,
        commitlog_file: impl Into<String>,
        commitlog_position: u64,
        last_event_timestamp_micros: i64,
        events_replicated_count: u64,
    ) -> Result<Self, PipelineError> {
        if last_event_timestamp_micros < 0 {
            return Err(PipelineError::InvalidParameter(format!(
                "last_event_timestamp_micros must be non-negative, got {last_event_timestamp_micros}"
            )));
        }

        Ok(Self {
            offset_id: Uuid::new_v4(),
            table_name: table_name.into(),
            keyspace: keyspace.into(),
            partition_id,
            destination,
            commitlog_file: commitlog_file.into(),
            commitlog_position,
            last_event_timestamp_micros,
            last_committed_at: Utc::now(),
            events_replicated_count,
        })
    }

    /// Key this offset belongs to.
    pub fn key(&self) -> OffsetKey {
        OffsetKey {
            table_name: self.table_name.clone(),
            keyspace: self.keyspace.clone(),
            partition_id: self.partition_id,
            destination: self.destination,
        }
    }

    /// Segment coordinate of this offset.
    pub fn segment_position(&self) -> SegmentPosition {
        SegmentPosition::new(self.commitlog_file.clone(), self.commitlog_position)
    }

    /// Produces the successor offset after another committed batch.
    ///
    /// Keeps the same `offset_id`, accumulates the event count, and rejects
    /// backwards timestamps so the monotonicity invariant also holds at the
    /// model level, not only in the offset manager.
    pub fn advanced(
        &self,
        commitlog_file: impl Into<String>,
        commitlog_position: u64,
        last_event_timestamp_micros: i64,
        events_count: u64,
    ) -> Result<Self, PipelineError> {
        if last_event_timestamp_micros < self.last_event_timestamp_micros {
            return Err(PipelineError::NonMonotonicOffset(format!(
                "offset {} would move from t={} back to t={}",
                self.key(),
                self.last_event_timestamp_micros,
                last_event_timestamp_micros
            )));
        }

        Ok(Self {
            offset_id: self.offset_id,
            table_name: self.table_name.clone(),
            keyspace: self.keyspace.clone(),
            partition_id: self.partition_id,
            destination: self.destination,
            commitlog_file: commitlog_file.into(),
            commitlog_position,
            last_event_timestamp_micros,
            last_committed_at: Utc::now(),
            events_replicated_count: self.events_replicated_count + events_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(timestamp: i64) -> ReplicationOffset {
        ReplicationOffset::new(
            "users",
            "ecommerce",
            PartitionId::from_raw(3),
            Destination::Relational,
            "CommitLog-7-100.log",
            128,
            timestamp,
            10,
        )
        .unwrap()
    }

    #[test]
    fn test_negative_timestamp_rejected() {
        let result = ReplicationOffset::new(
            "users",
            "ecommerce",
            PartitionId::from_raw(0),
            Destination::Relational,
            "CommitLog-7-100.log",
            0,
            -1,
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_advanced_accumulates_count() {
        let first = offset(1_000_000);
        let second = first
            .advanced("CommitLog-7-100.log", 512, 1_000_010, 10)
            .unwrap();

        assert_eq!(second.offset_id, first.offset_id);
        assert_eq!(second.events_replicated_count, 20);
        assert_eq!(second.commitlog_position, 512);
    }

    #[test]
    fn test_advanced_rejects_backwards_timestamp() {
        let first = offset(1_000_000);
        let result = first.advanced("CommitLog-7-100.log", 512, 999_999, 10);
        assert!(matches!(
            result,
            Err(PipelineError::NonMonotonicOffset(_))
        ));
    }

    #[test]
    fn test_advanced_allows_equal_timestamp() {
        let first = offset(1_000_000);
        assert!(first
            .advanced("CommitLog-7-100.log", 512, 1_000_000, 1)
            .is_ok());
    }

    #[test]
    fn test_destination_tag_round_trip() {
        for destination in Destination::ALL {
            assert_eq!(
                Destination::parse(destination.as_str()).unwrap(),
                destination
            );
        }
        assert!(Destination::parse("postgres").is_err());
    }

    #[test]
    fn test_offset_key_display() {
        let key = offset(1_000_000).key();
        assert_eq!(key.to_string(), "ecommerce.users:partition_3:relational");
    }
}
