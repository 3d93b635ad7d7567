// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Offset Manager
//!
//! In-memory source of truth for replay positions per
//! `(table, keyspace, partition range, destination)`, enforcing the
//! timestamp monotonicity invariant on every write. The persisted copies
//! live in each destination's offsets table; at startup those are read back
//! through the sinks and seeded here, so the in-memory map is a
//! write-through cache over the destinations - never the other way around.
//!
//! ## Monotonicity
//!
//! A write whose `last_event_timestamp_micros` is lower than the stored
//! value for its key is a [`PipelineError::NonMonotonicOffset`]. Callers
//! treat that as fatal: it means batches committed out of order, which is a
//! concurrency bug, and continuing would corrupt the resume positions.
//!
//! ## Startup resume
//!
//! [`OffsetManager::resume_point`] picks the minimum `(segment, position)`
//! across the destinations that have progress, so that no destination skips
//! entries it has not yet committed. Destinations ahead of the resume point
//! re-receive entries and deduplicate via their idempotent writes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use cdc_relay_domain::{
    Destination, OffsetKey, PipelineError, ReplicationOffset, SegmentPosition,
};

/// Serialized per-key offset store with monotonicity enforcement.
pub struct OffsetManager {
    offsets: RwLock<HashMap<OffsetKey, ReplicationOffset>>,
}

impl OffsetManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            offsets: RwLock::new(HashMap::new()),
        }
    }

    /// Latest known offset for a key.
    pub fn read(&self, key: &OffsetKey) -> Option<ReplicationOffset> {
        self.offsets.read().get(key).cloned()
    }

    /// Records a committed offset.
    ///
    /// Rejects timestamps moving backwards for the key with
    /// `NonMonotonicOffset`; the stored offset is left untouched in that
    /// case.
    pub fn write(&self, offset: ReplicationOffset) -> Result<(), PipelineError> {
        let key = offset.key();
        let mut offsets = self.offsets.write();

        if let Some(existing) = offsets.get(&key) {
            if offset.last_event_timestamp_micros < existing.last_event_timestamp_micros {
                return Err(PipelineError::NonMonotonicOffset(format!(
                    "offset for {} would move from t={} back to t={}",
                    key,
                    existing.last_event_timestamp_micros,
                    offset.last_event_timestamp_micros
                )));
            }
        }

        debug!(
            key = %key,
            position = offset.commitlog_position,
            events = offset.events_replicated_count,
            "Offset written"
        );
        offsets.insert(key, offset);
        Ok(())
    }

    /// Latest offset across all partition ranges for a destination, used to
    /// choose the per-destination resume candidate at startup.
    pub fn latest_across_partitions(
        &self,
        table_name: &str,
        keyspace: &str,
        destination: Destination,
    ) -> Option<ReplicationOffset> {
        self.offsets
            .read()
            .values()
            .filter(|offset| {
                offset.table_name == table_name
                    && offset.keyspace == keyspace
                    && offset.destination == destination
            })
            .max_by_key(|offset| offset.last_event_timestamp_micros)
            .cloned()
    }

    /// Latest offset per destination for a table.
    pub fn all_latest(
        &self,
        table_name: &str,
        keyspace: &str,
    ) -> HashMap<Destination, ReplicationOffset> {
        let mut latest: HashMap<Destination, ReplicationOffset> = HashMap::new();
        for offset in self.offsets.read().values() {
            if offset.table_name != table_name || offset.keyspace != keyspace {
                continue;
            }
            match latest.get(&offset.destination) {
                Some(existing)
                    if existing.last_event_timestamp_micros
                        >= offset.last_event_timestamp_micros => {}
                _ => {
                    latest.insert(offset.destination, offset.clone());
                }
            }
        }
        latest
    }

    /// Resume coordinate for the tailer: the minimum `(segment, position)`
    /// across the destinations that have progress. `None` when no
    /// destination has committed anything yet (start from the oldest
    /// segment).
    pub fn resume_point(
        &self,
        table_name: &str,
        keyspace: &str,
        destinations: &[Destination],
    ) -> Option<SegmentPosition> {
        let candidates: Vec<SegmentPosition> = destinations
            .iter()
            .filter_map(|destination| {
                self.latest_across_partitions(table_name, keyspace, *destination)
                    .map(|offset| offset.segment_position())
            })
            .collect();

        let resume = candidates.into_iter().min();
        if let Some(ref position) = resume {
            info!(
                table = %table_name,
                keyspace = %keyspace,
                resume = %position,
                "Resume point chosen across destinations"
            );
        }
        resume
    }

    /// Removes offsets last committed before `older_than`. Returns how many
    /// were deleted.
    pub fn retention_sweep(&self, older_than: DateTime<Utc>) -> usize {
        let mut offsets = self.offsets.write();
        let before = offsets.len();
        offsets.retain(|_, offset| offset.last_committed_at >= older_than);
        let deleted = before - offsets.len();
        if deleted > 0 {
            info!(deleted, "Retention sweep removed old offsets");
        }
        deleted
    }

    /// Number of tracked offset keys.
    pub fn len(&self) -> usize {
        self.offsets.read().len()
    }

    /// True when no offsets are tracked.
    pub fn is_empty(&self) -> bool {
        self.offsets.read().is_empty()
    }
}

impl Default for OffsetManager {
    fn default() -> Self {
        Self::new()
    }
}
