// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Micro-Batcher
//!
//! Assembles change events into micro-batches, one open batch per
//! `(table, destination)` key.
//!
//! ## Batch lifecycle
//!
//! ```text
//! Open ──seal──▶ Sealed ──begin_commit──▶ Committing ──complete──▶ Committed
//!                                              │
//!                                              └──fail──▶ Failed
//! ```
//!
//! Illegal transitions are internal errors - the dispatcher drives batches
//! strictly forward, and a batch observed out of order means a logic bug,
//! not an operational condition.
//!
//! ## Sealing triggers
//!
//! - the batch reaches `batch_size` events ([`Batcher::accept`] returns it),
//! - the poll cycle ends with events present ([`Batcher::seal_open`]),
//! - a shutdown signal arrives (also [`Batcher::seal_open`]).
//!
//! Empty batches are never produced: sealing only yields batches holding at
//! least one event.

use std::collections::HashMap;

use cdc_relay_domain::{ChangeEvent, Destination, PipelineError, SegmentPosition};

/// Lifecycle state of a micro-batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Accepting events.
    Open,
    /// Handed to a sink worker, not yet committing.
    Sealed,
    /// Atomic write-then-offset in progress.
    Committing,
    /// Terminal: committed to the destination.
    Committed,
    /// Terminal: retry budget exhausted, events dead-lettered.
    Failed,
}

/// An ordered group of events committed to one destination as a unit.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    /// Source table name.
    pub table_name: String,
    /// Source keyspace.
    pub keyspace: String,
    /// Destination this batch is bound for.
    pub destination: Destination,
    /// Events in arrival order. The sink writes them in exactly this order.
    pub events: Vec<ChangeEvent>,
    /// Position immediately after the last event's entry; what the offset
    /// records so a restart resumes past this batch.
    pub end_position: SegmentPosition,
    state: BatchState,
}

impl MicroBatch {
    fn new(table_name: String, keyspace: String, destination: Destination) -> Self {
        Self {
            table_name,
            keyspace,
            destination,
            events: Vec::new(),
            end_position: SegmentPosition::new("", 0),
            state: BatchState::Open,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Number of events held.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when no events have been accepted.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Highest source writetime in the batch.
    pub fn last_timestamp_micros(&self) -> i64 {
        self.events
            .iter()
            .map(|event| event.timestamp_micros)
            .max()
            .unwrap_or(0)
    }

    fn push(&mut self, event: ChangeEvent, next_position: SegmentPosition) {
        self.events.push(event);
        self.end_position = next_position;
    }

    fn transition(&mut self, from: BatchState, to: BatchState) -> Result<(), PipelineError> {
        if self.state != from {
            return Err(PipelineError::internal_error(format!(
                "batch for {}.{}/{} cannot move {:?} -> {:?} (currently {:?})",
                self.keyspace, self.table_name, self.destination, from, to, self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Open → Sealed.
    pub fn seal(&mut self) -> Result<(), PipelineError> {
        self.transition(BatchState::Open, BatchState::Sealed)
    }

    /// Sealed → Committing.
    pub fn begin_commit(&mut self) -> Result<(), PipelineError> {
        self.transition(BatchState::Sealed, BatchState::Committing)
    }

    /// Committing → Committed.
    pub fn complete(&mut self) -> Result<(), PipelineError> {
        self.transition(BatchState::Committing, BatchState::Committed)
    }

    /// Committing → Failed.
    pub fn fail(&mut self) -> Result<(), PipelineError> {
        self.transition(BatchState::Committing, BatchState::Failed)
    }
}

/// Accumulates events into per-`(table, destination)` open batches.
pub struct Batcher {
    batch_size: usize,
    open: HashMap<(String, Destination), MicroBatch>,
}

impl Batcher {
    /// Creates a batcher sealing at `batch_size` events.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            open: HashMap::new(),
        }
    }

    /// Adds an event to the open batch for `(event table, destination)`.
    ///
    /// `next_position` is the segment coordinate immediately after the
    /// event's entry. Returns the sealed batch when it reached the size
    /// threshold.
    pub fn accept(
        &mut self,
        event: ChangeEvent,
        destination: Destination,
        next_position: SegmentPosition,
    ) -> Result<Option<MicroBatch>, PipelineError> {
        let key = (event.qualified_table(), destination);
        let full = {
            let batch = self.open.entry(key.clone()).or_insert_with(|| {
                MicroBatch::new(event.table_name.clone(), event.keyspace.clone(), destination)
            });
            batch.push(event, next_position);
            batch.len() >= self.batch_size
        };

        if full {
            if let Some(mut sealed) = self.open.remove(&key) {
                sealed.seal()?;
                return Ok(Some(sealed));
            }
        }
        Ok(None)
    }

    /// Seals every non-empty open batch (poll-cycle end or shutdown).
    pub fn seal_open(&mut self) -> Result<Vec<MicroBatch>, PipelineError> {
        let mut sealed = Vec::new();
        for (_, mut batch) in self.open.drain() {
            if batch.is_empty() {
                continue;
            }
            batch.seal()?;
            sealed.push(batch);
        }
        // Deterministic dispatch order across keys.
        sealed.sort_by(|a, b| {
            (&a.keyspace, &a.table_name, a.destination).cmp(&(
                &b.keyspace,
                &b.table_name,
                b.destination,
            ))
        });
        Ok(sealed)
    }

    /// Total events currently buffered in open batches.
    pub fn buffered_events(&self) -> usize {
        self.open.values().map(MicroBatch::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_relay_domain::entities::change_event::{ColumnMap, EventType};
    use serde_json::json;

    fn event(table: &str, id: u32, timestamp: i64) -> ChangeEvent {
        let mut pk = ColumnMap::new();
        pk.insert("user_id".to_string(), json!(format!("u-{id}")));
        let mut cols = ColumnMap::new();
        cols.insert("email".to_string(), json!("a@b.com"));
        ChangeEvent::new(
            EventType::Insert,
            table,
            "ecommerce",
            pk,
            ColumnMap::new(),
            cols,
            timestamp,
            None,
        )
        .unwrap()
    }

    fn position(offset: u64) -> SegmentPosition {
        SegmentPosition::new("CommitLog-7-1.log", offset)
    }

    #[test]
    fn test_seals_at_batch_size() {
        let mut batcher = Batcher::new(3);

        for i in 0..2 {
            let sealed = batcher
                .accept(event("users", i, 1_000_000 + i64::from(i)), Destination::Relational, position(u64::from(i) * 100))
                .unwrap();
            assert!(sealed.is_none());
        }

        let sealed = batcher
            .accept(event("users", 2, 1_000_002), Destination::Relational, position(300))
            .unwrap()
            .expect("third event seals the batch");

        assert_eq!(sealed.len(), 3);
        assert_eq!(sealed.state(), BatchState::Sealed);
        assert_eq!(sealed.end_position, position(300));
        assert_eq!(sealed.last_timestamp_micros(), 1_000_002);
        assert_eq!(batcher.buffered_events(), 0);
    }

    #[test]
    fn test_batches_keyed_per_table_and_destination() {
        let mut batcher = Batcher::new(10);

        batcher
            .accept(event("users", 1, 1_000_000), Destination::Relational, position(100))
            .unwrap();
        batcher
            .accept(event("users", 1, 1_000_000), Destination::Columnar, position(100))
            .unwrap();
        batcher
            .accept(event("sessions", 1, 1_000_001), Destination::Relational, position(200))
            .unwrap();

        assert_eq!(batcher.buffered_events(), 3);
        let sealed = batcher.seal_open().unwrap();
        assert_eq!(sealed.len(), 3);
        assert!(sealed.iter().all(|batch| batch.len() == 1));
    }

    #[test]
    fn test_seal_open_skips_nothing_and_yields_no_empties() {
        let mut batcher = Batcher::new(10);
        assert!(batcher.seal_open().unwrap().is_empty());

        batcher
            .accept(event("users", 1, 1_000_000), Destination::Relational, position(100))
            .unwrap();
        let sealed = batcher.seal_open().unwrap();
        assert_eq!(sealed.len(), 1);
        assert!(!sealed[0].is_empty());
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut batcher = Batcher::new(1);
        let mut batch = batcher
            .accept(event("users", 1, 1_000_000), Destination::Relational, position(100))
            .unwrap()
            .unwrap();

        assert_eq!(batch.state(), BatchState::Sealed);
        batch.begin_commit().unwrap();
        assert_eq!(batch.state(), BatchState::Committing);
        batch.complete().unwrap();
        assert_eq!(batch.state(), BatchState::Committed);
    }

    #[test]
    fn test_state_machine_failure_path() {
        let mut batcher = Batcher::new(1);
        let mut batch = batcher
            .accept(event("users", 1, 1_000_000), Destination::Relational, position(100))
            .unwrap()
            .unwrap();

        batch.begin_commit().unwrap();
        batch.fail().unwrap();
        assert_eq!(batch.state(), BatchState::Failed);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut batcher = Batcher::new(1);
        let mut batch = batcher
            .accept(event("users", 1, 1_000_000), Destination::Relational, position(100))
            .unwrap()
            .unwrap();

        // Sealed batch cannot complete without committing first.
        assert!(batch.complete().is_err());
        // Sealed batch cannot seal twice.
        assert!(batch.seal().is_err());

        batch.begin_commit().unwrap();
        batch.complete().unwrap();
        // Terminal state: no further transitions.
        assert!(batch.fail().is_err());
        assert!(batch.begin_commit().is_err());
    }
}
