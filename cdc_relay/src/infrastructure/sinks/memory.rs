// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # In-Memory Sink
//!
//! Reference [`EventSink`] implementation backed by process memory, used by
//! the integration tests and the end-to-end scenarios. It models an
//! idempotent destination (upserts keyed on partition plus clustering
//! columns, last-writer-wins by writetime) and supports fault injection:
//! scripted write/commit failures and an artificial per-batch delay for
//! backpressure experiments.
//!
//! Offsets follow the same guarded-accumulate semantics as the SQL sinks,
//! so exactly-once accounting can be asserted without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use cdc_relay_domain::entities::change_event::{value_to_plain_string, ColumnMap};
use cdc_relay_domain::{
    ChangeEvent, Destination, EventSink, EventType, OffsetKey, PipelineError, ReplicationOffset,
    SinkCounters, SinkHealth, SinkStats,
};

/// Row identity inside the store: table, partition values, clustering
/// values.
type RowKey = (String, String, String);

/// One stored destination row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Column payload at the last accepted write.
    pub columns: ColumnMap,
    /// Writetime of the last accepted write.
    pub timestamp_micros: i64,
    /// `event_id` of the event that produced the current version.
    pub event_id: String,
}

#[derive(Debug, Default)]
struct FaultPlan {
    remaining: u32,
    message: String,
}

impl FaultPlan {
    fn take(&mut self) -> Option<String> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.message.clone())
    }
}

/// In-memory destination with fault injection.
pub struct MemorySink {
    destination: Destination,
    rows: Mutex<HashMap<RowKey, StoredRow>>,
    offsets: Mutex<HashMap<OffsetKey, ReplicationOffset>>,
    counters: SinkCounters,
    connected: AtomicBool,
    write_faults: Mutex<FaultPlan>,
    commit_faults: Mutex<FaultPlan>,
    write_delay: Mutex<Duration>,
}

impl MemorySink {
    /// Creates an in-memory sink for `destination`.
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            rows: Mutex::new(HashMap::new()),
            offsets: Mutex::new(HashMap::new()),
            counters: SinkCounters::new(),
            connected: AtomicBool::new(false),
            write_faults: Mutex::new(FaultPlan::default()),
            commit_faults: Mutex::new(FaultPlan::default()),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Makes the next `count` calls to `write_batch` fail with `message`.
    pub fn inject_write_failures(&self, count: u32, message: impl Into<String>) {
        *self.write_faults.lock() = FaultPlan {
            remaining: count,
            message: message.into(),
        };
    }

    /// Makes the next `count` calls to `commit_offsets` fail with `message`.
    pub fn inject_commit_failures(&self, count: u32, message: impl Into<String>) {
        *self.commit_faults.lock() = FaultPlan {
            remaining: count,
            message: message.into(),
        };
    }

    /// Delays every `write_batch` call, for backpressure tests.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Number of live rows for a table.
    pub fn row_count(&self, table_name: &str) -> usize {
        self.rows
            .lock()
            .keys()
            .filter(|(table, _, _)| table == table_name)
            .count()
    }

    /// Distinct `event_id`s currently stored for a table.
    pub fn event_ids(&self, table_name: &str) -> Vec<String> {
        self.rows
            .lock()
            .iter()
            .filter(|((table, _, _), _)| table == table_name)
            .map(|(_, row)| row.event_id.clone())
            .collect()
    }

    /// Stored row for a partition/clustering key, if present.
    pub fn row(&self, table_name: &str, pk: &str, ck: &str) -> Option<StoredRow> {
        self.rows
            .lock()
            .get(&(table_name.to_string(), pk.to_string(), ck.to_string()))
            .cloned()
    }

    /// Accumulated committed-event total across partition ranges.
    pub fn committed_count(&self, table_name: &str, keyspace: &str) -> u64 {
        self.offsets
            .lock()
            .values()
            .filter(|offset| offset.table_name == table_name && offset.keyspace == keyspace)
            .map(|offset| offset.events_replicated_count)
            .sum()
    }

    fn join_values(map: &ColumnMap) -> String {
        map.values()
            .map(value_to_plain_string)
            .collect::<Vec<_>>()
            .join("\x1f")
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn destination(&self) -> Destination {
        self.destination
    }

    async fn connect(&self) -> Result<(), PipelineError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PipelineError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write_batch(&self, events: &[ChangeEvent]) -> Result<usize, PipelineError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PipelineError::sink_error("memory sink is not connected"));
        }
        if events.is_empty() {
            return Ok(0);
        }

        let delay = *self.write_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.write_faults.lock().take() {
            self.counters.record_error();
            return Err(PipelineError::sink_error(message));
        }

        let mut rows = self.rows.lock();
        for event in events {
            let pk = Self::join_values(&event.partition_key);
            match event.event_type {
                EventType::Delete => {
                    rows.retain(|(table, row_pk, _), _| {
                        !(table == &event.table_name && row_pk == &pk)
                    });
                }
                EventType::Insert | EventType::Update => {
                    let key = (
                        event.table_name.clone(),
                        pk,
                        Self::join_values(&event.clustering_key),
                    );
                    let incoming = StoredRow {
                        columns: event.columns.clone(),
                        timestamp_micros: event.timestamp_micros,
                        event_id: event.event_id.to_string(),
                    };
                    match rows.get(&key) {
                        // Last-writer-wins by writetime: an older replay
                        // never clobbers a newer row.
                        Some(existing) if existing.timestamp_micros > incoming.timestamp_micros => {}
                        _ => {
                            rows.insert(key, incoming);
                        }
                    }
                }
            }
        }
        drop(rows);

        self.counters.record_written(events.len() as u64);
        debug!(destination = %self.destination, count = events.len(), "Wrote batch to memory sink");
        Ok(events.len())
    }

    async fn commit_offsets(&self, offsets: &[ReplicationOffset]) -> Result<(), PipelineError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PipelineError::sink_error("memory sink is not connected"));
        }

        if let Some(message) = self.commit_faults.lock().take() {
            self.counters.record_error();
            return Err(PipelineError::sink_error(message));
        }

        let mut stored = self.offsets.lock();
        for offset in offsets {
            let key = offset.key();
            match stored.get(&key) {
                Some(existing)
                    if offset.last_event_timestamp_micros
                        <= existing.last_event_timestamp_micros => {}
                Some(existing) => {
                    let mut accumulated = offset.clone();
                    accumulated.events_replicated_count += existing.events_replicated_count;
                    stored.insert(key, accumulated);
                }
                None => {
                    stored.insert(key, offset.clone());
                }
            }
        }
        Ok(())
    }

    async fn latest_offset(
        &self,
        table_name: &str,
        keyspace: &str,
    ) -> Result<Option<ReplicationOffset>, PipelineError> {
        Ok(self
            .offsets
            .lock()
            .values()
            .filter(|offset| offset.table_name == table_name && offset.keyspace == keyspace)
            .max_by_key(|offset| offset.last_event_timestamp_micros)
            .cloned())
    }

    async fn health_check(&self) -> SinkHealth {
        let started = Instant::now();
        if self.connected.load(Ordering::SeqCst) {
            SinkHealth::up(started.elapsed())
        } else {
            SinkHealth::down(started.elapsed())
        }
    }

    fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_relay_domain::PartitionId;
    use serde_json::json;

    fn event(event_type: EventType, id: &str, timestamp: i64) -> ChangeEvent {
        let mut pk = ColumnMap::new();
        pk.insert("user_id".to_string(), json!(id));
        let mut cols = ColumnMap::new();
        if event_type != EventType::Delete {
            cols.insert("email".to_string(), json!(format!("{id}@example.com")));
        }
        ChangeEvent::new(
            event_type,
            "users",
            "ecommerce",
            pk,
            ColumnMap::new(),
            cols,
            timestamp,
            None,
        )
        .unwrap()
    }

    fn offset(timestamp: i64, count: u64) -> ReplicationOffset {
        ReplicationOffset::new(
            "users",
            "ecommerce",
            PartitionId::from_raw(0),
            Destination::Relational,
            "CommitLog-7-1.log",
            64,
            timestamp,
            count,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_dedupes_by_primary_key() {
        let sink = MemorySink::new(Destination::Relational);
        sink.connect().await.unwrap();

        let first = event(EventType::Insert, "u-1", 1_000_000);
        sink.write_batch(&[first.clone()]).await.unwrap();
        sink.write_batch(&[first]).await.unwrap();

        assert_eq!(sink.row_count("users"), 1);
    }

    #[tokio::test]
    async fn test_last_writer_wins_by_timestamp() {
        let sink = MemorySink::new(Destination::Relational);
        sink.connect().await.unwrap();

        sink.write_batch(&[event(EventType::Insert, "u-1", 2_000_000)])
            .await
            .unwrap();
        // Older replayed update must not clobber the newer row.
        let mut stale = event(EventType::Update, "u-1", 1_000_000);
        stale.columns.insert("email".to_string(), json!("stale@example.com"));
        sink.write_batch(&[stale]).await.unwrap();

        let row = sink.row("users", "u-1", "").unwrap();
        assert_eq!(row.timestamp_micros, 2_000_000);
        assert_eq!(row.columns["email"], json!("u-1@example.com"));
    }

    #[tokio::test]
    async fn test_delete_removes_by_partition_key() {
        let sink = MemorySink::new(Destination::Relational);
        sink.connect().await.unwrap();

        sink.write_batch(&[
            event(EventType::Insert, "u-1", 1_000_000),
            event(EventType::Insert, "u-2", 1_000_001),
            event(EventType::Delete, "u-1", 1_000_002),
        ])
        .await
        .unwrap();

        assert_eq!(sink.row_count("users"), 1);
        assert!(sink.row("users", "u-2", "").is_some());
    }

    #[tokio::test]
    async fn test_injected_write_failures_expire() {
        let sink = MemorySink::new(Destination::Relational);
        sink.connect().await.unwrap();
        sink.inject_write_failures(2, "connection reset (injected)");

        let batch = vec![event(EventType::Insert, "u-1", 1_000_000)];
        assert!(sink.write_batch(&batch).await.is_err());
        assert!(sink.write_batch(&batch).await.is_err());
        assert_eq!(sink.write_batch(&batch).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offset_accumulate_and_guard() {
        let sink = MemorySink::new(Destination::Relational);
        sink.connect().await.unwrap();

        sink.commit_offsets(&[offset(1_000_000, 10)]).await.unwrap();
        sink.commit_offsets(&[offset(1_000_010, 10)]).await.unwrap();
        // Replay of the second commit: guarded, no inflation.
        sink.commit_offsets(&[offset(1_000_010, 10)]).await.unwrap();

        assert_eq!(sink.committed_count("users", "ecommerce"), 20);
        let latest = sink.latest_offset("users", "ecommerce").await.unwrap().unwrap();
        assert_eq!(latest.last_event_timestamp_micros, 1_000_010);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let sink = MemorySink::new(Destination::Relational);
        sink.connect().await.unwrap();
        assert_eq!(sink.write_batch(&[]).await.unwrap(), 0);
        assert_eq!(sink.stats().events_written, 0);
    }
}
