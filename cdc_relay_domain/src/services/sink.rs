// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Event Sink Contract
//!
//! [`EventSink`] is the capability-set contract every destination writer
//! implements: lifecycle (`connect`/`disconnect`), idempotent batch writes,
//! offset commit, a cheap health probe, and a destination tag. There is no
//! inheritance hierarchy - a sink value is anything exposing these
//! capabilities - and destination-specific extras (like a time-series
//! hypertable assertion) belong in construction, not in the contract.
//!
//! ## Exactly-once split
//!
//! `write_batch` must be idempotent at the granularity of the event's
//! primary key: replaying a batch after a crash produces the same rows as
//! writing it once. `commit_offsets` persists the replay positions; for
//! destinations with transactions it shares a single transaction with the
//! preceding `write_batch`, for the rest it relies on the destination's own
//! deduplication (merge-on-read tables, guarded offset upserts).
//!
//! Offsets are committed as a group because one micro-batch can span
//! several partition ranges; transactional destinations commit the whole
//! group atomically with the data.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::entities::change_event::ChangeEvent;
use crate::entities::replication_offset::{Destination, ReplicationOffset};
use crate::error::PipelineError;

/// Result of a sink health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkHealth {
    /// Whether the destination answered the probe.
    pub healthy: bool,
    /// Probe round-trip latency.
    pub latency: Duration,
}

impl SinkHealth {
    /// A healthy probe result with the measured latency.
    pub fn up(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
        }
    }

    /// An unhealthy probe result with the measured latency.
    pub fn down(latency: Duration) -> Self {
        Self {
            healthy: false,
            latency,
        }
    }
}

/// Point-in-time snapshot of a sink's delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SinkStats {
    /// Events written since the sink was created.
    pub events_written: u64,
    /// Errors observed since the sink was created.
    pub errors: u64,
    /// Delete events skipped because the destination cannot express them.
    pub dropped_unsupported: u64,
    /// Moving-average throughput in events per second.
    pub throughput_eps: f64,
}

/// Destination writer capability set.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Tag identifying which destination family this sink writes to.
    fn destination(&self) -> Destination;

    /// Establishes the connection to the destination.
    async fn connect(&self) -> Result<(), PipelineError>;

    /// Closes the connection to the destination.
    async fn disconnect(&self) -> Result<(), PipelineError>;

    /// Writes a batch of events in insertion order, idempotently per event
    /// primary key. Returns the number of events written.
    async fn write_batch(&self, events: &[ChangeEvent]) -> Result<usize, PipelineError>;

    /// Persists the offsets for a committed batch, one per partition range
    /// the batch touched. Jointly atomic with the preceding `write_batch`
    /// where the destination supports transactions.
    async fn commit_offsets(&self, offsets: &[ReplicationOffset]) -> Result<(), PipelineError>;

    /// Reads the latest persisted offset for a table across all partition
    /// ranges, used to choose the resume point at startup.
    async fn latest_offset(
        &self,
        table_name: &str,
        keyspace: &str,
    ) -> Result<Option<ReplicationOffset>, PipelineError>;

    /// Cheap liveness probe with measured latency.
    async fn health_check(&self) -> SinkHealth;

    /// Current delivery statistics.
    fn stats(&self) -> SinkStats;
}

/// Shared statistics tracker for sink implementations.
///
/// Sinks compose one of these rather than inheriting counter behavior.
/// Throughput is a moving average over the last few write samples, matching
/// what the health surface reports as events/sec.
#[derive(Debug)]
pub struct SinkCounters {
    state: Mutex<CounterState>,
}

#[derive(Debug)]
struct CounterState {
    events_written: u64,
    errors: u64,
    dropped_unsupported: u64,
    last_write: Option<Instant>,
    samples: Vec<f64>,
}

/// Number of throughput samples kept for the moving average.
const MAX_THROUGHPUT_SAMPLES: usize = 10;

impl SinkCounters {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState {
                events_written: 0,
                errors: 0,
                dropped_unsupported: 0,
                last_write: None,
                samples: Vec::with_capacity(MAX_THROUGHPUT_SAMPLES),
            }),
        }
    }

    /// Records a successful write of `count` events and samples throughput.
    pub fn record_written(&self, count: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.events_written += count;

        let now = Instant::now();
        if let Some(last) = state.last_write {
            let elapsed = now.duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                if state.samples.len() == MAX_THROUGHPUT_SAMPLES {
                    state.samples.remove(0);
                }
                let sample = count as f64 / elapsed;
                state.samples.push(sample);
            }
        }
        state.last_write = Some(now);
    }

    /// Records one observed error.
    pub fn record_error(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.errors += 1;
    }

    /// Records events skipped because the destination cannot express the
    /// operation (columnar deletes).
    pub fn record_dropped_unsupported(&self, count: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.dropped_unsupported += count;
    }

    /// Snapshot of the counters.
    pub fn snapshot(&self) -> SinkStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let throughput_eps = if state.samples.is_empty() {
            0.0
        } else {
            state.samples.iter().sum::<f64>() / state.samples.len() as f64
        };
        SinkStats {
            events_written: state.events_written,
            errors: state.errors,
            dropped_unsupported: state.dropped_unsupported,
            throughput_eps,
        }
    }
}

impl Default for SinkCounters {
    fn default() -> Self {
        Self::new()
    }
}
