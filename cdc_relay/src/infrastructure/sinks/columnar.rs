// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Columnar Append Sink
//!
//! Destination writer for columnar analytical warehouses without
//! transactions. Idempotency comes from the destination's merge-on-read
//! deduplication: batches are plain appends, replays land duplicate rows,
//! and readers collapse them by primary key and writetime. Offset commits
//! are separate writes guarded by the timestamp condition, so replaying a
//! commit never inflates the running event count.
//!
//! Delete events cannot be expressed against an append-only analytical
//! table. They are skipped, logged, and counted in the per-destination
//! `events_dropped_unsupported_op_total` metric - a deliberate, visible
//! limitation of the analytical-append family rather than silent loss.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use cdc_relay_domain::{
    ChangeEvent, Destination, EventSink, EventType, PipelineError, ReplicationOffset,
    SinkCounters, SinkHealth, SinkStats,
};

use crate::infrastructure::metrics::MetricsService;
use crate::infrastructure::sinks::sql;

/// Sink for the columnar (append-only, non-transactional) family.
pub struct ColumnarSink {
    database_url: String,
    pool_size: u32,
    pool: OnceCell<SqlitePool>,
    counters: SinkCounters,
    connected: AtomicBool,
    metrics: Option<Arc<MetricsService>>,
}

impl ColumnarSink {
    /// Creates a columnar sink. `metrics` feeds the dropped-delete counter;
    /// tests may pass `None`.
    pub fn new(
        database_url: impl Into<String>,
        pool_size: u32,
        metrics: Option<Arc<MetricsService>>,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            pool_size,
            pool: OnceCell::new(),
            counters: SinkCounters::new(),
            connected: AtomicBool::new(false),
            metrics,
        }
    }

    fn pool(&self) -> Result<&SqlitePool, PipelineError> {
        self.pool
            .get()
            .filter(|_| self.connected.load(Ordering::SeqCst))
            .ok_or_else(|| PipelineError::sink_error("columnar sink is not connected"))
    }
}

#[async_trait]
impl EventSink for ColumnarSink {
    fn destination(&self) -> Destination {
        Destination::Columnar
    }

    async fn connect(&self) -> Result<(), PipelineError> {
        let pool = self
            .pool
            .get_or_try_init(|| sql::connect_pool(&self.database_url, self.pool_size))
            .await?;
        sql::ensure_offsets_table(pool).await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to columnar destination");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PipelineError> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from columnar destination");
        Ok(())
    }

    async fn write_batch(&self, events: &[ChangeEvent]) -> Result<usize, PipelineError> {
        if events.is_empty() {
            return Ok(0);
        }
        let pool = self.pool()?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| PipelineError::sink_error(format!("acquire: {e}")))?;

        let mut written = 0usize;
        let mut dropped = 0u64;

        for event in events {
            if event.event_type == EventType::Delete {
                warn!(
                    table = %event.table_name,
                    event_id = %event.event_id,
                    "Delete events are not supported by the columnar destination, skipping"
                );
                dropped += 1;
                continue;
            }

            if let Err(error) = sql::append_event(&mut conn, event).await {
                self.counters.record_error();
                return Err(error);
            }
            written += 1;
        }

        if dropped > 0 {
            self.counters.record_dropped_unsupported(dropped);
            if let Some(metrics) = &self.metrics {
                metrics.record_dropped_unsupported(Destination::Columnar, dropped);
            }
        }

        self.counters.record_written(written as u64);
        debug!(count = written, dropped, "Wrote batch to columnar destination");
        Ok(written)
    }

    async fn commit_offsets(&self, offsets: &[ReplicationOffset]) -> Result<(), PipelineError> {
        // No transactions here: the offset write is separate from the data
        // appends and deduplicates on its own primary key.
        let pool = self.pool()?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| PipelineError::sink_error(format!("acquire: {e}")))?;
        for offset in offsets {
            if let Err(error) = sql::upsert_offset(&mut conn, offset).await {
                self.counters.record_error();
                return Err(error);
            }
        }
        debug!(count = offsets.len(), "Committed offsets to columnar destination");
        Ok(())
    }

    async fn latest_offset(
        &self,
        table_name: &str,
        keyspace: &str,
    ) -> Result<Option<ReplicationOffset>, PipelineError> {
        sql::read_latest_offset(self.pool()?, table_name, keyspace, Destination::Columnar).await
    }

    async fn health_check(&self) -> SinkHealth {
        let started = Instant::now();
        match self.pool() {
            Ok(pool) => match sql::ping(pool).await {
                Ok(()) => SinkHealth::up(started.elapsed()),
                Err(error) => {
                    warn!(error = %error, "Columnar health check failed");
                    SinkHealth::down(started.elapsed())
                }
            },
            Err(_) => SinkHealth::down(started.elapsed()),
        }
    }

    fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }
}
