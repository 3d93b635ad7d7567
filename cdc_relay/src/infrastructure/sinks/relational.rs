// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Transactional SQL Sink
//!
//! Destination writer for transactional SQL warehouses. Exactly-once comes
//! from two pieces working together:
//!
//! - `write_batch` executes idempotent upserts keyed on the event's
//!   partition plus clustering columns inside an open transaction;
//! - `commit_offsets` upserts the replay positions into `cdc_offsets`
//!   within the *same* transaction and commits it, making data and offsets
//!   jointly atomic.
//!
//! A crash between the two calls rolls the data back with the uncommitted
//! transaction; a replay after a committed batch hits the upsert conflict
//! path and changes nothing.
//!
//! The bundled implementation runs on SQLite, which exercises the identical
//! transaction discipline production warehouse drivers implement behind the
//! same [`EventSink`] contract. The time-series sink composes this type
//! rather than subclassing it (see `timeseries.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use cdc_relay_domain::{
    ChangeEvent, Destination, EventSink, PipelineError, ReplicationOffset, SinkCounters,
    SinkHealth, SinkStats,
};

use crate::infrastructure::sinks::sql;

/// Sink for transactional SQL destinations.
pub struct TransactionalSqlSink {
    destination: Destination,
    database_url: String,
    pool_size: u32,
    pool: OnceCell<SqlitePool>,
    open_tx: Mutex<Option<Transaction<'static, Sqlite>>>,
    counters: SinkCounters,
    connected: AtomicBool,
}

impl TransactionalSqlSink {
    /// Creates a sink for the relational warehouse family.
    pub fn relational(database_url: impl Into<String>, pool_size: u32) -> Self {
        Self::new(Destination::Relational, database_url, pool_size)
    }

    /// Creates a sink with an explicit destination tag. Used by the
    /// time-series sink, which shares the transactional write path.
    pub(crate) fn new(
        destination: Destination,
        database_url: impl Into<String>,
        pool_size: u32,
    ) -> Self {
        Self {
            destination,
            database_url: database_url.into(),
            pool_size,
            pool: OnceCell::new(),
            open_tx: Mutex::new(None),
            counters: SinkCounters::new(),
            connected: AtomicBool::new(false),
        }
    }

    /// Connected pool, or a sink error when `connect` has not run.
    pub(crate) fn pool(&self) -> Result<&SqlitePool, PipelineError> {
        self.pool
            .get()
            .filter(|_| self.connected.load(Ordering::SeqCst))
            .ok_or_else(|| {
                PipelineError::sink_error(format!("{} sink is not connected", self.destination))
            })
    }
}

#[async_trait]
impl EventSink for TransactionalSqlSink {
    fn destination(&self) -> Destination {
        self.destination
    }

    async fn connect(&self) -> Result<(), PipelineError> {
        let pool = self
            .pool
            .get_or_try_init(|| sql::connect_pool(&self.database_url, self.pool_size))
            .await?;
        sql::ensure_offsets_table(pool).await?;
        self.connected.store(true, Ordering::SeqCst);
        info!(destination = %self.destination, "Connected to SQL destination");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PipelineError> {
        // Dropping an open transaction rolls it back.
        self.open_tx.lock().await.take();
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(destination = %self.destination, "Disconnected from SQL destination");
        Ok(())
    }

    async fn write_batch(&self, events: &[ChangeEvent]) -> Result<usize, PipelineError> {
        if events.is_empty() {
            return Ok(0);
        }
        let pool = self.pool()?;

        let mut guard = self.open_tx.lock().await;
        if guard.take().is_some() {
            // A previous attempt failed between write and commit; its
            // transaction rolls back here and the batch is rewritten.
            warn!(destination = %self.destination, "Discarding stale open transaction");
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| PipelineError::sink_error(format!("begin: {e}")))?;

        for event in events {
            if let Err(error) = sql::upsert_event(&mut tx, event).await {
                self.counters.record_error();
                return Err(error);
            }
        }

        *guard = Some(tx);
        self.counters.record_written(events.len() as u64);
        debug!(destination = %self.destination, count = events.len(), "Wrote batch (uncommitted)");
        Ok(events.len())
    }

    async fn commit_offsets(&self, offsets: &[ReplicationOffset]) -> Result<(), PipelineError> {
        let mut guard = self.open_tx.lock().await;

        match guard.take() {
            Some(mut tx) => {
                for offset in offsets {
                    if let Err(error) = sql::upsert_offset(&mut tx, offset).await {
                        self.counters.record_error();
                        return Err(error);
                    }
                }
                tx.commit()
                    .await
                    .map_err(|e| {
                        self.counters.record_error();
                        PipelineError::sink_error(format!("commit: {e}"))
                    })?;
            }
            None => {
                // No data was written for this batch (e.g., every event was
                // filtered); offsets still advance, autocommitted.
                let pool = self.pool()?;
                let mut conn = pool
                    .acquire()
                    .await
                    .map_err(|e| PipelineError::sink_error(format!("acquire: {e}")))?;
                for offset in offsets {
                    sql::upsert_offset(&mut conn, offset).await?;
                }
            }
        }

        debug!(destination = %self.destination, count = offsets.len(), "Committed offsets");
        Ok(())
    }

    async fn latest_offset(
        &self,
        table_name: &str,
        keyspace: &str,
    ) -> Result<Option<ReplicationOffset>, PipelineError> {
        sql::read_latest_offset(self.pool()?, table_name, keyspace, self.destination).await
    }

    async fn health_check(&self) -> SinkHealth {
        let started = Instant::now();
        match self.pool() {
            Ok(pool) => match sql::ping(pool).await {
                Ok(()) => SinkHealth::up(started.elapsed()),
                Err(error) => {
                    warn!(destination = %self.destination, error = %error, "Health check failed");
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
