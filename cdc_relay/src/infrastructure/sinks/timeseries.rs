// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Time-Series Sink
//!
//! Destination writer for the time-series warehouse family. The write path
//! is identical to the relational sink (transactional upsert, joint offset
//! commit), so this type *composes* [`TransactionalSqlSink`] instead of
//! extending the sink contract: the only time-series-specific behavior is a
//! hypertable-extension assertion at connect time, which stays out of the
//! capability set.
//!
//! The assertion probes the destination's extension catalog and only warns
//! on failure - a plain relational destination still accepts the writes, it
//! just will not get hypertable partitioning.

use async_trait::async_trait;
use tracing::{info, warn};

use cdc_relay_domain::{
    ChangeEvent, Destination, EventSink, PipelineError, ReplicationOffset, SinkHealth, SinkStats,
};

use crate::infrastructure::sinks::relational::TransactionalSqlSink;

/// Sink for the time-series warehouse family.
pub struct TimeSeriesSink {
    inner: TransactionalSqlSink,
}

impl TimeSeriesSink {
    /// Creates a time-series sink.
    pub fn new(database_url: impl Into<String>, pool_size: u32) -> Self {
        Self {
            inner: TransactionalSqlSink::new(Destination::Timeseries, database_url, pool_size),
        }
    }

    /// Probes for the time-series extension catalog; warns when absent.
    async fn verify_timeseries_extension(&self) -> Result<(), PipelineError> {
        let pool = self.inner.pool()?;
        let probe = sqlx::query("SELECT extname FROM pg_extension WHERE extname = 'timescaledb'")
            .fetch_optional(pool)
            .await;

        match probe {
            Ok(Some(_)) => info!("Time-series extension verified"),
            Ok(None) => warn!("Time-series extension not found on destination"),
            Err(error) => {
                warn!(error = %error, "Could not verify time-series extension")
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for TimeSeriesSink {
    fn destination(&self) -> Destination {
        Destination::Timeseries
    }

    async fn connect(&self) -> Result<(), PipelineError> {
        self.inner.connect().await?;
        self.verify_timeseries_extension().await
    }

    async fn disconnect(&self) -> Result<(), PipelineError> {
        self.inner.disconnect().await
    }

    async fn write_batch(&self, events: &[ChangeEvent]) -> Result<usize, PipelineError> {
        self.inner.write_batch(events).await
    }

    async fn commit_offsets(&self, offsets: &[ReplicationOffset]) -> Result<(), PipelineError> {
        self.inner.commit_offsets(offsets).await
    }

    async fn latest_offset(
        &self,
        table_name: &str,
        keyspace: &str,
    ) -> Result<Option<ReplicationOffset>, PipelineError> {
        self.inner.latest_offset(table_name, keyspace).await
    }

    async fn health_check(&self) -> SinkHealth {
        self.inner.health_check().await
    }

    fn stats(&self) -> SinkStats {
        self.inner.stats()
    }
}
