// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Metrics Service
//!
//! Prometheus metrics for the relay. The registry is created once at
//! process start and the service is passed explicitly into the components
//! that record - there is no global registry and no lazy registration.
//!
//! ## Exposed series (namespace `cdc_relay`)
//!
//! - `events_processed_total{destination, table}` - counter
//! - `errors_total{destination, error_type}` - counter
//! - `events_dropped_unsupported_op_total{destination}` - counter
//! - `corrupt_frames_total` - counter
//! - `replication_lag_seconds{destination}` - gauge
//! - `events_per_second{destination}` - gauge
//! - `backlog_depth{destination}` - gauge (in-flight batches)
//! - `replication_duration_seconds{destination}` - histogram

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use tracing::debug;

use cdc_relay_domain::{Destination, PipelineError};

const NAMESPACE: &str = "cdc_relay";

/// Prometheus metrics owned by the relay process.
pub struct MetricsService {
    registry: Arc<Registry>,
    events_processed_total: IntCounterVec,
    errors_total: IntCounterVec,
    events_dropped_unsupported_op: IntCounterVec,
    corrupt_frames_total: IntCounter,
    replication_lag_seconds: GaugeVec,
    events_per_second: GaugeVec,
    backlog_depth: IntGaugeVec,
    replication_duration_seconds: HistogramVec,
}

impl MetricsService {
    /// Creates the registry and registers every series.
    pub fn new() -> Result<Self, PipelineError> {
        let registry = Registry::new();

        let events_processed_total = IntCounterVec::new(
            Opts::new("events_processed_total", "Events successfully replicated").namespace(NAMESPACE),
            &["destination", "table"],
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create events_processed_total: {e}")))?;

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Pipeline errors by destination and type").namespace(NAMESPACE),
            &["destination", "error_type"],
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create errors_total: {e}")))?;

        let events_dropped_unsupported_op = IntCounterVec::new(
            Opts::new(
                "events_dropped_unsupported_op_total",
                "Events skipped because the destination cannot express the operation",
            )
            .namespace(NAMESPACE),
            &["destination"],
        )
        .map_err(|e| {
            PipelineError::metrics_error(format!("Failed to create events_dropped_unsupported_op_total: {e}"))
        })?;

        let corrupt_frames_total = IntCounter::with_opts(
            Opts::new("corrupt_frames_total", "Corrupt frames encountered while tailing").namespace(NAMESPACE),
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create corrupt_frames_total: {e}")))?;

        let replication_lag_seconds = GaugeVec::new(
            Opts::new(
                "replication_lag_seconds",
                "Seconds between source writetime and destination commit",
            )
            .namespace(NAMESPACE),
            &["destination"],
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create replication_lag_seconds: {e}")))?;

        let events_per_second = GaugeVec::new(
            Opts::new("events_per_second", "Current delivery throughput").namespace(NAMESPACE),
            &["destination"],
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create events_per_second: {e}")))?;

        let backlog_depth = IntGaugeVec::new(
            Opts::new("backlog_depth", "Sealed-or-committing batches in flight").namespace(NAMESPACE),
            &["destination"],
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create backlog_depth: {e}")))?;

        let replication_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "replication_duration_seconds",
                "Wall-clock duration of batch write plus offset commit",
            )
            .namespace(NAMESPACE),
            &["destination"],
        )
        .map_err(|e| {
            PipelineError::metrics_error(format!("Failed to create replication_duration_seconds: {e}"))
        })?;

        registry
            .register(Box::new(events_processed_total.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register events_processed_total: {e}")))?;
        registry
            .register(Box::new(errors_total.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register errors_total: {e}")))?;
        registry
            .register(Box::new(events_dropped_unsupported_op.clone()))
            .map_err(|e| {
                PipelineError::metrics_error(format!("Failed to register events_dropped_unsupported_op_total: {e}"))
            })?;
        registry
            .register(Box::new(corrupt_frames_total.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register corrupt_frames_total: {e}")))?;
        registry
            .register(Box::new(replication_lag_seconds.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register replication_lag_seconds: {e}")))?;
        registry
            .register(Box::new(events_per_second.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register events_per_second: {e}")))?;
        registry
            .register(Box::new(backlog_depth.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register backlog_depth: {e}")))?;
        registry
            .register(Box::new(replication_duration_seconds.clone()))
            .map_err(|e| {
                PipelineError::metrics_error(format!("Failed to register replication_duration_seconds: {e}"))
            })?;

        debug!("MetricsService initialized with Prometheus registry");

        Ok(Self {
            registry: Arc::new(registry),
            events_processed_total,
            errors_total,
            events_dropped_unsupported_op,
            corrupt_frames_total,
            replication_lag_seconds,
            events_per_second,
            backlog_depth,
            replication_duration_seconds,
        })
    }

    /// Records a successfully committed batch.
    pub fn record_batch_committed(
        &self,
        destination: Destination,
        table: &str,
        events: u64,
        duration: Duration,
        lag_seconds: f64,
    ) {
        self.events_processed_total
            .with_label_values(&[destination.as_str(), table])
            .inc_by(events);
        self.replication_duration_seconds
            .with_label_values(&[destination.as_str()])
            .observe(duration.as_secs_f64());
        self.replication_lag_seconds
            .with_label_values(&[destination.as_str()])
            .set(lag_seconds.max(0.0));
    }

    /// Counts one error for a destination and error type.
    pub fn record_error(&self, destination: Destination, error_type: &str) {
        self.errors_total
            .with_label_values(&[destination.as_str(), error_type])
            .inc();
    }

    /// Counts events a destination skipped as unsupported (columnar deletes).
    pub fn record_dropped_unsupported(&self, destination: Destination, count: u64) {
        self.events_dropped_unsupported_op
            .with_label_values(&[destination.as_str()])
            .inc_by(count);
    }

    /// Counts one corrupt frame.
    pub fn record_corrupt_frame(&self) {
        self.corrupt_frames_total.inc();
    }

    /// Updates the throughput gauge for a destination.
    pub fn set_events_per_second(&self, destination: Destination, eps: f64) {
        self.events_per_second
            .with_label_values(&[destination.as_str()])
            .set(eps);
    }

    /// A batch entered the in-flight window for a destination.
    pub fn batch_in_flight(&self, destination: Destination) {
        self.backlog_depth
            .with_label_values(&[destination.as_str()])
            .inc();
    }

    /// A batch left the in-flight window for a destination.
    pub fn batch_settled(&self, destination: Destination) {
        self.backlog_depth
            .with_label_values(&[destination.as_str()])
            .dec();
    }

    /// Current backlog depth for a destination (exposed for tests).
    pub fn backlog(&self, destination: Destination) -> i64 {
        self.backlog_depth
            .with_label_values(&[destination.as_str()])
            .get()
    }

    /// Prometheus exposition-format text for scraping.
    pub fn gather(&self) -> Result<String, PipelineError> {
        let encoder = prometheus::TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .map_err(|e| PipelineError::metrics_error(format!("Failed to encode metrics: {e}")))
    }

    /// Underlying registry for advanced usage.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}
