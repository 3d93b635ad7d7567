// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Common Test Helpers
//!
//! Shared utilities for the integration tests: authoring commit-log
//! segments in the wire format, building pipelines against in-memory
//! sinks, and waiting on asynchronous conditions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use cdc_relay::application::{Pipeline, PipelineSummary};
use cdc_relay::infrastructure::config::settings::RelaySettings;
use cdc_relay::infrastructure::decoder::{encode_entry, JsonEntryDecoder};
use cdc_relay::infrastructure::dlq::DeadLetterWriter;
use cdc_relay::infrastructure::masking::MaskingTransformer;
use cdc_relay::infrastructure::metrics::MetricsService;
use cdc_relay::infrastructure::offsets::OffsetManager;
use cdc_relay::infrastructure::schema::SchemaRegistry;
use cdc_relay_bootstrap::ShutdownCoordinator;
use cdc_relay_domain::entities::change_event::{ColumnMap, EventType};
use cdc_relay_domain::{ChangeEvent, EventSink, PipelineError};

/// Builds an Insert event for `table` with `pk {"id": id}`.
pub fn insert_event(table: &str, id: u32, timestamp: i64) -> ChangeEvent {
    let mut pk = ColumnMap::new();
    pk.insert("id".to_string(), json!(i64::from(id)));
    let mut columns = ColumnMap::new();
    columns.insert("v".to_string(), json!(format!("value-{id}")));
    columns.insert("email".to_string(), json!(format!("user{id}@example.com")));
    ChangeEvent::new(
        EventType::Insert,
        table,
        "ecommerce",
        pk,
        ColumnMap::new(),
        columns,
        timestamp,
        None,
    )
    .unwrap()
}

/// Frames a raw payload with the 4-byte big-endian length prefix.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
    framed.extend_from_slice(payload);
    framed
}

/// Writes events into a segment file in the wire format.
pub fn write_segment(dir: &Path, name: &str, events: &[ChangeEvent]) {
    let mut data = Vec::new();
    for event in events {
        data.extend_from_slice(&frame(&encode_entry(event).unwrap()));
    }
    std::fs::write(dir.join(name), data).unwrap();
}

/// Appends pre-framed bytes to a segment file.
pub fn write_raw_segment(dir: &Path, name: &str, frames: &[Vec<u8>]) {
    let mut data = Vec::new();
    for framed in frames {
        data.extend_from_slice(framed);
    }
    std::fs::write(dir.join(name), data).unwrap();
}

/// Test fixture holding the shared pipeline collaborators.
pub struct Harness {
    pub root: TempDir,
    pub settings: RelaySettings,
    pub registry: Arc<SchemaRegistry>,
    pub offsets: Arc<OffsetManager>,
    pub metrics: Arc<MetricsService>,
}

impl Harness {
    /// Creates a harness with fast test tuning: batch size 10, 20 ms poll
    /// interval, 3 quick retry attempts, masking disabled.
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let commitlog = root.path().join("commitlog");
        std::fs::create_dir_all(&commitlog).unwrap();

        let mut settings = RelaySettings::default();
        settings.source.keyspace = "ecommerce".to_string();
        settings.source.commitlog_directory = commitlog;
        settings.pipeline.batch_size = 10;
        settings.pipeline.poll_interval_ms = 20;
        settings.pipeline.max_in_flight_batches = 8;
        settings.pipeline.max_parallelism = 4;
        settings.pipeline.tables = vec!["ecommerce.users".to_string()];
        settings.retry.max_attempts = 3;
        settings.retry.base_delay_ms = 10;
        settings.retry.max_delay_ms = 100;
        settings.retry.jitter = false;
        settings.masking.pii_patterns = Vec::new();
        settings.masking.phi_patterns = Vec::new();
        settings.dlq_directory = root.path().join("dlq");
        settings.validate().unwrap();

        Self {
            root,
            settings,
            registry: Arc::new(SchemaRegistry::new()),
            offsets: Arc::new(OffsetManager::new()),
            metrics: Arc::new(MetricsService::new().unwrap()),
        }
    }

    /// Commit-log directory segments are written into.
    pub fn commitlog_dir(&self) -> PathBuf {
        self.settings.source.commitlog_directory.clone()
    }

    /// A DLQ reader over the harness's dead-letter directory.
    pub async fn dlq_reader(&self) -> DeadLetterWriter {
        DeadLetterWriter::new(self.settings.dlq_directory.clone())
            .await
            .unwrap()
    }

    /// Spawns a pipeline over `sinks` with a fresh shutdown coordinator.
    pub async fn spawn(&self, sinks: Vec<Arc<dyn EventSink>>) -> RunningPipeline {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(10));
        let dlq = Arc::new(
            DeadLetterWriter::new(self.settings.dlq_directory.clone())
                .await
                .unwrap(),
        );
        let masking = Arc::new(MaskingTransformer::new(&self.settings.masking).unwrap());

        let pipeline = Arc::new(Pipeline::new(
            self.settings.clone(),
            Arc::new(JsonEntryDecoder::new()),
            sinks,
            Arc::clone(&self.registry),
            masking,
            Arc::clone(&self.offsets),
            dlq,
            Arc::clone(&self.metrics),
            coordinator.clone(),
        ));

        let handle = tokio::spawn(async move { pipeline.run().await });
        RunningPipeline {
            coordinator,
            handle,
        }
    }
}

/// Handle to a pipeline running on a background task.
pub struct RunningPipeline {
    pub coordinator: ShutdownCoordinator,
    handle: JoinHandle<Result<PipelineSummary, PipelineError>>,
}

impl RunningPipeline {
    /// Initiates shutdown and waits for the run result.
    pub async fn stop(self) -> Result<PipelineSummary, PipelineError> {
        self.coordinator.initiate_shutdown();
        self.handle.await.expect("pipeline task panicked")
    }
}

/// Polls `condition` every 10 ms until it holds or `timeout` expires.
pub async fn wait_for(description: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
