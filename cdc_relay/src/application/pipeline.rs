// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Orchestrator
//!
//! Wires the stages together and runs the main loop:
//!
//! ```text
//! tailer → decoder → scope filter → compatibility gate → validator
//!        → masking → batcher → dispatcher → sink workers → offsets
//! ```
//!
//! ## Startup
//!
//! Sinks connect first; then each destination's persisted offsets are read
//! back and seeded into the offset manager, and the tailer resumes from the
//! minimum `(segment, position)` across destinations with progress - no
//! destination skips entries, destinations that are ahead deduplicate
//! replays through their idempotent writes.
//!
//! ## Error routing
//!
//! Per-entry failures never stop the loop: undecodable entries, validation
//! failures, and events for paused tables dead-letter (one record per
//! enabled destination) and the loop continues. Corrupt frames are counted
//! and skipped at segment granularity by the tailer. Only a fatal error -
//! the monotonicity invariant - aborts the run.
//!
//! ## Shutdown
//!
//! On cancellation the loop stops pulling from the tailer, seals whatever
//! is open, dispatches it, and waits for the workers to drain within the
//! coordinator's deadline. Nothing is silently dropped: batches that cannot
//! commit in time are recovered on restart from the persisted offsets.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use cdc_relay_bootstrap::{CancellationToken, ShutdownCoordinator};
use cdc_relay_domain::{
    ChangeEvent, Destination, EntryDecoder, EventSink, PipelineError, SegmentPosition,
};

use crate::application::batcher::Batcher;
use crate::application::dispatcher::Dispatcher;
use crate::infrastructure::config::settings::RelaySettings;
use crate::infrastructure::dlq::DeadLetterWriter;
use crate::infrastructure::masking::MaskingTransformer;
use crate::infrastructure::metrics::MetricsService;
use crate::infrastructure::offsets::OffsetManager;
use crate::infrastructure::schema::{EventValidator, SchemaRegistry};
use crate::infrastructure::tailer::{CommitLogTailer, TailerItem};

/// Counters reported after a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Framed entries read from the commit log.
    pub entries_read: u64,
    /// Event copies handed to the batcher (events times destinations).
    pub events_dispatched: u64,
    /// Events dropped by the scope filter.
    pub events_filtered: u64,
    /// Dead-letter records written from the loop (delivery failures inside
    /// the workers are counted separately by the DLQ itself).
    pub events_dead_lettered: u64,
    /// Corrupt frames skipped.
    pub corrupt_frames: u64,
}

/// The assembled replication pipeline.
pub struct Pipeline {
    settings: RelaySettings,
    decoder: Arc<dyn EntryDecoder>,
    sinks: Vec<Arc<dyn EventSink>>,
    registry: Arc<SchemaRegistry>,
    masking: Arc<MaskingTransformer>,
    offsets: Arc<OffsetManager>,
    dlq: Arc<DeadLetterWriter>,
    metrics: Arc<MetricsService>,
    coordinator: ShutdownCoordinator,
}

impl Pipeline {
    /// Assembles a pipeline from its collaborators. Nothing connects or
    /// spawns until [`Pipeline::run`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: RelaySettings,
        decoder: Arc<dyn EntryDecoder>,
        sinks: Vec<Arc<dyn EventSink>>,
        registry: Arc<SchemaRegistry>,
        masking: Arc<MaskingTransformer>,
        offsets: Arc<OffsetManager>,
        dlq: Arc<DeadLetterWriter>,
        metrics: Arc<MetricsService>,
        coordinator: ShutdownCoordinator,
    ) -> Self {
        Self {
            settings,
            decoder,
            sinks,
            registry,
            masking,
            offsets,
            dlq,
            metrics,
            coordinator,
        }
    }

    /// Schema registry shared with external schema-change feeds.
    pub fn registry(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs the pipeline until shutdown. Returns the run summary, or the
    /// fatal error that aborted it.
    pub async fn run(&self) -> Result<PipelineSummary, PipelineError> {
        for sink in &self.sinks {
            sink.connect().await?;
        }
        let destinations: Vec<Destination> =
            self.sinks.iter().map(|sink| sink.destination()).collect();
        info!(destinations = ?destinations, "All sinks connected");

        let resume = self.seed_offsets_and_resume(&destinations).await?;
        match &resume {
            Some(position) => info!(resume = %position, "Resuming from persisted offsets"),
            None => info!("No persisted offsets, starting from the oldest segment"),
        }

        let shutdown = self.coordinator.token();
        let dispatcher = Dispatcher::spawn(
            self.sinks.clone(),
            self.settings.retry.policy(),
            Arc::clone(&self.offsets),
            Arc::clone(&self.dlq),
            Arc::clone(&self.metrics),
            self.settings.pipeline.max_in_flight_batches,
            self.settings.pipeline.max_parallelism,
            shutdown.clone(),
        );

        let tailer = CommitLogTailer::new(
            self.settings.source.commitlog_directory.clone(),
            self.settings.pipeline.poll_interval(),
            resume,
        );
        let mut stream = Box::pin(tailer.stream(shutdown.clone()));

        let mut batcher = Batcher::new(self.settings.pipeline.batch_size);
        let validator = EventValidator::new(Arc::clone(&self.registry));
        let mut summary = PipelineSummary::default();

        let loop_result = self
            .run_loop(
                &mut stream,
                &mut batcher,
                &dispatcher,
                &validator,
                &destinations,
                &shutdown,
                &mut summary,
            )
            .await;

        // Final seal: whatever was open when the loop ended still gets its
        // commit attempt inside the drain window.
        if loop_result.is_ok() {
            match batcher.seal_open() {
                Ok(remaining) => {
                    for batch in remaining {
                        if let Err(dispatch_error) = dispatcher.dispatch(batch).await {
                            warn!(error = %dispatch_error, "Could not dispatch final batch");
                            break;
                        }
                    }
                }
                Err(seal_error) => warn!(error = %seal_error, "Could not seal final batches"),
            }
        }

        let drain_result = dispatcher.drain(self.coordinator.drain_deadline()).await;
        self.coordinator.complete_shutdown();

        drain_result?;
        loop_result?;
        info!(
            entries = summary.entries_read,
            dispatched = summary.events_dispatched,
            "Pipeline stopped cleanly"
        );
        Ok(summary)
    }

    /// Reads persisted offsets back from every sink for the configured
    /// tables and returns the tailer resume coordinate.
    async fn seed_offsets_and_resume(
        &self,
        destinations: &[Destination],
    ) -> Result<Option<SegmentPosition>, PipelineError> {
        let mut resume: Option<SegmentPosition> = None;

        for qualified in &self.settings.pipeline.tables {
            let Some((keyspace, table_name)) = qualified.split_once('.') else {
                continue;
            };

            for sink in &self.sinks {
                if let Some(offset) = sink.latest_offset(table_name, keyspace).await? {
                    debug!(
                        destination = %offset.destination,
                        table = %qualified,
                        position = %offset.segment_position(),
                        "Seeded persisted offset"
                    );
                    self.offsets.write(offset)?;
                }
            }

            if let Some(point) = self.offsets.resume_point(table_name, keyspace, destinations) {
                resume = match resume {
                    Some(current) => Some(current.min(point)),
                    None => Some(point),
                };
            }
        }

        Ok(resume)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop<S: Stream<Item = TailerItem> + Send>(
        &self,
        stream: &mut Pin<Box<S>>,
        batcher: &mut Batcher,
        dispatcher: &Dispatcher,
        validator: &EventValidator,
        destinations: &[Destination],
        shutdown: &CancellationToken,
        summary: &mut PipelineSummary,
    ) -> Result<(), PipelineError> {
        while let Some(item) = stream.next().await {
            match item {
                TailerItem::Entry(entry) => {
                    summary.entries_read += 1;

                    let event = match self.decoder.decode(&entry.payload) {
                        Ok(event) => event,
                        Err(decode_error) => {
                            for destination in destinations {
                                self.metrics
                                    .record_error(*destination, decode_error.error_type());
                                self.dlq
                                    .write_undecodable(
                                        &entry.segment_file,
                                        entry.position,
                                        &entry.payload,
                                        *destination,
                                        &decode_error,
                                    )
                                    .await;
                                summary.events_dead_lettered += 1;
                            }
                            continue;
                        }
                    };

                    if !self.in_scope(&event) {
                        summary.events_filtered += 1;
                        continue;
                    }

                    if self.registry.is_paused(&event.keyspace, &event.table_name) {
                        let gate_error = PipelineError::SchemaIncompatible(format!(
                            "table {} is paused by an incompatible schema version",
                            event.qualified_table()
                        ));
                        self.dead_letter_event(&event, destinations, &gate_error, summary)
                            .await;
                        continue;
                    }

                    if let Err(validation_error) = validator.validate(&event) {
                        self.dead_letter_event(&event, destinations, &validation_error, summary)
                            .await;
                        continue;
                    }
                    // Advisory only; mismatching columns are logged inside.
                    let _ = validator.type_mismatches(&event);

                    let masked_event = match self.masking.apply(&event.columns) {
                        Ok(columns) => {
                            let mut masked = event;
                            masked.columns = columns;
                            masked
                        }
                        Err(masking_error) => {
                            self.dead_letter_event(&event, destinations, &masking_error, summary)
                                .await;
                            continue;
                        }
                    };

                    // The coordinate after this entry, recorded by offsets.
                    let next_position =
                        SegmentPosition::new(entry.segment_file, entry.next_position);

                    for destination in destinations {
                        if let Some(sealed) = batcher.accept(
                            masked_event.clone(),
                            *destination,
                            next_position.clone(),
                        )? {
                            dispatcher.dispatch(sealed).await?;
                        }
                        summary.events_dispatched += 1;
                    }
                }

                TailerItem::CorruptFrame {
                    segment,
                    position,
                    reason,
                } => {
                    error!(
                        segment = %segment,
                        position,
                        reason = %reason,
                        "Corrupt frame, rest of segment skipped"
                    );
                    self.metrics.record_corrupt_frame();
                    summary.corrupt_frames += 1;
                }

                TailerItem::Idle => {
                    // Poll cycle ended: seal partial batches so events do
                    // not sit in the batcher across quiet periods.
                    for batch in batcher.seal_open()? {
                        dispatcher.dispatch(batch).await?;
                    }
                }
            }

            if shutdown.is_cancelled() {
                info!("Shutdown signal observed, leaving main loop");
                break;
            }
        }
        Ok(())
    }

    /// Scope filter: the configured keyspace, and the configured table list
    /// when one is present.
    fn in_scope(&self, event: &ChangeEvent) -> bool {
        if event.keyspace != self.settings.source.keyspace {
            return false;
        }
        let tables = &self.settings.pipeline.tables;
        tables.is_empty() || tables.iter().any(|entry| *entry == event.qualified_table())
    }

    async fn dead_letter_event(
        &self,
        event: &ChangeEvent,
        destinations: &[Destination],
        error: &PipelineError,
        summary: &mut PipelineSummary,
    ) {
        for destination in destinations {
            self.metrics.record_error(*destination, error.error_type());
            self.dlq.write_event(event, *destination, error).await;
            summary.events_dead_lettered += 1;
        }
    }
}
