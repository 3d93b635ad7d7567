// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dispatcher and Sink Workers
//!
//! Fans sealed micro-batches out to one worker task per destination and
//! enforces the pipeline's delivery guarantees:
//!
//! - **Backpressure**: each destination gets a bounded channel of
//!   `max_in_flight_batches` capacity. When a destination falls behind,
//!   [`Dispatcher::dispatch`] blocks, the pipeline loop stops pulling from
//!   the tailer, and the tailer naturally stalls. Memory is bounded
//!   end-to-end with no unbounded buffering anywhere.
//! - **Ordering**: a single worker per destination consumes its channel
//!   sequentially, so batches for any `(table, destination)` commit in
//!   strict submission order - the precondition for offset monotonicity.
//! - **Parallelism**: workers for different destinations run concurrently,
//!   bounded by a shared semaphore of `max_parallelism` permits around the
//!   write-plus-commit section.
//!
//! A batch that exhausts its retry budget (or hits a permanent error) moves
//! to the DLQ and the worker advances; the offset does not. Only the
//! non-monotonic-offset invariant kills a worker, and through it the
//! pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cdc_relay_bootstrap::CancellationToken;
use cdc_relay_domain::{
    Destination, EventSink, PartitionId, PipelineError, ReplicationOffset,
};

use crate::application::batcher::MicroBatch;
use crate::infrastructure::dlq::DeadLetterWriter;
use crate::infrastructure::metrics::MetricsService;
use crate::infrastructure::offsets::OffsetManager;
use crate::infrastructure::retry::{retry_with_policy, RetryPolicy};

/// Fan-out node between the pipeline loop and the sink workers.
pub struct Dispatcher {
    senders: HashMap<Destination, mpsc::Sender<MicroBatch>>,
    workers: Vec<(Destination, JoinHandle<Result<(), PipelineError>>)>,
    metrics: Arc<MetricsService>,
}

impl Dispatcher {
    /// Spawns one worker task per sink and wires the bounded channels.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        sinks: Vec<Arc<dyn EventSink>>,
        policy: RetryPolicy,
        offsets: Arc<OffsetManager>,
        dlq: Arc<DeadLetterWriter>,
        metrics: Arc<MetricsService>,
        max_in_flight_batches: usize,
        max_parallelism: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let parallelism = Arc::new(Semaphore::new(max_parallelism));
        let mut senders = HashMap::new();
        let mut workers = Vec::new();

        for sink in sinks {
            let destination = sink.destination();
            let (sender, receiver) = mpsc::channel(max_in_flight_batches);
            senders.insert(destination, sender);

            let handle = tokio::spawn(run_sink_worker(
                sink,
                receiver,
                policy.clone(),
                Arc::clone(&offsets),
                Arc::clone(&dlq),
                Arc::clone(&metrics),
                Arc::clone(&parallelism),
                shutdown.clone(),
            ));
            workers.push((destination, handle));
        }

        info!(
            destinations = workers.len(),
            max_in_flight_batches, max_parallelism, "Dispatcher spawned sink workers"
        );

        Self {
            senders,
            workers,
            metrics,
        }
    }

    /// Destinations with a live worker.
    pub fn destinations(&self) -> Vec<Destination> {
        let mut destinations: Vec<Destination> = self.senders.keys().copied().collect();
        destinations.sort();
        destinations
    }

    /// Hands a sealed batch to its destination's worker.
    ///
    /// Blocks when the destination's in-flight window is full - this is the
    /// backpressure edge the tailer stalls behind.
    pub async fn dispatch(&self, batch: MicroBatch) -> Result<(), PipelineError> {
        let destination = batch.destination;
        let sender = self.senders.get(&destination).ok_or_else(|| {
            PipelineError::internal_error(format!("no sink worker for destination {destination}"))
        })?;

        sender.send(batch).await.map_err(|_| {
            PipelineError::internal_error(format!("sink worker for {destination} terminated"))
        })?;
        self.metrics.batch_in_flight(destination);
        Ok(())
    }

    /// Closes the channels and waits for the workers to drain.
    ///
    /// Every already-dispatched batch gets its commit attempt; `deadline`
    /// bounds the wait per worker. Fatal worker errors (the monotonicity
    /// invariant) propagate out of here.
    pub async fn drain(self, deadline: Duration) -> Result<(), PipelineError> {
        drop(self.senders);

        let mut fatal = None;
        for (destination, mut handle) in self.workers {
            match tokio::time::timeout(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {
                    debug!(destination = %destination, "Sink worker drained");
                }
                Ok(Ok(Err(error))) => {
                    warn!(destination = %destination, error = %error, "Sink worker failed");
                    fatal.get_or_insert(error);
                }
                Ok(Err(join_error)) => {
                    fatal.get_or_insert(PipelineError::internal_error(format!(
                        "sink worker for {destination} panicked: {join_error}"
                    )));
                }
                Err(_) => {
                    warn!(destination = %destination, "Drain deadline expired, aborting worker");
                    handle.abort();
                }
            }
        }

        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Per-destination worker loop: strict FIFO over the channel, bounded by
/// the shared parallelism semaphore.
#[allow(clippy::too_many_arguments)]
async fn run_sink_worker(
    sink: Arc<dyn EventSink>,
    mut receiver: mpsc::Receiver<MicroBatch>,
    policy: RetryPolicy,
    offsets: Arc<OffsetManager>,
    dlq: Arc<DeadLetterWriter>,
    metrics: Arc<MetricsService>,
    parallelism: Arc<Semaphore>,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    let destination = sink.destination();

    while let Some(mut batch) = receiver.recv().await {
        let permit = parallelism
            .acquire()
            .await
            .map_err(|_| PipelineError::internal_error("parallelism semaphore closed"))?;

        let outcome = commit_batch(
            &sink, &mut batch, &policy, &offsets, &dlq, &metrics, &shutdown,
        )
        .await;

        drop(permit);
        metrics.batch_settled(destination);
        outcome?;
    }

    if let Err(error) = sink.disconnect().await {
        warn!(destination = %destination, error = %error, "Error disconnecting sink");
    }
    info!(destination = %destination, "Sink worker stopped");
    Ok(())
}

/// Drives one batch through Committing to Committed or Failed.
///
/// Returns `Err` only for fatal conditions; delivery failures are absorbed
/// into the DLQ and the worker keeps going.
async fn commit_batch(
    sink: &Arc<dyn EventSink>,
    batch: &mut MicroBatch,
    policy: &RetryPolicy,
    offsets: &OffsetManager,
    dlq: &DeadLetterWriter,
    metrics: &MetricsService,
    shutdown: &CancellationToken,
) -> Result<(), PipelineError> {
    batch.begin_commit()?;

    let destination = batch.destination;
    let started = Instant::now();
    let batch_offsets = build_offsets(batch)?;

    let events = &batch.events;
    let offsets_ref = &batch_offsets;
    let operation = format!("{}:{}.{}", destination, batch.keyspace, batch.table_name);

    let result = retry_with_policy(policy, &operation, shutdown, || async move {
        let written = sink.write_batch(events).await?;
        sink.commit_offsets(offsets_ref).await?;
        Ok(written)
    })
    .await;

    match result {
        Ok(written) => {
            for offset in batch_offsets {
                // NonMonotonicOffset here is a commit-ordering bug: fatal.
                offsets.write(offset)?;
            }
            batch.complete()?;

            let lag_seconds =
                (Utc::now().timestamp_micros() - batch.last_timestamp_micros()) as f64 / 1e6;
            metrics.record_batch_committed(
                destination,
                &batch.table_name,
                written as u64,
                started.elapsed(),
                lag_seconds,
            );
            metrics.set_events_per_second(destination, sink.stats().throughput_eps);

            debug!(
                destination = %destination,
                table = %batch.table_name,
                events = batch.len(),
                written,
                "Batch committed"
            );
            Ok(())
        }
        Err(error) if error.is_fatal() => Err(error),
        Err(error) => {
            batch.fail()?;
            metrics.record_error(destination, error.error_type());
            warn!(
                destination = %destination,
                table = %batch.table_name,
                events = batch.len(),
                error = %error,
                "Batch failed, routing events to DLQ"
            );
            for event in &batch.events {
                dlq.write_event(event, destination, &error).await;
            }
            Ok(())
        }
    }
}

/// One offset per partition range the batch touched, all positioned at the
/// batch's end coordinate.
fn build_offsets(batch: &MicroBatch) -> Result<Vec<ReplicationOffset>, PipelineError> {
    let mut per_range: IndexMap<PartitionId, (i64, u64)> = IndexMap::new();
    for event in &batch.events {
        let range = PartitionId::from_partition_key(&event.partition_key);
        let entry = per_range.entry(range).or_insert((0, 0));
        entry.0 = entry.0.max(event.timestamp_micros);
        entry.1 += 1;
    }

    per_range
        .into_iter()
        .map(|(range, (last_timestamp, count))| {
            ReplicationOffset::new(
                batch.table_name.clone(),
                batch.keyspace.clone(),
                range,
                batch.destination,
                batch.end_position.segment_file.clone(),
                batch.end_position.position,
                last_timestamp,
                count,
            )
        })
        .collect()
}
