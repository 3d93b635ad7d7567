// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Backpressure bounds memory: with a small in-flight window and a slow
//! sink, the dispatcher never holds more batches than the window allows,
//! and delivery still completes.

use std::sync::Arc;
use std::time::Duration;

use crate::common::{insert_event, wait_for, write_segment, Harness};
use cdc_relay::infrastructure::sinks::MemorySink;
use cdc_relay_domain::{Destination, EventSink};

/// `max_in_flight_batches = 2` against a sink delayed per batch: the
/// backlog gauge (sealed-or-committing batches) never exceeds the window,
/// and every event is eventually delivered exactly once.
#[tokio::test]
async fn test_backpressure_caps_in_flight_batches() {
    const EVENTS: u32 = 300;
    const MAX_IN_FLIGHT: i64 = 2;

    let mut harness = Harness::new();
    harness.settings.pipeline.max_in_flight_batches = MAX_IN_FLIGHT as usize;
    harness.settings.pipeline.batch_size = 10;

    let events: Vec<_> = (0..EVENTS)
        .map(|i| insert_event("users", i, 1_000_000 + i64::from(i)))
        .collect();
    write_segment(&harness.commitlog_dir(), "CommitLog-7-100.log", &events);

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    sink.set_write_delay(Duration::from_millis(15));

    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;

    // Sample the in-flight gauge while the slow sink grinds through the
    // backlog. The dispatch edge is the bounded channel, so the gauge can
    // never exceed the window plus the single batch a worker holds.
    let mut max_observed = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let backlog = harness.metrics.backlog(Destination::Relational);
        max_observed = max_observed.max(backlog);
        assert!(
            backlog <= MAX_IN_FLIGHT + 1,
            "backlog {backlog} exceeded the in-flight window"
        );

        if sink.committed_count("users", "ecommerce") >= u64::from(EVENTS) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "delivery did not complete under backpressure"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    running.stop().await.unwrap();

    assert_eq!(sink.row_count("users"), EVENTS as usize);
    assert_eq!(
        sink.committed_count("users", "ecommerce"),
        u64::from(EVENTS)
    );
    // The cap was actually exercised, not just never reached.
    assert!(max_observed >= 1, "backpressure window never filled");
}

/// A slow destination does not stall a fast one beyond the shared
/// parallelism budget: both deliver completely.
#[tokio::test]
async fn test_slow_destination_does_not_block_fast_one() {
    let harness = Harness::new();
    let events: Vec<_> = (0..50)
        .map(|i| insert_event("users", i, 1_000_000 + i64::from(i)))
        .collect();
    write_segment(&harness.commitlog_dir(), "CommitLog-7-100.log", &events);

    let fast = Arc::new(MemorySink::new(Destination::Relational));
    let slow = Arc::new(MemorySink::new(Destination::Columnar));
    slow.set_write_delay(Duration::from_millis(20));

    let running = harness
        .spawn(vec![
            fast.clone() as Arc<dyn EventSink>,
            slow.clone() as Arc<dyn EventSink>,
        ])
        .await;

    {
        let fast = fast.clone();
        let slow = slow.clone();
        wait_for("both destinations complete", Duration::from_secs(30), move || {
            fast.committed_count("users", "ecommerce") >= 50
                && slow.committed_count("users", "ecommerce") >= 50
        })
        .await;
    }
    running.stop().await.unwrap();

    assert_eq!(fast.row_count("users"), 50);
    assert_eq!(slow.row_count("users"), 50);
}
