// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! End-to-end delivery and restart scenarios: clean-shutdown resume,
//! exactly-once under an injected commit failure, and masking applied on
//! the way to the destination.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{insert_event, wait_for, write_segment, Harness};
use cdc_relay::infrastructure::sinks::MemorySink;
use cdc_relay_domain::{Destination, EventSink};

/// Resume after clean shutdown: twenty events, shutdown after the first
/// batch commits, restart, and the destination ends with exactly twenty
/// distinct rows and an accumulated offset total of twenty.
#[tokio::test]
async fn test_resume_after_clean_shutdown() {
    let harness = Harness::new();
    let events: Vec<_> = (0..20)
        .map(|i| insert_event("users", i, 1_000_000 + i64::from(i)))
        .collect();
    write_segment(&harness.commitlog_dir(), "CommitLog-7-100.log", &events);

    let sink = Arc::new(MemorySink::new(Destination::Relational));

    // First run: stop once at least one batch (10 events) has committed.
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("first batch committed", Duration::from_secs(10), move || {
            sink.committed_count("users", "ecommerce") >= 10
        })
        .await;
    }
    running.stop().await.unwrap();

    // Restart against the same destination state: the tailer resumes from
    // the persisted offset and the remainder is delivered exactly once.
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("all 20 events committed", Duration::from_secs(10), move || {
            sink.committed_count("users", "ecommerce") >= 20
        })
        .await;
    }
    running.stop().await.unwrap();

    assert_eq!(sink.row_count("users"), 20);
    assert_eq!(sink.committed_count("users", "ecommerce"), 20);

    // No event was written twice: every stored row holds a distinct event.
    let event_ids = sink.event_ids("users");
    let distinct: HashSet<_> = event_ids.iter().collect();
    assert_eq!(distinct.len(), 20);
}

/// Exactly-once under duplicate delivery: `write_batch` succeeds but the
/// first `commit_offsets` fails; the retried attempt rewrites the batch
/// (idempotently) and commits. The destination ends with the event count,
/// not twice the retried batch.
#[tokio::test]
async fn test_exactly_once_under_commit_failure() {
    let harness = Harness::new();
    let events: Vec<_> = (0..10)
        .map(|i| insert_event("users", i, 1_000_000 + i64::from(i)))
        .collect();
    write_segment(&harness.commitlog_dir(), "CommitLog-7-100.log", &events);

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    sink.inject_commit_failures(1, "connection reset by peer (injected)");

    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("batch committed after retry", Duration::from_secs(10), move || {
            sink.committed_count("users", "ecommerce") >= 10
        })
        .await;
    }
    running.stop().await.unwrap();

    assert_eq!(sink.row_count("users"), 10);
    assert_eq!(sink.committed_count("users", "ecommerce"), 10);
    // The write was attempted twice (the batch was replayed after the
    // failed commit) but rows deduplicated by primary key.
    assert!(sink.stats().events_written >= 10);
}

/// Masking applies before fan-out: PII columns arrive at the destination
/// as their SHA-256 digests, keys are untouched.
#[tokio::test]
async fn test_masking_applied_end_to_end() {
    let mut harness = Harness::new();
    harness.settings.masking.pii_patterns = vec!["email".to_string()];

    let events = vec![insert_event("users", 1, 1_000_000)];
    write_segment(&harness.commitlog_dir(), "CommitLog-7-100.log", &events);

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("event committed", Duration::from_secs(10), move || {
            sink.row_count("users") == 1
        })
        .await;
    }
    running.stop().await.unwrap();

    let row = sink.row("users", "1", "").unwrap();
    let masked = row.columns["email"].as_str().unwrap();
    // 64 hex chars, and definitely not the original address.
    assert_eq!(masked.len(), 64);
    assert!(masked.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(masked, "user1@example.com");
    // Unclassified columns pass through.
    assert_eq!(row.columns["v"], serde_json::json!("value-1"));
}

/// Independent destinations: a failure budget exhausted on one destination
/// dead-letters its copies while the other destination still delivers.
#[tokio::test]
async fn test_destinations_progress_independently() {
    let harness = Harness::new();
    let events: Vec<_> = (0..10)
        .map(|i| insert_event("users", i, 1_000_000 + i64::from(i)))
        .collect();
    write_segment(&harness.commitlog_dir(), "CommitLog-7-100.log", &events);

    let healthy = Arc::new(MemorySink::new(Destination::Relational));
    let failing = Arc::new(MemorySink::new(Destination::Timeseries));
    failing.inject_write_failures(100, "connection refused (injected)");

    let running = harness
        .spawn(vec![
            healthy.clone() as Arc<dyn EventSink>,
            failing.clone() as Arc<dyn EventSink>,
        ])
        .await;
    {
        let healthy = healthy.clone();
        wait_for("healthy sink committed", Duration::from_secs(10), move || {
            healthy.committed_count("users", "ecommerce") >= 10
        })
        .await;
    }
    let dlq = harness.dlq_reader().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if dlq.count_events(Some(Destination::Timeseries)).await.unwrap() >= 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for dead-lettered events"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    running.stop().await.unwrap();

    assert_eq!(healthy.row_count("users"), 10);
    assert_eq!(failing.row_count("users"), 0);
    assert_eq!(healthy.committed_count("users", "ecommerce"), 10);
    assert_eq!(failing.committed_count("users", "ecommerce"), 0);

    let dlq = harness.dlq_reader().await;
    assert_eq!(
        dlq.count_events(Some(Destination::Timeseries)).await.unwrap(),
        10
    );
    assert_eq!(
        dlq.count_events(Some(Destination::Relational)).await.unwrap(),
        0
    );
}
