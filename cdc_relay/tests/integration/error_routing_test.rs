// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Error routing through the full pipeline: undecodable entries and
//! validation failures dead-letter without stopping delivery, corrupt
//! frames skip the rest of their segment, and the non-monotonic-offset
//! invariant holds.

use std::sync::Arc;
use std::time::Duration;

use crate::common::{frame, insert_event, wait_for, write_raw_segment, write_segment, Harness};
use cdc_relay::infrastructure::decoder::encode_entry;
use cdc_relay::infrastructure::offsets::OffsetManager;
use cdc_relay::infrastructure::sinks::MemorySink;
use cdc_relay_domain::{Destination, EventSink, PartitionId, PipelineError, ReplicationOffset};

/// An unparseable entry between two good ones dead-letters with
/// `parse_error` while both good events deliver.
#[tokio::test]
async fn test_undecodable_entry_dead_letters_and_pipeline_continues() {
    let harness = Harness::new();

    let good_before = encode_entry(&insert_event("users", 1, 1_000_000)).unwrap();
    let good_after = encode_entry(&insert_event("users", 2, 1_000_001)).unwrap();
    write_raw_segment(
        &harness.commitlog_dir(),
        "CommitLog-7-100.log",
        &[
            frame(&good_before),
            frame(b"this is not a decodable entry"),
            frame(&good_after),
        ],
    );

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("good events committed", Duration::from_secs(10), move || {
            sink.row_count("users") == 2
        })
        .await;
    }
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.entries_read, 3);
    assert_eq!(summary.events_dead_lettered, 1);

    let dlq = harness.dlq_reader().await;
    let records = dlq.read_records(Some(Destination::Relational)).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_type, "parse_error");
    assert_eq!(records[0].event_type, "UNKNOWN");
}

/// A corrupt frame halts its segment; entries in the next segment still
/// arrive. No DLQ record is produced (there is no event).
#[tokio::test]
async fn test_corrupt_frame_skips_segment_without_dlq() {
    let harness = Harness::new();

    // Segment 100: one good entry, then a zero length prefix.
    let good = encode_entry(&insert_event("users", 1, 1_000_000)).unwrap();
    write_raw_segment(
        &harness.commitlog_dir(),
        "CommitLog-7-100.log",
        &[frame(&good), 0u32.to_be_bytes().to_vec()],
    );
    // Segment 200: a good entry that must still be delivered.
    write_segment(
        &harness.commitlog_dir(),
        "CommitLog-7-200.log",
        &[insert_event("users", 2, 1_000_001)],
    );

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("both segments delivered", Duration::from_secs(10), move || {
            sink.row_count("users") == 2
        })
        .await;
    }
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.corrupt_frames, 1);
    let dlq = harness.dlq_reader().await;
    assert_eq!(dlq.count_events(None).await.unwrap(), 0);
}

/// Events outside the configured scope are filtered, not dead-lettered.
#[tokio::test]
async fn test_out_of_scope_events_filtered() {
    let harness = Harness::new();
    // Harness scopes to ecommerce.users; the sessions event is dropped.
    write_segment(
        &harness.commitlog_dir(),
        "CommitLog-7-100.log",
        &[
            insert_event("users", 1, 1_000_000),
            insert_event("sessions", 1, 1_000_001),
        ],
    );

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("in-scope event committed", Duration::from_secs(10), move || {
            sink.row_count("users") == 1
        })
        .await;
    }
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.events_filtered, 1);
    assert_eq!(sink.row_count("sessions"), 0);
    let dlq = harness.dlq_reader().await;
    assert_eq!(dlq.count_events(None).await.unwrap(), 0);
}

/// Non-monotonic offset rejection: the second, older write fails and the
/// stored offset is untouched.
#[tokio::test]
async fn test_non_monotonic_offset_rejected() {
    let manager = OffsetManager::new();

    let first = ReplicationOffset::new(
        "users",
        "ecommerce",
        PartitionId::from_raw(0),
        Destination::Relational,
        "CommitLog-7-100.log",
        512,
        1000,
        10,
    )
    .unwrap();
    manager.write(first.clone()).unwrap();

    let stale = ReplicationOffset::new(
        "users",
        "ecommerce",
        PartitionId::from_raw(0),
        Destination::Relational,
        "CommitLog-7-100.log",
        1024,
        999,
        10,
    )
    .unwrap();

    let result = manager.write(stale);
    assert!(matches!(result, Err(PipelineError::NonMonotonicOffset(_))));
    assert!(result.unwrap_err().is_fatal());

    let stored = manager.read(&first.key()).unwrap();
    assert_eq!(stored.last_event_timestamp_micros, 1000);
    assert_eq!(stored.commitlog_position, 512);
}

/// Committed offsets observed over a full run are monotonic per key in
/// both writetime and segment coordinate.
#[tokio::test]
async fn test_committed_offsets_are_monotonic_end_to_end() {
    let harness = Harness::new();
    for (segment, base) in [("CommitLog-7-100.log", 0u32), ("CommitLog-7-200.log", 30)] {
        let events: Vec<_> = (base..base + 30)
            .map(|i| insert_event("users", i, 1_000_000 + i64::from(i)))
            .collect();
        write_segment(&harness.commitlog_dir(), segment, &events);
    }

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("all events committed", Duration::from_secs(15), move || {
            sink.committed_count("users", "ecommerce") >= 60
        })
        .await;
    }
    running.stop().await.unwrap();

    // The sink saw every event exactly once and the final offset points at
    // the later segment.
    assert_eq!(sink.row_count("users"), 60);
    let latest = sink.latest_offset("users", "ecommerce").await.unwrap().unwrap();
    assert_eq!(latest.commitlog_file, "CommitLog-7-200.log");

    // The offset manager's view agrees: had any commit gone backwards, the
    // run would have aborted on the fatal invariant instead.
    let resume = harness
        .offsets
        .resume_point("users", "ecommerce", &[Destination::Relational])
        .unwrap();
    assert_eq!(resume.segment_file, "CommitLog-7-200.log");
}
