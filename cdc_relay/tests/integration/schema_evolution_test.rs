// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Schema incompatibility pauses exactly one table: the widened table keeps
//! delivering while the narrowed one dead-letters, and registering a
//! compatible successor resumes it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::common::{wait_for, write_segment, Harness};
use cdc_relay::infrastructure::sinks::MemorySink;
use cdc_relay_domain::entities::change_event::{ColumnMap, EventType};
use cdc_relay_domain::entities::schema_version::ColumnDef;
use cdc_relay_domain::{ChangeEvent, Destination, EventSink};

fn event_for(table: &str, id: u32, timestamp: i64) -> ChangeEvent {
    let mut pk = ColumnMap::new();
    pk.insert("id".to_string(), json!(i64::from(id)));
    let mut columns = ColumnMap::new();
    columns.insert("v".to_string(), json!(format!("value-{id}")));
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

fn columns(value_type: &str) -> Vec<ColumnDef> {
    vec![
        ColumnDef::partition("id", "int"),
        ColumnDef::regular("v", value_type),
    ]
}

/// Table `users` evolves int -> bigint (compatible widening); table
/// `sessions` evolves text -> int (incompatible narrowing). Ten events
/// each: all ten users events deliver, all ten sessions events dead-letter
/// with `schema_incompatibility`, and only the users offset advances.
#[tokio::test]
async fn test_incompatibility_pauses_one_table_only() {
    let mut harness = Harness::new();
    harness.settings.pipeline.tables = vec![
        "ecommerce.users".to_string(),
        "ecommerce.sessions".to_string(),
    ];

    // users: v1 {id:int, v:int} -> v2 {id:int, v:bigint}, widening.
    harness
        .registry
        .evolve("ecommerce", "users", columns("int"), vec!["id".to_string()], vec![])
        .unwrap();
    harness
        .registry
        .evolve("ecommerce", "users", columns("bigint"), vec!["id".to_string()], vec![])
        .unwrap();

    // sessions: v1 {id:int, v:text} -> v2 {id:int, v:int}, narrowing.
    harness
        .registry
        .evolve("ecommerce", "sessions", columns("text"), vec!["id".to_string()], vec![])
        .unwrap();
    harness
        .registry
        .evolve("ecommerce", "sessions", columns("int"), vec!["id".to_string()], vec![])
        .unwrap();

    assert!(!harness.registry.is_paused("ecommerce", "users"));
    assert!(harness.registry.is_paused("ecommerce", "sessions"));

    let mut events = Vec::new();
    for i in 0..10 {
        events.push(event_for("users", i, 1_000_000 + i64::from(i)));
        events.push(event_for("sessions", i, 1_000_000 + i64::from(i)));
    }
    write_segment(&harness.commitlog_dir(), "CommitLog-7-100.log", &events);

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;
    {
        let sink = sink.clone();
        wait_for("users events committed", Duration::from_secs(10), move || {
            sink.committed_count("users", "ecommerce") >= 10
        })
        .await;
    }
    // All ten sessions events must be dead-lettered before shutdown, too.
    let dlq = harness.dlq_reader().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if dlq.count_events(Some(Destination::Relational)).await.unwrap() >= 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for sessions events in the DLQ"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let summary = running.stop().await.unwrap();

    // All users events delivered, no sessions event reached the sink.
    assert_eq!(sink.row_count("users"), 10);
    assert_eq!(sink.row_count("sessions"), 0);

    // users offset advanced; sessions offset did not.
    assert_eq!(sink.committed_count("users", "ecommerce"), 10);
    assert_eq!(sink.committed_count("sessions", "ecommerce"), 0);

    // Every sessions event is in the DLQ with the incompatibility tag.
    let dlq = harness.dlq_reader().await;
    let records = dlq.read_records(Some(Destination::Relational)).await.unwrap();
    let incompatible: Vec<_> = records
        .iter()
        .filter(|record| record.error_type == "schema_incompatibility")
        .collect();
    assert_eq!(incompatible.len(), 10);
    assert!(incompatible.iter().all(|record| record.table_name == "sessions"));

    assert_eq!(summary.events_dead_lettered, 10);
}

/// Registering a fully-compatible successor version resumes a paused table.
#[tokio::test]
async fn test_compatible_successor_resumes_delivery() {
    let mut harness = Harness::new();
    harness.settings.pipeline.tables = vec!["ecommerce.sessions".to_string()];

    harness
        .registry
        .evolve("ecommerce", "sessions", columns("text"), vec!["id".to_string()], vec![])
        .unwrap();
    harness
        .registry
        .evolve("ecommerce", "sessions", columns("int"), vec!["id".to_string()], vec![])
        .unwrap();
    assert!(harness.registry.is_paused("ecommerce", "sessions"));

    // The incompatible version dead-letters the first event.
    write_segment(
        &harness.commitlog_dir(),
        "CommitLog-7-100.log",
        &[event_for("sessions", 1, 1_000_000)],
    );

    let sink = Arc::new(MemorySink::new(Destination::Relational));
    let running = harness
        .spawn(vec![sink.clone() as Arc<dyn EventSink>])
        .await;

    let dlq = harness.dlq_reader().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if dlq.count_events(Some(Destination::Relational)).await.unwrap() >= 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no DLQ record");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // v3 widens int -> bigint: the table resumes and new events deliver.
    harness
        .registry
        .evolve("ecommerce", "sessions", columns("bigint"), vec!["id".to_string()], vec![])
        .unwrap();
    assert!(!harness.registry.is_paused("ecommerce", "sessions"));

    write_segment(
        &harness.commitlog_dir(),
        "CommitLog-7-200.log",
        &[event_for("sessions", 2, 1_000_001)],
    );
    {
        let sink = sink.clone();
        wait_for("post-resume event committed", Duration::from_secs(10), move || {
            sink.row_count("sessions") == 1
        })
        .await;
    }
    running.stop().await.unwrap();

    assert_eq!(sink.committed_count("sessions", "ecommerce"), 1);
}
