// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Shared SQL Sink Helpers
//!
//! Statement builders and executors shared by the SQL-backed sinks. The
//! relational and time-series sinks compose these instead of inheriting
//! from each other; the columnar sink reuses the append and offset pieces.
//!
//! Destination data tables are owned by the destination (the relay never
//! issues DDL against them); only the `cdc_offsets` bookkeeping table is
//! created here.
//!
//! ## Offset upsert guard
//!
//! The offsets upsert accumulates `events_replicated_count` but only when
//! the incoming `last_event_timestamp_micros` advances past the stored one.
//! Replaying a commit (crash between destination commit and pipeline
//! acknowledgment) therefore cannot inflate the running total, which is the
//! offset-commit idempotency the exactly-once accounting rests on.

use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};

use serde_json::Value;
use tracing::{debug, info};

use cdc_relay_domain::{
    ChangeEvent, Destination, EventType, PartitionId, PipelineError, ReplicationOffset,
};

/// Creates (if needed) and connects a SQLite-backed pool for a sink.
pub async fn connect_pool(database_url: &str, pool_size: u32) -> Result<SqlitePool, PipelineError> {
    use sqlx::migrate::MigrateDatabase;

    if !sqlx::Sqlite::database_exists(database_url)
        .await
        .unwrap_or(false)
    {
        debug!(url = %database_url, "Database does not exist, creating");
        sqlx::Sqlite::create_database(database_url)
            .await
            .map_err(|e| PipelineError::sink_error(format!("create database: {e}")))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .connect(database_url)
        .await
        .map_err(|e| PipelineError::sink_error(format!("connect: {e}")))?;

    Ok(pool)
}

/// Ensures the offsets bookkeeping table exists.
pub async fn ensure_offsets_table(pool: &SqlitePool) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cdc_offsets (
            offset_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            keyspace TEXT NOT NULL,
            partition_id INTEGER NOT NULL,
            destination TEXT NOT NULL,
            commitlog_file TEXT NOT NULL,
            commitlog_position INTEGER NOT NULL,
            last_event_timestamp_micros INTEGER NOT NULL,
            last_committed_at TEXT NOT NULL,
            events_replicated_count INTEGER NOT NULL,
            PRIMARY KEY (table_name, keyspace, partition_id, destination)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| PipelineError::sink_error(format!("ensure offsets table: {e}")))?;

    info!("Offsets table is ready");
    Ok(())
}

/// Quotes an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Binds a JSON value onto a query as the closest SQL type.
fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
        Value::Number(n) => query.bind(n.as_f64()),
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Writes one event with upsert-keyed idempotency.
///
/// Insert/Update become `INSERT ... ON CONFLICT (pk, ck) DO UPDATE`;
/// Delete removes rows by partition key.
pub async fn upsert_event(
    conn: &mut SqliteConnection,
    event: &ChangeEvent,
) -> Result<(), PipelineError> {
    if event.event_type == EventType::Delete {
        let predicates: Vec<String> = event
            .partition_key
            .keys()
            .map(|name| format!("{} = ?", quote_ident(name)))
            .collect();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(&event.table_name),
            predicates.join(" AND ")
        );

        let mut query = sqlx::query(&sql);
        for value in event.partition_key.values() {
            query = bind_value(query, value);
        }
        query
            .execute(conn)
            .await
            .map_err(|e| PipelineError::sink_error(format!("delete: {e}")))?;
        return Ok(());
    }

    let key_columns: Vec<&String> = event
        .partition_key
        .keys()
        .chain(event.clustering_key.keys())
        .collect();
    let all_columns: Vec<&String> = key_columns
        .iter()
        .copied()
        .chain(event.columns.keys())
        .collect();

    let column_list: Vec<String> = all_columns.iter().map(|name| quote_ident(name)).collect();
    let placeholders = vec!["?"; all_columns.len()].join(", ");
    let conflict_target: Vec<String> = key_columns.iter().map(|name| quote_ident(name)).collect();

    let updates: Vec<String> = event
        .columns
        .keys()
        .map(|name| format!("{0} = excluded.{0}", quote_ident(name)))
        .collect();

    let sql = if updates.is_empty() {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
            quote_ident(&event.table_name),
            column_list.join(", "),
            placeholders,
            conflict_target.join(", "),
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            quote_ident(&event.table_name),
            column_list.join(", "),
            placeholders,
            conflict_target.join(", "),
            updates.join(", "),
        )
    };

    let mut query = sqlx::query(&sql);
    for value in event
        .partition_key
        .values()
        .chain(event.clustering_key.values())
        .chain(event.columns.values())
    {
        query = bind_value(query, value);
    }
    query
        .execute(conn)
        .await
        .map_err(|e| PipelineError::sink_error(format!("upsert: {e}")))?;
    Ok(())
}

/// Appends one event without conflict handling (merge-on-read tables).
pub async fn append_event(
    conn: &mut SqliteConnection,
    event: &ChangeEvent,
) -> Result<(), PipelineError> {
    let all_columns: Vec<&String> = event
        .partition_key
        .keys()
        .chain(event.clustering_key.keys())
        .chain(event.columns.keys())
        .collect();

    let column_list: Vec<String> = all_columns.iter().map(|name| quote_ident(name)).collect();
    let placeholders = vec!["?"; all_columns.len()].join(", ");

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&event.table_name),
        column_list.join(", "),
        placeholders,
    );

    let mut query = sqlx::query(&sql);
    for value in event
        .partition_key
        .values()
        .chain(event.clustering_key.values())
        .chain(event.columns.values())
    {
        query = bind_value(query, value);
    }
    query
        .execute(conn)
        .await
        .map_err(|e| PipelineError::sink_error(format!("append: {e}")))?;
    Ok(())
}

/// Upserts one offset row with the timestamp-guarded accumulate.
pub async fn upsert_offset(
    conn: &mut SqliteConnection,
    offset: &ReplicationOffset,
) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        INSERT INTO cdc_offsets (
            offset_id, table_name, keyspace, partition_id, destination,
            commitlog_file, commitlog_position, last_event_timestamp_micros,
            last_committed_at, events_replicated_count
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (table_name, keyspace, partition_id, destination)
        DO UPDATE SET
            offset_id = excluded.offset_id,
            commitlog_file = excluded.commitlog_file,
            commitlog_position = excluded.commitlog_position,
            last_event_timestamp_micros = excluded.last_event_timestamp_micros,
            last_committed_at = excluded.last_committed_at,
            events_replicated_count =
                cdc_offsets.events_replicated_count + excluded.events_replicated_count
        WHERE excluded.last_event_timestamp_micros > cdc_offsets.last_event_timestamp_micros
        "#,
    )
    .bind(offset.offset_id.to_string())
    .bind(&offset.table_name)
    .bind(&offset.keyspace)
    .bind(offset.partition_id.as_i64())
    .bind(offset.destination.as_str())
    .bind(&offset.commitlog_file)
    .bind(offset.commitlog_position as i64)
    .bind(offset.last_event_timestamp_micros)
    .bind(offset.last_committed_at.to_rfc3339())
    .bind(offset.events_replicated_count as i64)
    .execute(conn)
    .await
    .map_err(|e| PipelineError::sink_error(format!("commit offset: {e}")))?;
    Ok(())
}

/// Reads the latest offset for a table across partition ranges.
pub async fn read_latest_offset(
    pool: &SqlitePool,
    table_name: &str,
    keyspace: &str,
    destination: Destination,
) -> Result<Option<ReplicationOffset>, PipelineError> {
    let row = sqlx::query(
        r#"
        SELECT offset_id, table_name, keyspace, partition_id, destination,
               commitlog_file, commitlog_position, last_event_timestamp_micros,
               last_committed_at, events_replicated_count
        FROM cdc_offsets
        WHERE table_name = ? AND keyspace = ? AND destination = ?
        ORDER BY last_event_timestamp_micros DESC
        LIMIT 1
        "#,
    )
    .bind(table_name)
    .bind(keyspace)
    .bind(destination.as_str())
    .fetch_optional(pool)
    .await
    .map_err(|e| PipelineError::sink_error(format!("read offset: {e}")))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let offset_id: String = row
        .try_get("offset_id")
        .map_err(|e| PipelineError::sink_error(e.to_string()))?;
    let partition_id: i64 = row
        .try_get("partition_id")
        .map_err(|e| PipelineError::sink_error(e.to_string()))?;
    let destination_tag: String = row
        .try_get("destination")
        .map_err(|e| PipelineError::sink_error(e.to_string()))?;
    let commitlog_file: String = row
        .try_get("commitlog_file")
        .map_err(|e| PipelineError::sink_error(e.to_string()))?;
    let commitlog_position: i64 = row
        .try_get("commitlog_position")
        .map_err(|e| PipelineError::sink_error(e.to_string()))?;
    let last_event_timestamp_micros: i64 = row
        .try_get("last_event_timestamp_micros")
        .map_err(|e| PipelineError::sink_error(e.to_string()))?;
    let last_committed_at: String = row
        .try_get("last_committed_at")
        .map_err(|e| PipelineError::sink_error(e.to_string()))?;
    let events_replicated_count: i64 = row
        .try_get("events_replicated_count")
        .map_err(|e| PipelineError::sink_error(e.to_string()))?;

    Ok(Some(ReplicationOffset {
        offset_id: offset_id
            .parse()
            .map_err(|e| PipelineError::sink_error(format!("offset_id: {e}")))?,
        table_name: table_name.to_string(),
        keyspace: keyspace.to_string(),
        partition_id: PartitionId::from_raw(partition_id),
        destination: Destination::parse(&destination_tag)?,
        commitlog_file,
        commitlog_position: commitlog_position.max(0) as u64,
        last_event_timestamp_micros,
        last_committed_at: chrono::DateTime::parse_from_rfc3339(&last_committed_at)
            .map_err(|e| PipelineError::sink_error(format!("last_committed_at: {e}")))?
            .with_timezone(&chrono::Utc),
        events_replicated_count: events_replicated_count.max(0) as u64,
    }))
}

/// Simple liveness probe.
pub async fn ping(pool: &SqlitePool) -> Result<(), PipelineError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| PipelineError::sink_error(format!("ping: {e}")))?;
    Ok(())
}
