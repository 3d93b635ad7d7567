// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Change Event Entity
//!
//! A [`ChangeEvent`] is one captured mutation (Insert, Update, or Delete)
//! read from the source commit log. It is the unit that flows through the
//! whole pipeline: decoded by the entry decoder, filtered and masked by the
//! transformer, batched by the dispatcher, and finally written by the sink
//! workers.
//!
//! ## Invariants
//!
//! All invariants are enforced at construction via [`ChangeEvent::new`]:
//!
//! - `timestamp_micros` is strictly positive (the source writetime).
//! - `partition_key` is non-empty.
//! - `columns` is empty for Delete and non-empty for Insert/Update.
//! - `captured_at` is never in the future of the wall clock.
//!
//! ## Deduplication key
//!
//! [`ChangeEvent::event_key`] derives the stable identity used by
//! destination idempotency mechanisms:
//!
//! ```text
//! {keyspace}.{table}:<pk values>:<ck values>:<timestamp_micros>
//! ```
//!
//! Two events with equal keys but different payloads are resolved by the
//! destination's last-writer-wins semantics on `timestamp_micros`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::value_objects::EventId;

/// Ordered column-name -> value mapping.
///
/// Order matters for partition and clustering keys (it mirrors the source
/// table definition), so a plain `HashMap` is not acceptable here.
pub type ColumnMap = IndexMap<String, Value>;

/// Type of captured change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// A new row was written.
    Insert,
    /// Existing row columns were overwritten.
    Update,
    /// The row identified by the partition key was removed.
    Delete,
}

impl EventType {
    /// Stable uppercase name, matching the wire and DLQ representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single data mutation captured from the source commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique identifier assigned at decode time, used for correlation.
    pub event_id: EventId,
    /// Operation discriminator.
    pub event_type: EventType,
    /// Source table name.
    pub table_name: String,
    /// Source keyspace (logical namespace).
    pub keyspace: String,
    /// Ordered partition-key columns and values. Never empty.
    pub partition_key: ColumnMap,
    /// Ordered clustering-key columns and values. May be empty.
    pub clustering_key: ColumnMap,
    /// Mutated columns. Empty for Delete, non-empty otherwise.
    pub columns: ColumnMap,
    /// Source-assigned write time in microseconds since the epoch.
    pub timestamp_micros: i64,
    /// Optional row time-to-live in seconds.
    pub ttl_seconds: Option<u32>,
    /// When the pipeline read this event from the commit log.
    pub captured_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates a validated change event with a fresh `event_id` and
    /// `captured_at` stamped to the current wall clock.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_type: EventType,
        table_name: impl Into<String>,
        keyspace: impl Into<String>,
        partition_key: ColumnMap,
        clustering_key: ColumnMap,
        columns: ColumnMap,
        timestamp_micros: i64,
        ttl_seconds: Option<u32>,
    ) -> Result<Self, PipelineError> {
        let event = Self {
            event_id: EventId::new(),
            event_type,
            table_name: table_name.into(),
            keyspace: keyspace.into(),
            partition_key,
            clustering_key,
            columns,
            timestamp_micros,
            ttl_seconds,
            captured_at: Utc::now(),
        };
        event.validate()?;
        Ok(event)
    }

    /// Validates the entity invariants. Called by [`ChangeEvent::new`];
    /// exposed for events deserialized from external representations.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.timestamp_micros <= 0 {
            return Err(PipelineError::InvalidParameter(format!(
                "timestamp_micros must be positive, got {}",
                self.timestamp_micros
            )));
        }

        if self.partition_key.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "partition_key must be non-empty".to_string(),
            ));
        }

        match self.event_type {
            EventType::Delete => {
                if !self.columns.is_empty() {
                    return Err(PipelineError::InvalidParameter(
                        "columns must be empty for DELETE events".to_string(),
                    ));
                }
            }
            EventType::Insert | EventType::Update => {
                if self.columns.is_empty() {
                    return Err(PipelineError::InvalidParameter(format!(
                        "columns required for {} events",
                        self.event_type
                    )));
                }
            }
        }

        if self.captured_at > Utc::now() {
            return Err(PipelineError::InvalidParameter(
                "captured_at cannot be in the future".to_string(),
            ));
        }

        Ok(())
    }

    /// Stable deduplication key: table, partition values, clustering values,
    /// and writetime.
    pub fn event_key(&self) -> String {
        let pk = join_values(&self.partition_key);
        let ck = join_values(&self.clustering_key);
        format!(
            "{}.{}:{}:{}:{}",
            self.keyspace, self.table_name, pk, ck, self.timestamp_micros
        )
    }

    /// Fully-qualified `keyspace.table` name, used for scope filtering and
    /// registry lookups.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.keyspace, self.table_name)
    }

    /// All key columns (partition first, then clustering), in order. This is
    /// the primary key destinations use for upserts.
    pub fn key_columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.partition_key.iter().chain(self.clustering_key.iter())
    }
}

/// Renders a JSON value the way a human (or a dedup key) expects: strings
/// without surrounding quotes, everything else in JSON notation.
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn join_values(map: &ColumnMap) -> String {
    map.values()
        .map(value_to_plain_string)
        .collect::<Vec<_>>()
        .join("_")
}
