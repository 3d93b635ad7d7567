// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dead Letter Record Entity
//!
//! A [`DeadLetterRecord`] captures the full contents of a change event that
//! could not be delivered to a destination, plus the failure context. Records
//! are serialized one-per-line into `dlq_<destination>_<YYYY-MM-DD>.jsonl`
//! files for later analysis and replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::change_event::{ChangeEvent, ColumnMap};
use crate::entities::replication_offset::Destination;
use crate::error::PipelineError;
use crate::value_objects::EventId;

/// A failed event routed to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Original event identifier.
    pub event_id: EventId,
    /// Original event type name (`INSERT`, `UPDATE`, `DELETE`), or
    /// `UNKNOWN` for entries that never decoded into an event.
    pub event_type: String,
    /// Source table name (empty when undecodable).
    pub table_name: String,
    /// Source keyspace (empty when undecodable).
    pub keyspace: String,
    /// Partition key of the failed event.
    pub partition_key: ColumnMap,
    /// Clustering key of the failed event.
    pub clustering_key: ColumnMap,
    /// Column payload of the failed event (post-masking).
    pub columns: ColumnMap,
    /// Source writetime of the failed event (0 when undecodable).
    pub timestamp_micros: i64,
    /// When the pipeline captured the event.
    pub captured_at: DateTime<Utc>,
    /// Original TTL, if any.
    pub ttl_seconds: Option<u32>,
    /// Destination the delivery failed for.
    pub destination: String,
    /// Stable error classification (`parse_error`, `schema_validation`,
    /// `schema_incompatibility`, `write_error`).
    pub error_type: String,
    /// Human-readable failure detail.
    pub error_message: String,
    /// When the event was routed to the DLQ.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Builds a record from a decoded event and the error that killed it.
    pub fn from_event(
        event: &ChangeEvent,
        destination: Destination,
        error: &PipelineError,
    ) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type.as_str().to_string(),
            table_name: event.table_name.clone(),
            keyspace: event.keyspace.clone(),
            partition_key: event.partition_key.clone(),
            clustering_key: event.clustering_key.clone(),
            columns: event.columns.clone(),
            timestamp_micros: event.timestamp_micros,
            captured_at: event.captured_at,
            ttl_seconds: event.ttl_seconds,
            destination: destination.as_str().to_string(),
            error_type: error.error_type().to_string(),
            error_message: error.to_string(),
            failed_at: Utc::now(),
        }
    }

    /// Builds a record for a well-framed entry that never became an event.
    ///
    /// Event-shaped fields are blank; the segment coordinate and a hex
    /// preview of the payload are folded into `error_message` so the entry
    /// can still be located for replay.
    pub fn from_undecodable(
        segment: &str,
        position: u64,
        payload: &[u8],
        destination: Destination,
        error: &PipelineError,
    ) -> Self {
        const PREVIEW_BYTES: usize = 32;
        let preview = hex::encode(&payload[..payload.len().min(PREVIEW_BYTES)]);

        Self {
            event_id: EventId::new(),
            event_type: "UNKNOWN".to_string(),
            table_name: String::new(),
            keyspace: String::new(),
            partition_key: ColumnMap::new(),
            clustering_key: ColumnMap::new(),
            columns: ColumnMap::new(),
            timestamp_micros: 0,
            captured_at: Utc::now(),
            ttl_seconds: None,
            destination: destination.as_str().to_string(),
            error_type: error.error_type().to_string(),
            error_message: format!(
                "{error} (segment={segment}, position={position}, payload[..{}]={preview})",
                payload.len().min(PREVIEW_BYTES)
            ),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::change_event::EventType;
    use serde_json::json;

    fn event() -> ChangeEvent {
        let mut pk = ColumnMap::new();
        pk.insert("user_id".to_string(), json!("u-1"));
        let mut cols = ColumnMap::new();
        cols.insert("email".to_string(), json!("a@b.com"));
        ChangeEvent::new(
            EventType::Insert,
            "users",
            "ecommerce",
            pk,
            ColumnMap::new(),
            cols,
            1_000_000,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_from_event_preserves_payload() {
        let source = event();
        let record = DeadLetterRecord::from_event(
            &source,
            Destination::Relational,
            &PipelineError::RetryableWrite("connection reset".to_string()),
        );

        assert_eq!(record.event_id, source.event_id);
        assert_eq!(record.event_type, "INSERT");
        assert_eq!(record.destination, "relational");
        assert_eq!(record.error_type, "write_error");
        assert_eq!(record.columns, source.columns);
    }

    #[test]
    fn test_from_undecodable_locates_entry() {
        let record = DeadLetterRecord::from_undecodable(
            "CommitLog-7-100.log",
            512,
            b"\xde\xad\xbe\xef",
            Destination::Columnar,
            &PipelineError::decode_error("not json"),
        );

        assert_eq!(record.event_type, "UNKNOWN");
        assert_eq!(record.error_type, "parse_error");
        assert!(record.error_message.contains("CommitLog-7-100.log"));
        assert!(record.error_message.contains("deadbeef"));
    }

    #[test]
    fn test_json_line_fields() {
        let record = DeadLetterRecord::from_event(
            &event(),
            Destination::Timeseries,
            &PipelineError::SchemaValidation("missing pk".to_string()),
        );
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();

        for field in [
            "event_id",
            "event_type",
            "table_name",
            "keyspace",
            "partition_key",
            "clustering_key",
            "columns",
            "timestamp_micros",
            "captured_at",
            "ttl_seconds",
            "destination",
            "error_type",
            "error_message",
            "failed_at",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
    }
}
