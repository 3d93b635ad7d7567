// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # JSON Entry Decoder
//!
//! The shipped implementation of the pluggable [`EntryDecoder`] contract.
//! Production sources frame their own binary mutation format; deployments
//! plug a matching decoder in behind the same contract. This one decodes a
//! JSON payload, which is what the bundled tooling and the integration
//! tests write:
//!
//! ```json
//! {
//!   "op": "I",
//!   "keyspace": "ecommerce",
//!   "table": "users",
//!   "partition_key": {"user_id": "u-1"},
//!   "clustering_key": {},
//!   "columns": {"email": "a@example.com", "age": 30},
//!   "timestamp_micros": 1700000000000000,
//!   "ttl_seconds": null
//! }
//! ```
//!
//! `op` is the operation discriminator: `I` insert, `U` update, `D` delete.
//! Decoding is a pure function of the payload bytes; every failure is a
//! `DecodeError` that routes the entry to the dead-letter queue without
//! stopping the pipeline.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use cdc_relay_domain::{ChangeEvent, EntryDecoder, EventType, PipelineError};

/// Smallest payload that could possibly hold a well-formed entry.
const MIN_PAYLOAD_BYTES: usize = 10;

#[derive(Debug, Deserialize)]
struct WirePayload {
    op: String,
    keyspace: String,
    table: String,
    #[serde(default)]
    partition_key: IndexMap<String, Value>,
    #[serde(default)]
    clustering_key: IndexMap<String, Value>,
    #[serde(default)]
    columns: IndexMap<String, Value>,
    timestamp_micros: i64,
    #[serde(default)]
    ttl_seconds: Option<u32>,
}

/// Decoder for the JSON wire payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEntryDecoder;

impl JsonEntryDecoder {
    /// Creates a new decoder.
    pub fn new() -> Self {
        Self
    }
}

impl EntryDecoder for JsonEntryDecoder {
    fn decode(&self, payload: &[u8]) -> Result<ChangeEvent, PipelineError> {
        if payload.len() < MIN_PAYLOAD_BYTES {
            return Err(PipelineError::decode_error(format!(
                "entry too short: {} bytes",
                payload.len()
            )));
        }

        let wire: WirePayload = serde_json::from_slice(payload)
            .map_err(|e| PipelineError::decode_error(format!("malformed entry payload: {e}")))?;

        let event_type = match wire.op.as_str() {
            "I" => EventType::Insert,
            "U" => EventType::Update,
            "D" => EventType::Delete,
            other => {
                return Err(PipelineError::decode_error(format!(
                    "unknown operation discriminator: '{other}'"
                )))
            }
        };

        ChangeEvent::new(
            event_type,
            wire.table,
            wire.keyspace,
            wire.partition_key,
            wire.clustering_key,
            wire.columns,
            wire.timestamp_micros,
            wire.ttl_seconds,
        )
        .map_err(|e| PipelineError::decode_error(format!("invalid entry: {e}")))
    }
}

/// Encodes a change event back into the JSON wire payload.
///
/// Counterpart to [`JsonEntryDecoder`], used by the data generator and the
/// integration tests to author segment files.
pub fn encode_entry(event: &ChangeEvent) -> Result<Vec<u8>, PipelineError> {
    let op = match event.event_type {
        EventType::Insert => "I",
        EventType::Update => "U",
        EventType::Delete => "D",
    };

    let payload = serde_json::json!({
        "op": op,
        "keyspace": event.keyspace,
        "table": event.table_name,
        "partition_key": event.partition_key,
        "clustering_key": event.clustering_key,
        "columns": event.columns,
        "timestamp_micros": event.timestamp_micros,
        "ttl_seconds": event.ttl_seconds,
    });

    serde_json::to_vec(&payload).map_err(PipelineError::from)
}
