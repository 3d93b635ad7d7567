// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Error Taxonomy
//!
//! Central error type for the CDC relay. Every expected failure mode in the
//! pipeline is a value of [`PipelineError`]; panics are reserved for the
//! non-monotonic-offset invariant (a concurrency bug) and for configuration
//! failures at process start.
//!
//! ## Severity
//!
//! Most variants are *non-fatal*: they are logged, counted, routed to the
//! dead-letter queue where an event exists, and the pipeline continues.
//! Only two classes abort the process:
//!
//! - [`PipelineError::NonMonotonicOffset`] - an offset moved backwards for a
//!   key, which indicates a commit-ordering bug, not an operational fault.
//! - [`PipelineError::InvalidConfiguration`] - raised during startup before
//!   any event has been read.
//!
//! ## Dead-letter mapping
//!
//! Variants that produce a dead-letter record carry a stable `error_type`
//! string used in the JSONL output; see [`PipelineError::error_type`].

use thiserror::Error;

/// Error type shared by every layer of the CDC relay.
///
/// Variants are deliberately coarse: the string payload carries operational
/// detail for logs and dead-letter records, while the variant itself drives
/// control flow (skip segment, route to DLQ, retry, abort).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Configuration could not be loaded or failed range validation.
    /// Fatal at startup; the process exits with code 1.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A parameter passed to a component was out of range or malformed.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A segment frame could not be parsed (bad length prefix). Processing
    /// of the current segment halts; the pipeline moves to the next segment.
    /// No dead-letter record is produced because no event exists yet.
    #[error("Corrupt frame in segment '{segment}' at byte {position}: {reason}")]
    CorruptFrame {
        /// Segment file name containing the bad frame.
        segment: String,
        /// Byte offset of the frame's length prefix.
        position: u64,
        /// Human-readable description of the corruption.
        reason: String,
    },

    /// A well-framed entry could not be decoded into a `ChangeEvent`.
    /// The entry is dead-lettered with `error_type = "parse_error"` and the
    /// pipeline continues with the next entry.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// An event failed validation against the active schema (missing
    /// partition-key coverage). Dead-lettered with
    /// `error_type = "schema_validation"`.
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    /// The active schema version for the event's table is classified
    /// incompatible. The table is paused and the event dead-lettered with
    /// `error_type = "schema_incompatibility"`.
    #[error("Incompatible schema change: {0}")]
    SchemaIncompatible(String),

    /// A destination write failed in a way the retry engine classified as
    /// transient. Surfaced only after the retry budget is exhausted.
    #[error("Retryable write failure: {0}")]
    RetryableWrite(String),

    /// A destination write failed permanently (auth, permissions, syntax).
    /// No retry is attempted.
    #[error("Permanent write failure: {0}")]
    PermanentWrite(String),

    /// A sink operation failed before classification. The retry engine
    /// inspects the message to decide between retryable and permanent.
    #[error("Sink error: {0}")]
    SinkError(String),

    /// An offset write would move `last_event_timestamp_micros` backwards
    /// for its key. This is a programmer error and is fatal to the pipeline.
    #[error("Non-monotonic offset: {0}")]
    NonMonotonicOffset(String),

    /// Underlying I/O failure (file system, socket).
    #[error("I/O error: {0}")]
    IoError(String),

    /// JSON or TOML (de)serialization failure.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Prometheus registry or encoder failure.
    #[error("Metrics error: {0}")]
    MetricsError(String),

    /// A bug or impossible state; carries context for the report.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl PipelineError {
    /// Creates an `InvalidConfiguration` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Creates a `DecodeError`.
    pub fn decode_error(message: impl Into<String>) -> Self {
        Self::DecodeError(message.into())
    }

    /// Creates a `SinkError`.
    pub fn sink_error(message: impl Into<String>) -> Self {
        Self::SinkError(message.into())
    }

    /// Creates a `MetricsError`.
    pub fn metrics_error(message: impl Into<String>) -> Self {
        Self::MetricsError(message.into())
    }

    /// Creates an `InternalError`.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Stable `error_type` string used in dead-letter records.
    ///
    /// Only variants that can reach the DLQ have a meaningful mapping; the
    /// rest fall back to `"internal_error"` so a record is still well-formed
    /// if one ever leaks through.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::DecodeError(_) => "parse_error",
            Self::SchemaValidation(_) => "schema_validation",
            Self::SchemaIncompatible(_) => "schema_incompatibility",
            Self::RetryableWrite(_) | Self::PermanentWrite(_) | Self::SinkError(_) => "write_error",
            _ => "internal_error",
        }
    }

    /// True for the errors that must abort the whole pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NonMonotonicOffset(_) | Self::InvalidConfiguration(_)
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_mapping() {
        assert_eq!(
            PipelineError::decode_error("bad payload").error_type(),
            "parse_error"
        );
        assert_eq!(
            PipelineError::SchemaValidation("missing pk".into()).error_type(),
            "schema_validation"
        );
        assert_eq!(
            PipelineError::SchemaIncompatible("int -> text".into()).error_type(),
            "schema_incompatibility"
        );
        assert_eq!(
            PipelineError::RetryableWrite("timeout".into()).error_type(),
            "write_error"
        );
        assert_eq!(
            PipelineError::PermanentWrite("auth failed".into()).error_type(),
            "write_error"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::NonMonotonicOffset("t=999 < t=1000".into()).is_fatal());
        assert!(PipelineError::invalid_config("batch_size out of range").is_fatal());
        assert!(!PipelineError::decode_error("x").is_fatal());
        assert!(!PipelineError::sink_error("x").is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::IoError(_)));
    }

    #[test]
    fn test_display_includes_context() {
        let err = PipelineError::CorruptFrame {
            segment: "CommitLog-7-1.log".to_string(),
            position: 42,
            reason: "length prefix 0".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("CommitLog-7-1.log"));
        assert!(text.contains("42"));
    }
}
