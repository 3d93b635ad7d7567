// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # CDC Relay Domain Layer
//!
//! Pure domain model for the CDC relay pipeline: the entities that flow
//! through the system, the value objects that identify them, the error
//! taxonomy, and the contracts the infrastructure layer implements.
//!
//! ## Contents
//!
//! - [`entities`] - `ChangeEvent`, `ReplicationOffset`, `SchemaVersion`,
//!   `DeadLetterRecord`, and the schema compatibility classifier.
//! - [`value_objects`] - `EventId`, `PartitionId`, `SegmentPosition`.
//! - [`services`] - the pluggable `EntryDecoder` contract and the
//!   `EventSink` capability-set contract.
//! - [`error`] - the `PipelineError` taxonomy shared by every layer.
//!
//! ## Design constraints
//!
//! This crate performs no I/O and owns no runtime. It depends on
//! `async-trait` only so the sink port can be async; everything else is
//! synchronous, deterministic, and unit-testable without tokio.

pub mod entities;
pub mod error;
pub mod services;
pub mod value_objects;

pub use entities::{
    ChangeEvent, ColumnMap, Compatibility, DeadLetterRecord, Destination, EventType, OffsetKey,
    ReplicationOffset, SchemaChange, SchemaDiff, SchemaVersion,
};
pub use error::PipelineError;
pub use services::{EntryDecoder, EventSink, FramedEntry, SinkCounters, SinkHealth, SinkStats};
pub use value_objects::{EventId, PartitionId, SegmentPosition};
