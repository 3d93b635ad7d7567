// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Domain entities: the mutable, identity-bearing objects of the CDC relay.

pub mod change_event;
pub mod dead_letter;
pub mod replication_offset;
pub mod schema_version;

pub use change_event::{ChangeEvent, ColumnMap, EventType};
pub use dead_letter::DeadLetterRecord;
pub use replication_offset::{Destination, OffsetKey, ReplicationOffset};
pub use schema_version::{
    is_widening, ColumnDef, Compatibility, KeyRole, SchemaChange, SchemaDiff, SchemaVersion,
    TYPE_WIDENINGS,
};
