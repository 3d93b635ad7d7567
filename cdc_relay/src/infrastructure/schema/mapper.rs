// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Destination Type Mapper
//!
//! Maps source column types to each destination family's native types, and
//! decides which schema changes can be applied to a destination table
//! automatically. The automatic-application decision reuses the same
//! widening table as the compatibility classifier
//! (`cdc_relay_domain::entities::schema_version::TYPE_WIDENINGS`), so the
//! two can never drift apart.

use indexmap::IndexMap;

use cdc_relay_domain::entities::schema_version::is_widening;
use cdc_relay_domain::{Destination, SchemaChange, SchemaVersion};

/// Fallback destination type when a source type is unknown.
const RELATIONAL_FALLBACK: &str = "text";
const COLUMNAR_FALLBACK: &str = "String";

/// Maps one source type to the destination's native type.
pub fn map_type(destination: Destination, source_type: &str) -> &'static str {
    match destination {
        Destination::Relational | Destination::Timeseries => {
            relational_type(source_type)
        }
        Destination::Columnar => columnar_type(source_type),
    }
}

fn relational_type(source_type: &str) -> &'static str {
    match source_type.to_ascii_lowercase().as_str() {
        "uuid" => "uuid",
        "text" => "text",
        "varchar" => "varchar",
        "int" => "integer",
        "bigint" => "bigint",
        "timestamp" => "timestamptz",
        "decimal" => "numeric",
        "double" => "double precision",
        "float" => "real",
        "boolean" => "boolean",
        _ => RELATIONAL_FALLBACK,
    }
}

fn columnar_type(source_type: &str) -> &'static str {
    match source_type.to_ascii_lowercase().as_str() {
        "uuid" => "UUID",
        "text" | "varchar" => "String",
        "int" => "Int32",
        "bigint" => "Int64",
        "timestamp" => "DateTime64(3)",
        "decimal" => "Decimal(38, 10)",
        "double" => "Float64",
        "float" => "Float32",
        "boolean" => "UInt8",
        _ => COLUMNAR_FALLBACK,
    }
}

/// True when a schema change can be applied to a destination table without
/// operator intervention: adds and drops always, type alters only for the
/// widening set.
pub fn can_apply_automatically(change: &SchemaChange) -> bool {
    match change {
        SchemaChange::AddColumn { .. } | SchemaChange::DropColumn { .. } => true,
        SchemaChange::AlterType {
            old_type, new_type, ..
        } => is_widening(old_type, new_type),
    }
}

/// Column-name to destination-type mapping for a schema snapshot, with one
/// change applied on top. Mirrors what a destination-side DDL reconciler
/// would compute before altering its table.
pub fn mapped_columns_after(
    schema: &SchemaVersion,
    change: &SchemaChange,
    destination: Destination,
) -> IndexMap<String, &'static str> {
    let mut mapped: IndexMap<String, &'static str> = schema
        .columns
        .iter()
        .map(|(name, column)| (name.clone(), map_type(destination, &column.source_type)))
        .collect();

    match change {
        SchemaChange::AddColumn {
            column_name,
            new_type,
        } => {
            mapped.insert(column_name.clone(), map_type(destination, new_type));
        }
        SchemaChange::DropColumn { column_name, .. } => {
            mapped.shift_remove(column_name);
        }
        SchemaChange::AlterType {
            column_name,
            new_type,
            ..
        } => {
            mapped.insert(column_name.clone(), map_type(destination, new_type));
        }
    }

    mapped
}
