// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Schema Version Entity
//!
//! A [`SchemaVersion`] is a snapshot of a source table's structure at a
//! point in time: column definitions, ordered partition-key list, ordered
//! clustering-key list, and a monotonically increasing version number per
//! `(keyspace, table)`.
//!
//! ## Evolution
//!
//! [`SchemaVersion::evolve`] produces the successor snapshot and computes
//! the [`SchemaDiff`] to its predecessor: added columns, dropped columns,
//! altered types, and whether either key list changed.
//!
//! ## Compatibility
//!
//! [`SchemaDiff::classify`] is the single compatibility classifier in the
//! system - a pure function of the diff:
//!
//! - AddColumn, DropColumn → compatible.
//! - AlterType → compatible only for the widening conversions in
//!   [`TYPE_WIDENINGS`].
//! - Any partition-key or clustering-key set change → incompatible.
//!
//! The widening table is the declarative source of truth shared with the
//! destination type mapper, so the classifier and the mapper can never
//! disagree about which conversions are safe.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Type conversions considered lossless widenings, as `(old, new)` pairs of
/// lowercase source type names.
///
/// This table is the only place widening knowledge lives; both the
/// compatibility classifier and the destination type mapper consult it.
pub const TYPE_WIDENINGS: &[(&str, &str)] = &[
    ("int", "bigint"),
    ("float", "double"),
    ("decimal", "double"),
    ("text", "varchar"),
    ("varchar", "text"),
];

/// True when altering a column from `old` to `new` is a lossless widening.
pub fn is_widening(old: &str, new: &str) -> bool {
    let old = old.to_ascii_lowercase();
    let new = new.to_ascii_lowercase();
    TYPE_WIDENINGS
        .iter()
        .any(|(from, to)| *from == old && *to == new)
}

/// Role a column plays in the table's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    /// Part of the partition key.
    Partition,
    /// Part of the clustering key.
    Clustering,
    /// Regular (non-key) column.
    Regular,
}

/// Definition of one source column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Source type name (e.g., `text`, `int`, `uuid`).
    pub source_type: String,
    /// Key role of the column.
    pub key_role: KeyRole,
}

impl ColumnDef {
    /// Creates a column definition.
    pub fn new(name: impl Into<String>, source_type: impl Into<String>, key_role: KeyRole) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into().to_ascii_lowercase(),
            key_role,
        }
    }

    /// Convenience constructor for a regular column.
    pub fn regular(name: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self::new(name, source_type, KeyRole::Regular)
    }

    /// Convenience constructor for a partition-key column.
    pub fn partition(name: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self::new(name, source_type, KeyRole::Partition)
    }

    /// Convenience constructor for a clustering-key column.
    pub fn clustering(name: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self::new(name, source_type, KeyRole::Clustering)
    }
}

/// One detected change between two schema snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaChange {
    /// A column was added.
    AddColumn {
        /// Added column name.
        column_name: String,
        /// Its source type.
        new_type: String,
    },
    /// A column was removed.
    DropColumn {
        /// Dropped column name.
        column_name: String,
        /// Its previous source type.
        old_type: String,
    },
    /// A column's type changed.
    AlterType {
        /// Affected column name.
        column_name: String,
        /// Previous source type.
        old_type: String,
        /// New source type.
        new_type: String,
    },
}

/// Compatibility classification of a schema diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compatibility {
    /// All changes can be applied automatically without data loss.
    Compatible,
    /// At least one change narrows a type or alters the primary key shape.
    Incompatible,
}

/// Complete diff between two consecutive schema versions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaDiff {
    /// Column-level changes in detection order.
    pub changes: Vec<SchemaChange>,
    /// Whether the ordered partition-key list changed.
    pub partition_keys_changed: bool,
    /// Whether the ordered clustering-key list changed.
    pub clustering_keys_changed: bool,
}

impl SchemaDiff {
    /// Classifies this diff. Pure: the same diff always yields the same
    /// classification.
    pub fn classify(&self) -> Compatibility {
        if self.partition_keys_changed || self.clustering_keys_changed {
            return Compatibility::Incompatible;
        }

        for change in &self.changes {
            if let SchemaChange::AlterType {
                old_type, new_type, ..
            } = change
            {
                if !is_widening(old_type, new_type) {
                    return Compatibility::Incompatible;
                }
            }
        }

        Compatibility::Compatible
    }

    /// Changes that individually fail the compatibility check, for logging.
    pub fn incompatible_changes(&self) -> Vec<&SchemaChange> {
        self.changes
            .iter()
            .filter(|change| match change {
                SchemaChange::AlterType {
                    old_type, new_type, ..
                } => !is_widening(old_type, new_type),
                _ => false,
            })
            .collect()
    }

    /// True when nothing changed at all.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.partition_keys_changed && !self.clustering_keys_changed
    }
}

/// Snapshot of a source table's structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Unique identifier of this snapshot.
    pub schema_id: Uuid,
    /// Table name.
    pub table_name: String,
    /// Keyspace name.
    pub keyspace: String,
    /// Monotonically increasing version per `(keyspace, table)`; v1 initial.
    pub version_number: u32,
    /// Column definitions in declaration order.
    pub columns: IndexMap<String, ColumnDef>,
    /// Ordered partition-key column names. Never empty.
    pub partition_keys: Vec<String>,
    /// Ordered clustering-key column names. May be empty.
    pub clustering_keys: Vec<String>,
    /// When this snapshot was detected.
    pub detected_at: DateTime<Utc>,
    /// Version number of the predecessor (`None` for v1).
    pub previous_version: Option<u32>,
    /// Diff to the predecessor (empty for v1).
    pub diff: SchemaDiff,
}

impl SchemaVersion {
    /// Creates the initial (v1) snapshot for a table.
    pub fn initial(
        table_name: impl Into<String>,
        keyspace: impl Into<String>,
        columns: Vec<ColumnDef>,
        partition_keys: Vec<String>,
        clustering_keys: Vec<String>,
    ) -> Result<Self, PipelineError> {
        let schema = Self {
            schema_id: Uuid::new_v4(),
            table_name: table_name.into(),
            keyspace: keyspace.into(),
            version_number: 1,
            columns: columns
                .into_iter()
                .map(|column| (column.name.clone(), column))
                .collect(),
            partition_keys,
            clustering_keys,
            detected_at: Utc::now(),
            previous_version: None,
            diff: SchemaDiff::default(),
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Creates the successor snapshot, computing the diff to `self`.
    pub fn evolve(
        &self,
        columns: Vec<ColumnDef>,
        partition_keys: Vec<String>,
        clustering_keys: Vec<String>,
    ) -> Result<Self, PipelineError> {
        let new_columns: IndexMap<String, ColumnDef> = columns
            .into_iter()
            .map(|column| (column.name.clone(), column))
            .collect();

        let diff = SchemaDiff {
            changes: self.detect_changes(&new_columns),
            partition_keys_changed: self.partition_keys != partition_keys,
            clustering_keys_changed: self.clustering_keys != clustering_keys,
        };

        let schema = Self {
            schema_id: Uuid::new_v4(),
            table_name: self.table_name.clone(),
            keyspace: self.keyspace.clone(),
            version_number: self.version_number + 1,
            columns: new_columns,
            partition_keys,
            clustering_keys,
            detected_at: Utc::now(),
            previous_version: Some(self.version_number),
            diff,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Compatibility of this snapshot's diff to its predecessor. The initial
    /// version is trivially compatible.
    pub fn compatibility(&self) -> Compatibility {
        self.diff.classify()
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.version_number < 1 {
            return Err(PipelineError::InvalidParameter(
                "version_number must be >= 1".to_string(),
            ));
        }

        if self.partition_keys.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "partition_keys must be non-empty".to_string(),
            ));
        }

        for key in self.partition_keys.iter().chain(self.clustering_keys.iter()) {
            if !self.columns.contains_key(key) {
                return Err(PipelineError::InvalidParameter(format!(
                    "key column '{key}' not found in column definitions"
                )));
            }
        }

        if self.version_number > 1 && self.previous_version.is_none() {
            return Err(PipelineError::InvalidParameter(
                "previous_version required for non-initial versions".to_string(),
            ));
        }

        Ok(())
    }

    fn detect_changes(&self, new_columns: &IndexMap<String, ColumnDef>) -> Vec<SchemaChange> {
        let mut changes = Vec::new();

        for (name, column) in new_columns {
            if !self.columns.contains_key(name) {
                changes.push(SchemaChange::AddColumn {
                    column_name: name.clone(),
                    new_type: column.source_type.clone(),
                });
            }
        }

        for (name, column) in &self.columns {
            match new_columns.get(name) {
                None => changes.push(SchemaChange::DropColumn {
                    column_name: name.clone(),
                    old_type: column.source_type.clone(),
                }),
                Some(new_column) if new_column.source_type != column.source_type => {
                    changes.push(SchemaChange::AlterType {
                        column_name: name.clone(),
                        old_type: column.source_type.clone(),
                        new_type: new_column.source_type.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        changes
    }
}
