// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Schema Registry
//!
//! In-memory map from `(keyspace, table)` to the active [`SchemaVersion`],
//! with the compatibility gate the dispatcher consults before dispatching
//! events for a table.
//!
//! ## Concurrency
//!
//! The registry is copy-on-write: readers clone an `Arc` to the current
//! snapshot and never block writers; writers build a new map and publish it
//! atomically. Validation and dispatch run on the hot path for every event,
//! while registrations are rare (schema changes), so the asymmetry pays for
//! itself.
//!
//! ## Pausing
//!
//! A table whose active version is classified incompatible is *paused*: no
//! further events for it are dispatched (they dead-letter with
//! `error_type = "schema_incompatibility"`) until a fully-compatible
//! version is registered. Other tables continue unaffected.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use cdc_relay_domain::{Compatibility, PipelineError, SchemaVersion};
use cdc_relay_domain::entities::schema_version::ColumnDef;

type TableKey = (String, String);

#[derive(Clone)]
struct TableState {
    version: Arc<SchemaVersion>,
    compatibility: Compatibility,
}

/// Copy-on-write registry of active schema versions.
pub struct SchemaRegistry {
    tables: RwLock<Arc<HashMap<TableKey, TableState>>>,
}

impl SchemaRegistry {
    /// Creates an empty registry (every table starts in discovery mode).
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Installs a schema version and returns its compatibility.
    ///
    /// When two snapshots arrive with the same version number the
    /// later-registered one wins; the collision is logged. The table's
    /// compatibility state always follows the most recently registered
    /// version, so registering a fully-compatible successor un-pauses a
    /// paused table.
    pub fn register(&self, schema: SchemaVersion) -> Compatibility {
        let key = (schema.keyspace.clone(), schema.table_name.clone());
        let compatibility = schema.compatibility();

        let mut guard = self.tables.write();
        let mut tables: HashMap<TableKey, TableState> = (**guard).clone();

        if let Some(existing) = tables.get(&key) {
            if existing.version.version_number == schema.version_number {
                warn!(
                    keyspace = %schema.keyspace,
                    table = %schema.table_name,
                    version = schema.version_number,
                    "Schema version collision, later registration wins"
                );
            } else if existing.version.version_number > schema.version_number {
                warn!(
                    keyspace = %schema.keyspace,
                    table = %schema.table_name,
                    existing = existing.version.version_number,
                    incoming = schema.version_number,
                    "Out-of-order schema registration, later registration wins"
                );
            }
        }

        info!(
            keyspace = %schema.keyspace,
            table = %schema.table_name,
            version = schema.version_number,
            compatibility = ?compatibility,
            "Schema registered"
        );

        tables.insert(
            key,
            TableState {
                version: Arc::new(schema),
                compatibility,
            },
        );
        *guard = Arc::new(tables);

        compatibility
    }

    /// Active version for a table, or `None` in discovery mode.
    pub fn lookup(&self, keyspace: &str, table_name: &str) -> Option<Arc<SchemaVersion>> {
        let snapshot = Arc::clone(&self.tables.read());
        snapshot
            .get(&(keyspace.to_string(), table_name.to_string()))
            .map(|state| Arc::clone(&state.version))
    }

    /// Compatibility state of a table's active version.
    pub fn compatibility(&self, keyspace: &str, table_name: &str) -> Option<Compatibility> {
        let snapshot = Arc::clone(&self.tables.read());
        snapshot
            .get(&(keyspace.to_string(), table_name.to_string()))
            .map(|state| state.compatibility)
    }

    /// True when the table is paused by an incompatible active version.
    pub fn is_paused(&self, keyspace: &str, table_name: &str) -> bool {
        matches!(
            self.compatibility(keyspace, table_name),
            Some(Compatibility::Incompatible)
        )
    }

    /// Evolves a table to a new column set, registering either the initial
    /// version or the successor of the current one. Returns the new
    /// version's compatibility.
    pub fn evolve(
        &self,
        keyspace: &str,
        table_name: &str,
        columns: Vec<ColumnDef>,
        partition_keys: Vec<String>,
        clustering_keys: Vec<String>,
    ) -> Result<Compatibility, PipelineError> {
        let next = match self.lookup(keyspace, table_name) {
            Some(current) => current.evolve(columns, partition_keys, clustering_keys)?,
            None => SchemaVersion::initial(
                table_name,
                keyspace,
                columns,
                partition_keys,
                clustering_keys,
            )?,
        };
        Ok(self.register(next))
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(version_source_type: &str) -> Vec<ColumnDef> {
        vec![
            ColumnDef::partition("id", "int"),
            ColumnDef::regular("v", version_source_type),
        ]
    }

    #[test]
    fn test_lookup_empty_registry() {
        let registry = SchemaRegistry::new();
        assert!(registry.lookup("ecommerce", "users").is_none());
        assert!(!registry.is_paused("ecommerce", "users"));
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SchemaRegistry::new();
        let compatibility = registry
            .evolve("ecommerce", "users", schema("text"), vec!["id".to_string()], vec![])
            .unwrap();
        assert_eq!(compatibility, Compatibility::Compatible);

        let active = registry.lookup("ecommerce", "users").unwrap();
        assert_eq!(active.version_number, 1);
    }

    #[test]
    fn test_lookup_returns_most_recent() {
        let registry = SchemaRegistry::new();
        registry
            .evolve("ecommerce", "users", schema("text"), vec!["id".to_string()], vec![])
            .unwrap();
        registry
            .evolve("ecommerce", "users", schema("varchar"), vec!["id".to_string()], vec![])
            .unwrap();

        let active = registry.lookup("ecommerce", "users").unwrap();
        assert_eq!(active.version_number, 2);
        assert_eq!(active.columns["v"].source_type, "varchar");
    }

    #[test]
    fn test_incompatible_version_pauses_table() {
        let registry = SchemaRegistry::new();
        registry
            .evolve("ecommerce", "users", schema("text"), vec!["id".to_string()], vec![])
            .unwrap();
        let compatibility = registry
            .evolve("ecommerce", "users", schema("int"), vec!["id".to_string()], vec![])
            .unwrap();

        assert_eq!(compatibility, Compatibility::Incompatible);
        assert!(registry.is_paused("ecommerce", "users"));
        // Other tables are unaffected.
        assert!(!registry.is_paused("ecommerce", "sessions"));
    }

    #[test]
    fn test_compatible_successor_unpauses_table() {
        let registry = SchemaRegistry::new();
        registry
            .evolve("ecommerce", "users", schema("text"), vec!["id".to_string()], vec![])
            .unwrap();
        registry
            .evolve("ecommerce", "users", schema("int"), vec!["id".to_string()], vec![])
            .unwrap();
        assert!(registry.is_paused("ecommerce", "users"));

        // v3 widens int -> bigint: fully compatible, table resumes.
        registry
            .evolve("ecommerce", "users", schema("bigint"), vec!["id".to_string()], vec![])
            .unwrap();
        assert!(!registry.is_paused("ecommerce", "users"));
    }

    #[test]
    fn test_same_version_number_later_wins() {
        let registry = SchemaRegistry::new();
        let first = SchemaVersion::initial(
            "users",
            "ecommerce",
            schema("text"),
            vec!["id".to_string()],
            vec![],
        )
        .unwrap();
        let second = SchemaVersion::initial(
            "users",
            "ecommerce",
            schema("varchar"),
            vec!["id".to_string()],
            vec![],
        )
        .unwrap();

        registry.register(first);
        registry.register(second);

        let active = registry.lookup("ecommerce", "users").unwrap();
        assert_eq!(active.version_number, 1);
        assert_eq!(active.columns["v"].source_type, "varchar");
    }

    #[test]
    fn test_concurrent_readers_see_snapshots() {
        let registry = Arc::new(SchemaRegistry::new());
        registry
            .evolve("ecommerce", "users", schema("text"), vec!["id".to_string()], vec![])
            .unwrap();

        let reader = Arc::clone(&registry);
        let handle = std::thread::spawn(move || {
            for _ in 0..1000 {
                let _ = reader.lookup("ecommerce", "users");
            }
        });

        for _ in 0..50 {
            registry
                .evolve("ecommerce", "users", schema("varchar"), vec!["id".to_string()], vec![])
                .unwrap();
        }
        handle.join().unwrap();
    }
}
