// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Event Validator
//!
//! Validates decoded events against the active schema version for their
//! table.
//!
//! ## Rules
//!
//! - No registered schema → the event is allowed (schema discovery mode).
//! - Every partition-key column the schema declares must be present in the
//!   event, and every partition-key column the event carries must be
//!   declared by the schema; a mismatch either way is a coverage failure
//!   (`SchemaValidation`, dead-lettered).
//! - Event columns the schema does not know are logged but not rejected -
//!   unknown columns usually mean a schema change the compatibility gate
//!   handles separately.
//! - Per-column type checks are advisory: [`EventValidator::type_mismatches`]
//!   reports columns whose values do not fit the declared source type, and
//!   callers log them without failing the event.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use cdc_relay_domain::{ChangeEvent, PipelineError};

use crate::infrastructure::schema::registry::SchemaRegistry;

/// Validator over the shared schema registry.
pub struct EventValidator {
    registry: Arc<SchemaRegistry>,
}

impl EventValidator {
    /// Creates a validator reading from `registry`.
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Validates primary-key coverage of an event against its table's
    /// active schema.
    pub fn validate(&self, event: &ChangeEvent) -> Result<(), PipelineError> {
        let Some(schema) = self.registry.lookup(&event.keyspace, &event.table_name) else {
            debug!(
                keyspace = %event.keyspace,
                table = %event.table_name,
                "No schema registered, allowing event (discovery mode)"
            );
            return Ok(());
        };

        for key in &schema.partition_keys {
            if !event.partition_key.contains_key(key) {
                return Err(PipelineError::SchemaValidation(format!(
                    "missing partition key '{}' in event for {}.{}",
                    key, event.keyspace, event.table_name
                )));
            }
        }

        for key in event.partition_key.keys() {
            if !schema.partition_keys.iter().any(|name| name == key) {
                return Err(PipelineError::SchemaValidation(format!(
                    "event partition key '{}' is not a partition key of {}.{} (v{})",
                    key, event.keyspace, event.table_name, schema.version_number
                )));
            }
        }

        let unknown: Vec<&String> = event
            .columns
            .keys()
            .filter(|name| !schema.columns.contains_key(*name))
            .collect();
        if !unknown.is_empty() {
            warn!(
                keyspace = %event.keyspace,
                table = %event.table_name,
                columns = ?unknown,
                "Event contains columns unknown to the active schema"
            );
        }

        Ok(())
    }

    /// Names of event columns whose values do not fit the schema's declared
    /// source type. Advisory only.
    pub fn type_mismatches(&self, event: &ChangeEvent) -> Vec<String> {
        let Some(schema) = self.registry.lookup(&event.keyspace, &event.table_name) else {
            return Vec::new();
        };

        event
            .columns
            .iter()
            .filter_map(|(name, value)| {
                let column = schema.columns.get(name)?;
                if value_fits_type(value, &column.source_type) {
                    None
                } else {
                    warn!(
                        column = %name,
                        expected = %column.source_type,
                        "Column value does not fit declared type"
                    );
                    Some(name.clone())
                }
            })
            .collect()
    }
}

/// Loose structural check of a JSON value against a source type name.
/// Nulls always fit; unknown types are allowed (they may be complex types
/// the relay does not model).
fn value_fits_type(value: &Value, source_type: &str) -> bool {
    if value.is_null() {
        return true;
    }

    match source_type.to_ascii_lowercase().as_str() {
        "text" | "varchar" | "ascii" => value.is_string(),
        "int" | "bigint" | "smallint" | "tinyint" | "counter" => value.is_i64() || value.is_u64(),
        "double" | "float" | "decimal" => value.is_number(),
        "boolean" => value.is_boolean(),
        "uuid" | "timeuuid" => true,
        "timestamp" | "date" | "time" => true,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_relay_domain::entities::change_event::{ColumnMap, EventType};
    use cdc_relay_domain::entities::schema_version::ColumnDef;
    use serde_json::json;

    fn registry_with_users_schema() -> Arc<SchemaRegistry> {
        let registry = Arc::new(SchemaRegistry::new());
        registry
            .evolve(
                "ecommerce",
                "users",
                vec![
                    ColumnDef::partition("user_id", "uuid"),
                    ColumnDef::regular("email", "text"),
                    ColumnDef::regular("age", "int"),
                ],
                vec!["user_id".to_string()],
                vec![],
            )
            .unwrap();
        registry
    }

    fn event(pk_column: &str, columns: ColumnMap) -> ChangeEvent {
        let mut pk = ColumnMap::new();
        pk.insert(pk_column.to_string(), json!("u-1"));
        ChangeEvent::new(
            EventType::Insert,
            "users",
            "ecommerce",
            pk,
            ColumnMap::new(),
            columns,
            1_000_000,
            None,
        )
        .unwrap()
    }

    fn columns() -> ColumnMap {
        let mut map = ColumnMap::new();
        map.insert("email".to_string(), json!("a@b.com"));
        map
    }

    #[test]
    fn test_no_schema_allows_event() {
        let validator = EventValidator::new(Arc::new(SchemaRegistry::new()));
        assert!(validator.validate(&event("user_id", columns())).is_ok());
    }

    #[test]
    fn test_valid_event_passes() {
        let validator = EventValidator::new(registry_with_users_schema());
        assert!(validator.validate(&event("user_id", columns())).is_ok());
    }

    #[test]
    fn test_wrong_partition_key_fails() {
        let validator = EventValidator::new(registry_with_users_schema());
        let result = validator.validate(&event("session_id", columns()));
        assert!(matches!(result, Err(PipelineError::SchemaValidation(_))));
    }

    #[test]
    fn test_unknown_columns_allowed() {
        let validator = EventValidator::new(registry_with_users_schema());
        let mut cols = columns();
        cols.insert("brand_new_column".to_string(), json!(1));
        assert!(validator.validate(&event("user_id", cols)).is_ok());
    }

    #[test]
    fn test_type_mismatches_reported_not_fatal() {
        let validator = EventValidator::new(registry_with_users_schema());
        let mut cols = ColumnMap::new();
        cols.insert("email".to_string(), json!(12345));
        cols.insert("age".to_string(), json!("not a number"));
        let event = event("user_id", cols);

        assert!(validator.validate(&event).is_ok());
        let mismatches = validator.type_mismatches(&event);
        assert_eq!(mismatches, vec!["email".to_string(), "age".to_string()]);
    }

    #[test]
    fn test_null_values_fit_any_type() {
        let validator = EventValidator::new(registry_with_users_schema());
        let mut cols = columns();
        cols.insert("age".to_string(), Value::Null);
        assert!(validator.type_mismatches(&event("user_id", cols)).is_empty());
    }
}
