// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Property-based tests over the pure domain functions.

use cdc_relay_domain::entities::change_event::{ChangeEvent, ColumnMap, EventType};
use cdc_relay_domain::entities::schema_version::{is_widening, SchemaChange, SchemaDiff};
use cdc_relay_domain::value_objects::{PartitionId, TOKEN_RANGE_COUNT};
use proptest::prelude::*;
use serde_json::json;

fn column_map(pairs: Vec<(String, String)>) -> ColumnMap {
    pairs
        .into_iter()
        .map(|(name, value)| (name, json!(value)))
        .collect()
}

proptest! {
    #[test]
    fn partition_id_always_in_range(values in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,16}"), 1..4)) {
        let key = column_map(values);
        let id = PartitionId::from_partition_key(&key);
        prop_assert!((0..TOKEN_RANGE_COUNT).contains(&id.as_i64()));
    }

    #[test]
    fn partition_id_is_deterministic(values in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,16}"), 1..4)) {
        let key = column_map(values);
        prop_assert_eq!(
            PartitionId::from_partition_key(&key),
            PartitionId::from_partition_key(&key)
        );
    }

    #[test]
    fn event_key_is_deterministic(
        pk_value in "[a-z0-9]{1,16}",
        col_value in "[a-z0-9]{1,16}",
        timestamp in 1i64..i64::MAX / 2,
    ) {
        let pk = column_map(vec![("user_id".to_string(), pk_value)]);
        let cols = column_map(vec![("email".to_string(), col_value)]);
        let event = ChangeEvent::new(
            EventType::Insert,
            "users",
            "ecommerce",
            pk,
            ColumnMap::new(),
            cols,
            timestamp,
            None,
        )
        .unwrap();
        prop_assert_eq!(event.event_key(), event.clone().event_key());
        prop_assert!(event.event_key().ends_with(&timestamp.to_string()));
    }

    #[test]
    fn classify_is_pure(
        old_type in "(int|bigint|float|double|decimal|text|varchar|uuid)",
        new_type in "(int|bigint|float|double|decimal|text|varchar|uuid)",
    ) {
        let diff = SchemaDiff {
            changes: vec![SchemaChange::AlterType {
                column_name: "v".to_string(),
                old_type: old_type.clone(),
                new_type: new_type.clone(),
            }],
            partition_keys_changed: false,
            clustering_keys_changed: false,
        };
        // Same diff, same classification, every time.
        let first = diff.classify();
        prop_assert_eq!(diff.classify(), first);
        prop_assert_eq!(diff.classify(), first);
    }

    #[test]
    fn widening_never_holds_both_ways_except_text_varchar(
        old_type in "(int|bigint|float|double|decimal|uuid)",
        new_type in "(int|bigint|float|double|decimal|uuid)",
    ) {
        if is_widening(&old_type, &new_type) {
            prop_assert!(!is_widening(&new_type, &old_type));
        }
    }
}
