// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Partition Range Identifier
//!
//! Replication offsets are tracked per partition range so that independent
//! partitions can progress (and later be parallelized) independently. The
//! identifier is derived from the event's partition-key values by hashing
//! into a fixed number of token buckets.
//!
//! The derivation must be *stable across process restarts* - a restarted
//! pipeline has to find the offset rows it wrote in a previous life - so it
//! uses SHA-256 rather than the process-seeded `std` hasher.
//!
//! Collapsing every partition into a single range (range `0`) would be
//! legal but would serialize all progress behind one offset key; deriving
//! the range from the key preserves per-partition bookkeeping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::entities::change_event::value_to_plain_string;

/// Number of token buckets partition keys hash into.
///
/// 64 ranges keeps offset tables small while still giving restart-time
/// resume points per range. The constant is part of the persisted offset
/// identity, so changing it invalidates existing offset rows.
pub const TOKEN_RANGE_COUNT: i64 = 64;

/// Identifier of one partition token range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(i64);

impl PartitionId {
    /// Wraps a raw range identifier. Used when reading offsets back from a
    /// destination's offset table.
    pub fn from_raw(id: i64) -> Self {
        Self(id)
    }

    /// Derives the range for a partition key by hashing its values.
    ///
    /// The canonical form joins the plain-string renderings of the values in
    /// map order with `\x1f` separators, so `("a", "bc")` and `("ab", "c")`
    /// hash differently.
    pub fn from_partition_key(partition_key: &IndexMap<String, Value>) -> Self {
        let mut hasher = Sha256::new();
        for (index, value) in partition_key.values().enumerate() {
            if index > 0 {
                hasher.update([0x1f]);
            }
            hasher.update(value_to_plain_string(value).as_bytes());
        }
        let digest = hasher.finalize();

        let mut token_bytes = [0u8; 8];
        token_bytes.copy_from_slice(&digest[..8]);
        let token = i64::from_be_bytes(token_bytes);

        Self(token.rem_euclid(TOKEN_RANGE_COUNT))
    }

    /// Raw range identifier, suitable for the persisted offsets table.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
