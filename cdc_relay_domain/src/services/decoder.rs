// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Entry Decoder Contract
//!
//! The commit-log tailer yields framed byte payloads; an [`EntryDecoder`]
//! turns one payload into a [`ChangeEvent`] or a decode error. The decoder
//! is a pure function of the bytes - no I/O, no shared state - which is what
//! makes it pluggable: the relay ships a JSON decoder for development and
//! testing, and production deployments plug in a binary decoder for their
//! source's actual commit-log format.
//!
//! A `DecodeError` is not fatal: the entry is dead-lettered with
//! `error_type = "parse_error"` and the pipeline continues with the next
//! entry.

use crate::entities::change_event::ChangeEvent;
use crate::error::PipelineError;

/// One framed entry read from a commit-log segment.
///
/// `position` is the pre-read byte offset of the entry's length prefix, so
/// a caller who records it and restarts there re-reads exactly this entry.
/// `next_position` is where the following entry starts; it is what offsets
/// record so a restart resumes *after* the committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedEntry {
    /// Raw entry payload (without the length prefix).
    pub payload: Vec<u8>,
    /// Segment file the entry was read from.
    pub segment_file: String,
    /// Byte offset of the entry's length prefix.
    pub position: u64,
    /// Byte offset immediately after the entry's payload.
    pub next_position: u64,
}

/// Pluggable decoder from framed bytes to change events.
///
/// Implementations must validate the operation discriminator and extract
/// partition and clustering keys, mutation columns, write timestamp, and
/// TTL. They must be pure: same bytes in, same result out.
pub trait EntryDecoder: Send + Sync {
    /// Decodes one framed payload.
    fn decode(&self, payload: &[u8]) -> Result<ChangeEvent, PipelineError>;
}
