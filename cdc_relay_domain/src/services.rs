// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Domain service contracts (infrastructure ports).
//!
//! The decoder port is sync because decoding is a pure CPU-bound function;
//! the sink port is async because it fronts destination I/O.

pub mod decoder;
pub mod sink;

pub use decoder::{EntryDecoder, FramedEntry};
pub use sink::{EventSink, SinkCounters, SinkHealth, SinkStats};
