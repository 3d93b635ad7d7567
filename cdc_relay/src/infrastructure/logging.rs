// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Logging Setup
//!
//! Installs the global `tracing` subscriber from configuration: an
//! env-filter style level directive and either JSON (machine-shipped) or
//! human-readable console formatting. Called exactly once from the binary
//! entry point, after configuration has been loaded through the bootstrap
//! logger.

use tracing_subscriber::EnvFilter;

use cdc_relay_domain::PipelineError;

/// Initializes the global tracing subscriber.
///
/// `level` accepts anything `EnvFilter` understands (`info`,
/// `cdc_relay=debug,sqlx=warn`, ...); `format` is `json` or `console`.
pub fn init_logging(level: &str, format: &str) -> Result<(), PipelineError> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| PipelineError::invalid_config(format!("Invalid log level '{level}': {e}")))?;

    let result = match format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    result.map_err(|e| {
        PipelineError::invalid_config(format!("Failed to install tracing subscriber: {e}"))
    })
}
