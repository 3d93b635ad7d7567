// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Configuration Loading
//!
//! Layers configuration sources in increasing precedence:
//!
//! 1. Built-in defaults (the `Default` impls in [`settings`]).
//! 2. A TOML file - either an explicit `--config` path (which must exist)
//!    or the conventional `config/pipeline.toml` (which may be absent).
//! 3. Environment variables under the `CDC_` prefix with `__` separating
//!    nested keys (`CDC_RETRY__MAX_ATTEMPTS=7`).
//!
//! After merging, [`settings::RelaySettings::validate`] range-checks every
//! option; any violation is fatal and surfaces as exit code 1.

pub mod settings;

use std::path::Path;

use cdc_relay_bootstrap::BootstrapLogger;
use cdc_relay_domain::PipelineError;

use settings::RelaySettings;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CDC";

/// Conventional configuration file location when `--config` is absent.
pub const DEFAULT_CONFIG_BASENAME: &str = "config/pipeline";

/// Loads, merges, and validates the relay settings.
///
/// An explicitly provided path that does not exist is an error; the
/// conventional default location is allowed to be missing, in which case the
/// built-in defaults plus environment overrides apply.
pub fn load_settings(
    path: Option<&Path>,
    logger: &dyn BootstrapLogger,
) -> Result<RelaySettings, PipelineError> {
    let mut builder = config::Config::builder();

    match path {
        Some(path) => {
            if !path.exists() {
                return Err(PipelineError::invalid_config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            logger.info(&format!("Loading configuration from {}", path.display()));
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        None => {
            logger.debug(&format!(
                "No --config given, trying {DEFAULT_CONFIG_BASENAME}.toml"
            ));
            builder =
                builder.add_source(config::File::with_name(DEFAULT_CONFIG_BASENAME).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let merged = builder
        .build()
        .map_err(|e| PipelineError::invalid_config(format!("Failed to load configuration: {e}")))?;

    let settings: RelaySettings = merged
        .try_deserialize()
        .map_err(|e| PipelineError::invalid_config(format!("Failed to parse configuration: {e}")))?;

    settings.validate()?;
    logger.info("Configuration loaded and validated");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_relay_bootstrap::NoOpLogger;
    use std::io::Write;

    #[test]
    fn test_missing_explicit_path_is_error() {
        let result = load_settings(
            Some(Path::new("/nonexistent/pipeline.toml")),
            &NoOpLogger::new(),
        );
        assert!(matches!(
            result,
            Err(PipelineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[pipeline]
batch_size = 250
max_parallelism = 8

[retry]
max_attempts = 7

[source]
keyspace = "metrics"
"#
        )
        .unwrap();
        file.flush().unwrap();

        let settings = load_settings(Some(file.path()), &NoOpLogger::new()).unwrap();
        assert_eq!(settings.pipeline.batch_size, 250);
        assert_eq!(settings.pipeline.max_parallelism, 8);
        assert_eq!(settings.retry.max_attempts, 7);
        assert_eq!(settings.source.keyspace, "metrics");
        // Untouched options keep their defaults.
        assert_eq!(settings.pipeline.max_in_flight_batches, 10);
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[pipeline]\nbatch_size = 99999").unwrap();
        file.flush().unwrap();

        let result = load_settings(Some(file.path()), &NoOpLogger::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "pipeline = not-a-table").unwrap();
        file.flush().unwrap();

        assert!(load_settings(Some(file.path()), &NoOpLogger::new()).is_err());
    }
}
