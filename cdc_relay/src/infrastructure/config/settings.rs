// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Settings
//!
//! Typed configuration for the whole relay: source connection, destination
//! parameters, pipeline tuning, retry policy, observability surfaces, and
//! masking rules. Every numeric option carries an explicit valid range that
//! [`RelaySettings::validate`] enforces after deserialization, so a typo in
//! a TOML file or environment variable fails fast at startup instead of
//! surfacing as strange runtime behavior.
//!
//! All options are overridable through environment variables with the `CDC_`
//! prefix and `__` as the nesting separator, e.g.
//! `CDC_PIPELINE__BATCH_SIZE=500` or `CDC_SOURCE__KEYSPACE=ecommerce`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use cdc_relay_domain::PipelineError;

use crate::infrastructure::retry::RetryPolicy;

/// Source (commit-log producer) connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Source contact hosts.
    pub hosts: Vec<String>,
    /// Source native-protocol port.
    pub port: u16,
    /// Keyspace to replicate.
    pub keyspace: String,
    /// Directory the source writes commit-log segments into.
    pub commitlog_directory: PathBuf,
    /// Whether TLS is enabled toward the source.
    pub tls_enabled: bool,
    /// Optional credentials.
    pub username: Option<String>,
    /// Optional credentials.
    pub password: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".to_string()],
            port: 9042,
            keyspace: "ecommerce".to_string(),
            commitlog_directory: PathBuf::from("/var/lib/cassandra/cdc_raw"),
            tls_enabled: true,
            username: None,
            password: None,
        }
    }
}

/// Connection settings for one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationSettings {
    /// Whether this destination participates in replication.
    pub enabled: bool,
    /// Connection URL understood by the destination's sink implementation.
    pub database_url: String,
    /// Connection pool size (1-100).
    pub pool_size: u32,
    /// TLS mode: disable, require, verify-ca, or verify-full.
    pub tls_mode: String,
}

impl Default for DestinationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            database_url: String::new(),
            pool_size: 10,
            tls_mode: "require".to_string(),
        }
    }
}

/// All destination configurations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationsSettings {
    /// Relational warehouse.
    pub relational: DestinationSettings,
    /// Columnar warehouse.
    pub columnar: DestinationSettings,
    /// Time-series warehouse.
    pub timeseries: DestinationSettings,
}

/// Core pipeline tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTuning {
    /// Events per micro-batch (1-10000).
    pub batch_size: usize,
    /// Concurrent sink workers (1-64).
    pub max_parallelism: usize,
    /// Backpressure cap on sealed-or-committing batches per destination
    /// (1-1000).
    pub max_in_flight_batches: usize,
    /// Commit-log polling interval in milliseconds (10-60000).
    pub poll_interval_ms: u64,
    /// Fully-qualified `keyspace.table` names to replicate. Empty accepts
    /// every table in the configured keyspace.
    pub tables: Vec<String>,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_parallelism: 4,
            max_in_flight_batches: 10,
            poll_interval_ms: 100,
            tables: Vec::new(),
        }
    }
}

impl PipelineTuning {
    /// Polling interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry and failure handling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum attempts per batch (1-100).
    pub max_attempts: u32,
    /// Initial retry delay in milliseconds (10-10000).
    pub base_delay_ms: u64,
    /// Maximum retry delay cap in milliseconds (100-300000).
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier (1.0-10.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter (plus or minus 25%).
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Converts to the retry engine's policy value.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

/// Metrics, health, and logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Prometheus metrics port (1024-65535).
    pub metrics_port: u16,
    /// Metrics HTTP path.
    pub metrics_path: String,
    /// Health endpoint port (1024-65535).
    pub health_port: u16,
    /// Health HTTP path.
    pub health_path: String,
    /// Log level: trace, debug, info, warn, or error.
    pub log_level: String,
    /// Log format: json or console.
    pub log_format: String,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            metrics_port: 9090,
            metrics_path: "/metrics".to_string(),
            health_port: 8080,
            health_path: "/health".to_string(),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

/// PII/PHI masking configuration.
///
/// PHI masking is opt-in: listing any `phi_patterns` makes `phi_secret`
/// mandatory, because tokenization without a process-wide secret would be
/// silently reversible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingSettings {
    /// Column-name substrings masked with SHA-256 (case-insensitive).
    pub pii_patterns: Vec<String>,
    /// Column-name substrings masked with HMAC tokens (case-insensitive).
    /// Checked before PII patterns.
    pub phi_patterns: Vec<String>,
    /// Process-wide secret for PHI HMAC. Required when `phi_patterns` is
    /// non-empty.
    pub phi_secret: Option<String>,
}

impl Default for MaskingSettings {
    fn default() -> Self {
        Self {
            pii_patterns: vec![
                "email".to_string(),
                "phone".to_string(),
                "ssn".to_string(),
                "credit_card".to_string(),
            ],
            phi_patterns: Vec::new(),
            phi_secret: None,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Source connection.
    pub source: SourceSettings,
    /// Destination warehouses.
    pub destinations: DestinationsSettings,
    /// Pipeline tuning.
    pub pipeline: PipelineTuning,
    /// Retry policy.
    pub retry: RetrySettings,
    /// Observability surfaces.
    pub observability: ObservabilitySettings,
    /// Masking rules.
    pub masking: MaskingSettings,
    /// Directory dead-letter files are written into.
    pub dlq_directory: PathBuf,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            source: SourceSettings::default(),
            destinations: DestinationsSettings::default(),
            pipeline: PipelineTuning::default(),
            retry: RetrySettings::default(),
            observability: ObservabilitySettings::default(),
            masking: MaskingSettings::default(),
            dlq_directory: PathBuf::from("data/dlq"),
        }
    }
}

impl RelaySettings {
    /// Range-validates every option. Called by the loader; any violation is
    /// a fatal configuration error.
    pub fn validate(&self) -> Result<(), PipelineError> {
        fn check_range<T: PartialOrd + std::fmt::Display>(
            name: &str,
            value: T,
            min: T,
            max: T,
        ) -> Result<(), PipelineError> {
            if value < min || value > max {
                return Err(PipelineError::invalid_config(format!(
                    "{name} must be between {min} and {max}, got {value}"
                )));
            }
            Ok(())
        }

        if self.source.keyspace.is_empty() {
            return Err(PipelineError::invalid_config(
                "source.keyspace must not be empty",
            ));
        }

        check_range("pipeline.batch_size", self.pipeline.batch_size, 1, 10_000)?;
        check_range("pipeline.max_parallelism", self.pipeline.max_parallelism, 1, 64)?;
        check_range(
            "pipeline.max_in_flight_batches",
            self.pipeline.max_in_flight_batches,
            1,
            1_000,
        )?;
        check_range(
            "pipeline.poll_interval_ms",
            self.pipeline.poll_interval_ms,
            10,
            60_000,
        )?;

        check_range("retry.max_attempts", self.retry.max_attempts, 1, 100)?;
        check_range("retry.base_delay_ms", self.retry.base_delay_ms, 10, 10_000)?;
        check_range("retry.max_delay_ms", self.retry.max_delay_ms, 100, 300_000)?;
        check_range(
            "retry.backoff_multiplier",
            self.retry.backoff_multiplier,
            1.0,
            10.0,
        )?;

        check_range(
            "observability.metrics_port",
            self.observability.metrics_port,
            1024,
            u16::MAX,
        )?;
        check_range(
            "observability.health_port",
            self.observability.health_port,
            1024,
            u16::MAX,
        )?;

        for (name, path) in [
            ("observability.metrics_path", &self.observability.metrics_path),
            ("observability.health_path", &self.observability.health_path),
        ] {
            if !path.starts_with('/') {
                return Err(PipelineError::invalid_config(format!(
                    "{name} must start with '/', got '{path}'"
                )));
            }
        }

        if !matches!(
            self.observability.log_level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(PipelineError::invalid_config(format!(
                "observability.log_level '{}' is not one of trace|debug|info|warn|error",
                self.observability.log_level
            )));
        }

        if !matches!(
            self.observability.log_format.to_lowercase().as_str(),
            "json" | "console"
        ) {
            return Err(PipelineError::invalid_config(format!(
                "observability.log_format '{}' is not one of json|console",
                self.observability.log_format
            )));
        }

        for (name, destination) in [
            ("relational", &self.destinations.relational),
            ("columnar", &self.destinations.columnar),
            ("timeseries", &self.destinations.timeseries),
        ] {
            if destination.enabled {
                if destination.database_url.is_empty() {
                    return Err(PipelineError::invalid_config(format!(
                        "destinations.{name}.database_url required when enabled"
                    )));
                }
                check_range(
                    &format!("destinations.{name}.pool_size"),
                    destination.pool_size,
                    1,
                    100,
                )?;
                if !matches!(
                    destination.tls_mode.as_str(),
                    "disable" | "require" | "verify-ca" | "verify-full"
                ) {
                    return Err(PipelineError::invalid_config(format!(
                        "destinations.{name}.tls_mode '{}' is not one of \
                         disable|require|verify-ca|verify-full",
                        destination.tls_mode
                    )));
                }
            }
        }

        if !self.masking.phi_patterns.is_empty() && self.masking.phi_secret.is_none() {
            return Err(PipelineError::invalid_config(
                "masking.phi_secret is required when any PHI pattern is configured",
            ));
        }

        for entry in &self.pipeline.tables {
            if entry.split('.').count() != 2 || entry.starts_with('.') || entry.ends_with('.') {
                return Err(PipelineError::invalid_config(format!(
                    "pipeline.tables entry '{entry}' must be 'keyspace.table'"
                )));
            }
        }

        Ok(())
    }

    /// Enabled destinations with their settings, in stable order.
    pub fn enabled_destinations(&self) -> Vec<(cdc_relay_domain::Destination, &DestinationSettings)> {
        use cdc_relay_domain::Destination;
        let mut enabled = Vec::new();
        if self.destinations.relational.enabled {
            enabled.push((Destination::Relational, &self.destinations.relational));
        }
        if self.destinations.columnar.enabled {
            enabled.push((Destination::Columnar, &self.destinations.columnar));
        }
        if self.destinations.timeseries.enabled {
            enabled.push((Destination::Timeseries, &self.destinations.timeseries));
        }
        enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        RelaySettings::default().validate().unwrap();
    }

    #[test]
    fn test_batch_size_range() {
        let mut settings = RelaySettings::default();
        settings.pipeline.batch_size = 0;
        assert!(settings.validate().is_err());

        settings.pipeline.batch_size = 10_001;
        assert!(settings.validate().is_err());

        settings.pipeline.batch_size = 10_000;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parallelism_range() {
        let mut settings = RelaySettings::default();
        settings.pipeline.max_parallelism = 65;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_poll_interval_range() {
        let mut settings = RelaySettings::default();
        settings.pipeline.poll_interval_ms = 9;
        assert!(settings.validate().is_err());
        settings.pipeline.poll_interval_ms = 60_001;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_backoff_multiplier_range() {
        let mut settings = RelaySettings::default();
        settings.retry.backoff_multiplier = 0.5;
        assert!(settings.validate().is_err());
        settings.retry.backoff_multiplier = 10.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_enabled_destination_requires_url() {
        let mut settings = RelaySettings::default();
        settings.destinations.relational.enabled = true;
        assert!(settings.validate().is_err());

        settings.destinations.relational.database_url = "sqlite::memory:".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_tls_mode_validated() {
        let mut settings = RelaySettings::default();
        settings.destinations.columnar.enabled = true;
        settings.destinations.columnar.database_url = "sqlite::memory:".to_string();
        settings.destinations.columnar.tls_mode = "maybe".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_phi_patterns_require_secret() {
        let mut settings = RelaySettings::default();
        settings.masking.phi_patterns = vec!["patient_id".to_string()];
        assert!(settings.validate().is_err());

        settings.masking.phi_secret = Some("k".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_table_entries_must_be_qualified() {
        let mut settings = RelaySettings::default();
        settings.pipeline.tables = vec!["users".to_string()];
        assert!(settings.validate().is_err());

        settings.pipeline.tables = vec!["ecommerce.users".to_string()];
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_log_format_validated() {
        let mut settings = RelaySettings::default();
        settings.observability.log_format = "xml".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_retry_policy_conversion() {
        let settings = RelaySettings::default();
        let policy = settings.retry.policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
        assert!(policy.jitter);
    }

    #[test]
    fn test_enabled_destinations_stable_order() {
        let mut settings = RelaySettings::default();
        settings.destinations.timeseries.enabled = true;
        settings.destinations.timeseries.database_url = "sqlite::memory:".to_string();
        settings.destinations.relational.enabled = true;
        settings.destinations.relational.database_url = "sqlite::memory:".to_string();

        let tags: Vec<_> = settings
            .enabled_destinations()
            .into_iter()
            .map(|(destination, _)| destination.as_str())
            .collect();
        assert_eq!(tags, vec!["relational", "timeseries"]);
    }
}
