// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # CLI Parsing and Validation
//!
//! Parses command-line arguments with clap and applies validation before
//! anything touches the file system or the network. Parsing and validation
//! are split so validation can be unit-tested without process arguments.
//!
//! ## Commands
//!
//! - `run` (default) - start the replication pipeline.
//! - `validate-config` - load and range-check a configuration file, then
//!   exit. Exit code 0 when valid, 1 otherwise.
//!
//! ## Exit codes
//!
//! The binary honors the CLI contract: 0 for clean shutdown, 1 for fatal
//! configuration or startup errors.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a clean shutdown.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for a fatal configuration or startup error.
pub const EXIT_CONFIG_ERROR: i32 = 1;

/// Errors produced by CLI validation.
#[derive(Debug, Error)]
pub enum ParseError {
    /// An argument failed validation.
    #[error("Invalid value for --{arg}: {reason}")]
    InvalidValue {
        /// Argument name.
        arg: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An argument contained characters that are never legitimate in this
    /// CLI (shell metacharacters, control bytes).
    #[error("Argument '{0}' contains disallowed characters")]
    DisallowedCharacters(String),
}

/// CDC relay command-line interface.
#[derive(Debug, Parser)]
#[command(
    name = "cdc_relay",
    about = "Replicates commit-log mutations to analytical warehouses with exactly-once delivery",
    version
)]
pub struct Cli {
    /// Path to the pipeline configuration file (TOML).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured log level (trace|debug|info|warn|error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Override the configured log format (json|console).
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Subcommand; defaults to `run`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Start the replication pipeline.
    Run {
        /// Restrict replication to one keyspace (overrides config).
        #[arg(long)]
        keyspace: Option<String>,

        /// Restrict replication to specific tables (repeatable).
        #[arg(long)]
        table: Vec<String>,

        /// Override the commit-log directory from configuration.
        #[arg(long)]
        commitlog_dir: Option<PathBuf>,
    },

    /// Load a configuration file, run range validation, and exit.
    ValidateConfig {
        /// Configuration file to validate.
        path: PathBuf,
    },
}

/// CLI arguments after validation.
#[derive(Debug)]
pub struct ValidatedCli {
    /// Global configuration file path, if provided.
    pub config: Option<PathBuf>,
    /// Log level override, if provided.
    pub log_level: Option<String>,
    /// Log format override, if provided.
    pub log_format: Option<String>,
    /// The validated command (defaulted to `Run` when absent).
    pub command: Commands,
}

/// Parse process arguments and validate them.
pub fn parse_and_validate() -> Result<ValidatedCli, ParseError> {
    validate_cli(Cli::parse())
}

/// Validate parsed CLI arguments.
///
/// Applies identifier and path checks to every user-supplied string and
/// normalizes the missing subcommand to `Run`.
pub fn validate_cli(cli: Cli) -> Result<ValidatedCli, ParseError> {
    if let Some(ref path) = cli.config {
        validate_argument(&path.to_string_lossy())?;
    }

    if let Some(ref level) = cli.log_level {
        let level_lower = level.to_lowercase();
        if !matches!(
            level_lower.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ParseError::InvalidValue {
                arg: "log-level".to_string(),
                reason: format!("'{level}' is not one of trace|debug|info|warn|error"),
            });
        }
    }

    if let Some(ref format) = cli.log_format {
        if !matches!(format.to_lowercase().as_str(), "json" | "console") {
            return Err(ParseError::InvalidValue {
                arg: "log-format".to_string(),
                reason: format!("'{format}' is not one of json|console"),
            });
        }
    }

    let command = match cli.command {
        Some(Commands::Run {
            keyspace,
            table,
            commitlog_dir,
        }) => {
            if let Some(ref keyspace) = keyspace {
                validate_identifier("keyspace", keyspace)?;
            }
            for name in &table {
                validate_identifier("table", name)?;
            }
            if let Some(ref dir) = commitlog_dir {
                validate_argument(&dir.to_string_lossy())?;
            }
            Commands::Run {
                keyspace,
                table,
                commitlog_dir,
            }
        }
        Some(Commands::ValidateConfig { path }) => {
            validate_argument(&path.to_string_lossy())?;
            Commands::ValidateConfig { path }
        }
        None => Commands::Run {
            keyspace: None,
            table: Vec::new(),
            commitlog_dir: None,
        },
    };

    Ok(ValidatedCli {
        config: cli.config,
        log_level: cli.log_level.map(|level| level.to_lowercase()),
        log_format: cli.log_format.map(|format| format.to_lowercase()),
        command,
    })
}

/// Rejects strings containing shell metacharacters or control bytes.
fn validate_argument(value: &str) -> Result<(), ParseError> {
    const DISALLOWED: &[char] = &['$', '`', ';', '|', '&', '<', '>', '\n', '\r', '\0'];
    if value.chars().any(|c| DISALLOWED.contains(&c)) {
        return Err(ParseError::DisallowedCharacters(value.to_string()));
    }
    Ok(())
}

/// Source identifiers are ASCII alphanumerics plus underscores.
fn validate_identifier(arg: &str, value: &str) -> Result<(), ParseError> {
    if value.is_empty() || value.len() > 128 {
        return Err(ParseError::InvalidValue {
            arg: arg.to_string(),
            reason: "must be 1-128 characters".to_string(),
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ParseError::InvalidValue {
            arg: arg.to_string(),
            reason: format!("'{value}' contains characters outside [A-Za-z0-9_]"),
        });
    }
    Ok(())
}
