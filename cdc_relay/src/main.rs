// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # CDC Relay Binary
//!
//! Process entry point: parses and validates the CLI, loads configuration,
//! installs logging, assembles the pipeline with its observability
//! surfaces, and runs it until a shutdown signal.
//!
//! Exit codes: 0 for a clean shutdown, 1 for a fatal configuration or
//! startup error (and for the non-monotonic-offset invariant tripping,
//! which is a bug, not an operational condition).

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use cdc_relay::infrastructure::config::settings::RelaySettings;
use cdc_relay::infrastructure::config::load_settings;
use cdc_relay::infrastructure::decoder::JsonEntryDecoder;
use cdc_relay::infrastructure::dlq::DeadLetterWriter;
use cdc_relay::infrastructure::health::{probe_sinks_loop, HealthEndpoint, HealthStatus};
use cdc_relay::infrastructure::logging::init_logging;
use cdc_relay::infrastructure::masking::MaskingTransformer;
use cdc_relay::infrastructure::metrics::{MetricsEndpoint, MetricsService};
use cdc_relay::infrastructure::offsets::OffsetManager;
use cdc_relay::infrastructure::schema::SchemaRegistry;
use cdc_relay::infrastructure::sinks::{ColumnarSink, TimeSeriesSink, TransactionalSqlSink};
use cdc_relay::Pipeline;
use cdc_relay_bootstrap::{
    parse_and_validate, Commands, ConsoleLogger, ShutdownCoordinator, ValidatedCli,
    DEFAULT_DRAIN_DEADLINE_SECS, EXIT_CONFIG_ERROR, EXIT_SUCCESS,
};
use cdc_relay_domain::{Destination, EventSink, PipelineError};

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = match parse_and_validate() {
        Ok(cli) => cli,
        Err(parse_error) => {
            eprintln!("cdc_relay: {parse_error}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let logger = ConsoleLogger::new();

    match cli.command.clone() {
        Commands::ValidateConfig { path } => match load_settings(Some(&path), &logger) {
            Ok(_) => {
                println!("Configuration is valid: {}", path.display());
                EXIT_SUCCESS
            }
            Err(config_error) => {
                eprintln!("cdc_relay: {config_error}");
                EXIT_CONFIG_ERROR
            }
        },
        Commands::Run { .. } => match run_pipeline(cli, &logger).await {
            Ok(()) => EXIT_SUCCESS,
            Err(fatal) => {
                error!(error = %fatal, "Pipeline terminated with a fatal error");
                eprintln!("cdc_relay: {fatal}");
                EXIT_CONFIG_ERROR
            }
        },
    }
}

async fn run_pipeline(cli: ValidatedCli, logger: &ConsoleLogger) -> Result<(), PipelineError> {
    let mut settings = load_settings(cli.config.as_deref(), logger)?;
    apply_cli_overrides(&mut settings, &cli)?;

    init_logging(
        &settings.observability.log_level,
        &settings.observability.log_format,
    )?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting CDC relay");

    let metrics = Arc::new(MetricsService::new()?);
    let masking = Arc::new(MaskingTransformer::new(&settings.masking)?);
    let registry = Arc::new(SchemaRegistry::new());
    let offsets = Arc::new(OffsetManager::new());
    let dlq = Arc::new(DeadLetterWriter::new(settings.dlq_directory.clone()).await?);

    let sinks = build_sinks(&settings, &metrics)?;
    if sinks.is_empty() {
        return Err(PipelineError::invalid_config(
            "no destinations enabled; enable at least one of destinations.{relational,columnar,timeseries}",
        ));
    }

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(DEFAULT_DRAIN_DEADLINE_SECS));
    let _signal_task = coordinator.listen_for_signals();

    // Observability surfaces run for the whole process lifetime.
    let metrics_endpoint = MetricsEndpoint::new(
        Arc::clone(&metrics),
        settings.observability.metrics_port,
        settings.observability.metrics_path.clone(),
    );
    tokio::spawn(async move {
        if let Err(endpoint_error) = metrics_endpoint.start().await {
            error!(error = %endpoint_error, "Metrics endpoint failed");
        }
    });

    let health = Arc::new(HealthStatus::new());
    let health_endpoint = HealthEndpoint::new(
        Arc::clone(&health),
        settings.observability.health_port,
        settings.observability.health_path.clone(),
    );
    tokio::spawn(async move {
        if let Err(endpoint_error) = health_endpoint.start().await {
            error!(error = %endpoint_error, "Health endpoint failed");
        }
    });
    tokio::spawn(probe_sinks_loop(
        Arc::clone(&health),
        sinks.clone(),
        Duration::from_secs(10),
        coordinator.token(),
    ));

    let pipeline = Pipeline::new(
        settings,
        Arc::new(JsonEntryDecoder::new()),
        sinks,
        registry,
        masking,
        offsets,
        dlq,
        metrics,
        coordinator,
    );

    let summary = pipeline.run().await?;
    info!(
        entries = summary.entries_read,
        dispatched = summary.events_dispatched,
        dead_lettered = summary.events_dead_lettered,
        "CDC relay stopped"
    );
    Ok(())
}

fn apply_cli_overrides(
    settings: &mut RelaySettings,
    cli: &ValidatedCli,
) -> Result<(), PipelineError> {
    if let Some(ref level) = cli.log_level {
        settings.observability.log_level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        settings.observability.log_format = format.clone();
    }

    if let Commands::Run {
        keyspace,
        table,
        commitlog_dir,
    } = &cli.command
    {
        if let Some(keyspace) = keyspace {
            settings.source.keyspace = keyspace.clone();
        }
        if !table.is_empty() {
            let keyspace = settings.source.keyspace.clone();
            settings.pipeline.tables = table
                .iter()
                .map(|name| format!("{keyspace}.{name}"))
                .collect();
        }
        if let Some(dir) = commitlog_dir {
            settings.source.commitlog_directory = dir.clone();
        }
    }

    settings.validate()
}

fn build_sinks(
    settings: &RelaySettings,
    metrics: &Arc<MetricsService>,
) -> Result<Vec<Arc<dyn EventSink>>, PipelineError> {
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();

    for (destination, destination_settings) in settings.enabled_destinations() {
        let sink: Arc<dyn EventSink> = match destination {
            Destination::Relational => Arc::new(TransactionalSqlSink::relational(
                destination_settings.database_url.clone(),
                destination_settings.pool_size,
            )),
            Destination::Columnar => Arc::new(ColumnarSink::new(
                destination_settings.database_url.clone(),
                destination_settings.pool_size,
                Some(Arc::clone(metrics)),
            )),
            Destination::Timeseries => Arc::new(TimeSeriesSink::new(
                destination_settings.database_url.clone(),
                destination_settings.pool_size,
            )),
        };
        sinks.push(sink);
    }

    Ok(sinks)
}
