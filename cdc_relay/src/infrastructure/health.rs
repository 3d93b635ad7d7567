// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Health Aggregation and Endpoint
//!
//! Tracks per-dependency health (one entry per destination sink) and serves
//! the aggregate over a lightweight HTTP endpoint:
//!
//! - `healthy` when every tracked dependency is up → HTTP 200
//! - `unhealthy` otherwise (including "no dependencies probed yet") → 503
//!
//! The response body carries per-dependency `{status, latency_ms,
//! last_check}` plus process uptime and version, as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use cdc_relay_bootstrap::CancellationToken;
use cdc_relay_domain::{EventSink, PipelineError};

/// Health entry for one dependency.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DependencyHealth {
    /// `up` or `down`.
    pub status: String,
    /// Probe round-trip in milliseconds.
    pub latency_ms: f64,
    /// ISO-8601 timestamp of the last probe.
    pub last_check: String,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: String,
    uptime_seconds: f64,
    version: String,
    dependencies: BTreeMap<String, DependencyHealth>,
}

/// Aggregated health of every pipeline dependency.
pub struct HealthStatus {
    dependencies: RwLock<BTreeMap<String, DependencyHealth>>,
    started: Instant,
    version: String,
}

impl HealthStatus {
    /// Creates an empty (unhealthy) status tracker.
    pub fn new() -> Self {
        Self {
            dependencies: RwLock::new(BTreeMap::new()),
            started: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Updates one dependency's health entry.
    pub fn update_dependency(&self, name: &str, healthy: bool, latency: Duration) {
        let entry = DependencyHealth {
            status: if healthy { "up" } else { "down" }.to_string(),
            latency_ms: latency.as_secs_f64() * 1000.0,
            last_check: chrono::Utc::now().to_rfc3339(),
        };
        self.dependencies.write().insert(name.to_string(), entry);
    }

    /// `true` when at least one dependency is tracked and all are up.
    pub fn is_healthy(&self) -> bool {
        let dependencies = self.dependencies.read();
        !dependencies.is_empty() && dependencies.values().all(|dep| dep.status == "up")
    }

    /// Process uptime.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// JSON body for the health endpoint.
    pub fn to_json(&self) -> Result<String, PipelineError> {
        let report = HealthReport {
            status: if self.is_healthy() { "healthy" } else { "unhealthy" }.to_string(),
            uptime_seconds: self.uptime().as_secs_f64(),
            version: self.version.clone(),
            dependencies: self.dependencies.read().clone(),
        };
        serde_json::to_string(&report).map_err(PipelineError::from)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically probes every sink and records the results.
///
/// Runs until the shutdown token is cancelled.
pub async fn probe_sinks_loop(
    status: Arc<HealthStatus>,
    sinks: Vec<Arc<dyn EventSink>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        for sink in &sinks {
            let health = sink.health_check().await;
            status.update_dependency(sink.destination().as_str(), health.healthy, health.latency);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                debug!("Health prober stopping on shutdown signal");
                return;
            }
        }
    }
}

/// Lightweight HTTP server for the health endpoint.
pub struct HealthEndpoint {
    status: Arc<HealthStatus>,
    port: u16,
    path: String,
}

impl HealthEndpoint {
    /// Creates an endpoint serving `status` at `path` on `port`.
    pub fn new(status: Arc<HealthStatus>, port: u16, path: impl Into<String>) -> Self {
        Self {
            status,
            port,
            path: path.into(),
        }
    }

    /// Binds and serves requests until the process exits.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PipelineError::internal_error(format!("Failed to bind health endpoint: {e}")))?;

        info!("Health endpoint started on http://{}{}", addr, self.path);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let status = Arc::clone(&self.status);
                    let path = self.path.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_health_request(&mut stream, &status, &path).await {
                            error!("Error handling health request: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

async fn handle_health_request(
    stream: &mut tokio::net::TcpStream,
    status: &HealthStatus,
    path: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buffer = [0; 1024];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    debug!("Received request: {}", request.lines().next().unwrap_or(""));

    if request.starts_with(&format!("GET {path}")) {
        let body = status.to_json().unwrap_or_else(|_| "{\"status\":\"unhealthy\"}".to_string());
        let status_line = if status.is_healthy() {
            "HTTP/1.1 200 OK"
        } else {
            "HTTP/1.1 503 Service Unavailable"
        };
        let response = format!(
            "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
    } else {
        let not_found =
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found";
        stream.write_all(not_found.as_bytes()).await?;
    }

    stream.flush().await?;
    Ok(())
}
