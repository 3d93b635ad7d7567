// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Metrics Endpoint
//!
//! Minimal HTTP server exposing the Prometheus metrics for scraping.
//! Requests are parsed with plain string matching - the endpoint serves a
//! single GET path to trusted scrapers on localhost, so a full HTTP stack
//! would be dead weight. Metrics are generated fresh on each request.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use cdc_relay_domain::PipelineError;

use crate::infrastructure::metrics::service::MetricsService;

/// Lightweight HTTP server for Prometheus scraping.
pub struct MetricsEndpoint {
    metrics_service: Arc<MetricsService>,
    port: u16,
    path: String,
}

impl MetricsEndpoint {
    /// Creates an endpoint serving `metrics_service` at `path` on `port`.
    pub fn new(metrics_service: Arc<MetricsService>, port: u16, path: impl Into<String>) -> Self {
        Self {
            metrics_service,
            port,
            path: path.into(),
        }
    }

    /// Binds and serves requests until the process exits.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PipelineError::internal_error(format!("Failed to bind metrics endpoint: {e}")))?;

        info!("Prometheus metrics endpoint started on http://{}{}", addr, self.path);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics_service = Arc::clone(&self.metrics_service);
                    let path = self.path.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_request(&mut stream, metrics_service, &path).await {
                            error!("Error handling metrics request: {}", e);
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

/// Handles a single request: the metrics path gets the exposition text,
/// everything else a 404.
async fn handle_request(
    stream: &mut tokio::net::TcpStream,
    metrics_service: Arc<MetricsService>,
    path: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buffer = [0; 1024];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    debug!("Received request: {}", request.lines().next().unwrap_or(""));

    if request.starts_with(&format!("GET {path}")) {
        match metrics_service.gather() {
            Ok(metrics_text) => {
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: \
                     {}\r\n\r\n{}",
                    metrics_text.len(),
                    metrics_text
                );
                stream.write_all(response.as_bytes()).await?;
                debug!("Sent metrics response ({} bytes)", metrics_text.len());
            }
            Err(e) => {
                let body = format!("Error generating metrics: {e}");
                let error_response = format!(
                    "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain\r\nContent-Length: \
                     {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(error_response.as_bytes()).await?;
                error!("Error generating metrics: {}", e);
            }
        }
    } else {
        let not_found_response =
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found";
        stream.write_all(not_found_response.as_bytes()).await?;
        debug!("Sent 404 response for: {}", request.lines().next().unwrap_or(""));
    }

    stream.flush().await?;
    Ok(())
}
