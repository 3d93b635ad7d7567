// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Retry Engine
//!
//! Exponential backoff with jitter for destination writes, plus the
//! retryable-vs-permanent error classifier.
//!
//! ## Backoff schedule
//!
//! Attempt `k` (1-indexed) sleeps
//! `min(max_delay, base_delay * multiplier^(k-1))`, optionally jittered by a
//! uniform plus-or-minus 25%. Classification is by error class and message
//! content, never by timing: a slow success is a success.
//!
//! ## Classification
//!
//! - Retryable: connection/network failures, timeouts, and any message
//!   containing one of the transient markers (connection, timeout,
//!   temporary, unavailable, network, unreachable, refused, reset, broken
//!   pipe).
//! - Permanent: authentication failed, permission denied, syntax error,
//!   invalid, does not exist.
//! - Default: retryable - when in doubt the pipeline keeps trying, because
//!   stalling progress on a mis-classified transient fault is worse than a
//!   few wasted attempts on a permanent one.
//!
//! ## Cancellation
//!
//! Backoff sleeps race the shutdown token; a cancelled retry returns the
//! last error immediately at the next wakeup so the caller can drain the
//! batch to the DLQ instead of leaving it in limbo.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use cdc_relay_bootstrap::CancellationToken;
use cdc_relay_domain::PipelineError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Exponential multiplier per attempt.
    pub multiplier: f64,
    /// Whether to jitter each delay by a uniform plus-or-minus 25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Classification of a write failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Retryable,
    /// Retrying cannot help; fail immediately.
    Permanent,
}

/// Message substrings that mark a failure as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "connection",
    "timeout",
    "temporary",
    "unavailable",
    "network",
    "unreachable",
    "refused",
    "reset",
    "broken pipe",
];

/// Message substrings that mark a failure as permanent.
const PERMANENT_PATTERNS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "syntax error",
    "invalid",
    "does not exist",
];

/// Classifies an error as retryable or permanent.
///
/// Pre-classified variants win; for everything else the message is matched
/// against the transient patterns first, then the permanent ones, and the
/// default is retryable (fail-safe toward progress).
pub fn classify_error(error: &PipelineError) -> ErrorClass {
    match error {
        PipelineError::RetryableWrite(_) => return ErrorClass::Retryable,
        PipelineError::PermanentWrite(_) => return ErrorClass::Permanent,
        PipelineError::IoError(_) => return ErrorClass::Retryable,
        _ => {}
    }

    let message = error.to_string().to_lowercase();

    for pattern in RETRYABLE_PATTERNS {
        if message.contains(pattern) {
            return ErrorClass::Retryable;
        }
    }

    for pattern in PERMANENT_PATTERNS {
        if message.contains(pattern) {
            return ErrorClass::Permanent;
        }
    }

    ErrorClass::Retryable
}

/// Computes the backoff delay for a 1-indexed attempt number.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let raw = policy.base_delay.as_secs_f64() * policy.multiplier.powi(exponent as i32);
    let mut delay = raw.min(policy.max_delay.as_secs_f64());

    if policy.jitter {
        let jitter_range = delay * 0.25;
        if jitter_range > 0.0 {
            let offset = rand::rng().random_range(-jitter_range..=jitter_range);
            delay += offset;
        }
    }

    Duration::from_secs_f64(delay.max(0.0))
}

/// Executes `operation` under the retry policy.
///
/// Permanent errors and exhausted budgets return the final error; the
/// caller decides what happens to the batch (dead-letter it, do not advance
/// the offset). Cancellation interrupts the next backoff sleep.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    shutdown: &CancellationToken,
    mut operation: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if classify_error(&error) == ErrorClass::Permanent {
                    error!(
                        operation = operation_name,
                        attempt,
                        error = %error,
                        "Permanent error, not retrying"
                    );
                    return Err(PipelineError::PermanentWrite(error.to_string()));
                }

                if attempt >= policy.max_attempts {
                    error!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %error,
                        "Retry budget exhausted"
                    );
                    return Err(PipelineError::RetryableWrite(format!(
                        "{error} (after {attempt} attempts)"
                    )));
                }

                let delay = backoff_delay(policy, attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after error"
                );
                last_error = Some(error);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => {
                        warn!(
                            operation = operation_name,
                            "Retry cancelled by shutdown"
                        );
                        let final_error = last_error
                            .take()
                            .unwrap_or_else(|| PipelineError::internal_error("retry cancelled"));
                        return Err(PipelineError::RetryableWrite(format!(
                            "{final_error} (cancelled by shutdown)"
                        )));
                    }
                }
            }
        }
    }

    // Unreachable: the loop always returns. Kept to satisfy the compiler
    // without an unwrap.
    Err(last_error.unwrap_or_else(|| PipelineError::internal_error("retry loop fell through")))
}
