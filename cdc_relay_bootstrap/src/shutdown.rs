// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Shutdown Coordination
//!
//! Manages graceful shutdown across the pipeline components.
//!
//! ## Shutdown sequence
//!
//! One external signal (SIGINT/SIGTERM) cancels a shared token. On
//! cancellation:
//!
//! 1. The dispatcher stops pulling from the commit-log tailer.
//! 2. Currently-sealed batches finish their commit attempt within a bounded
//!    drain deadline.
//! 3. Each sink worker closes its connection.
//! 4. In-progress retries are cancelled at their next backoff wakeup.
//!
//! The coordinator owns the token and the drain deadline; workers only see
//! cloned [`CancellationToken`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Default drain deadline for in-flight batches (in seconds).
pub const DEFAULT_DRAIN_DEADLINE_SECS: u64 = 10;

/// Cancellation token for signaling shutdown.
///
/// Lightweight clone-able token passed to the tailer loop, the dispatcher,
/// and each sink worker. `cancelled()` is level-triggered: it returns
/// immediately once the token has been cancelled, no matter how late a
/// worker starts waiting.
#[derive(Clone)]
pub struct CancellationToken {
    /// Shared cancellation flag
    cancelled: Arc<AtomicBool>,
    /// Notification for waiters
    notify: Arc<Notify>,
}

impl CancellationToken {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Creates a standalone token, useful in tests that do not need a full
    /// coordinator.
    pub fn standalone() -> Self {
        Self::new()
    }

    /// Cancel this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check if cancelled (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for cancellation (async).
    pub async fn cancelled(&self) {
        // Re-check after arming the notification so a cancel between the
        // first check and `notified().await` is not lost.
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Shutdown coordinator with drain-deadline enforcement.
///
/// The drain deadline bounds how long sealed batches may keep committing
/// after the shutdown signal; past the deadline the process exits and
/// uncommitted work is recovered on restart via the persisted offsets.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Cancellation token for the shutdown signal
    token: CancellationToken,

    /// Deadline for draining sealed batches
    drain_deadline: Duration,

    /// Shutdown initiated flag
    shutdown_initiated: Arc<AtomicBool>,

    /// Notification for shutdown completion
    shutdown_complete: Arc<Notify>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    ///
    /// # Arguments
    ///
    /// * `drain_deadline` - Maximum time to let in-flight batches finish
    pub fn new(drain_deadline: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_deadline,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_complete: Arc::new(Notify::new()),
        }
    }

    /// Get a cancellation token to pass to async tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The configured drain deadline.
    pub fn drain_deadline(&self) -> Duration {
        self.drain_deadline
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Initiate graceful shutdown: set the flag and cancel all tokens.
    pub fn initiate_shutdown(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!(
                "Initiating graceful shutdown (drain deadline: {:?})",
                self.drain_deadline
            );
            self.token.cancel();
        }
    }

    /// Wait for shutdown to complete within the drain deadline.
    ///
    /// Returns `true` if all components drained in time, `false` if the
    /// deadline expired and the shutdown was forced.
    pub async fn wait_for_drain(&self) -> bool {
        if !self.is_shutting_down() {
            tracing::warn!("wait_for_drain called but shutdown not initiated");
            return true;
        }

        tokio::select! {
            _ = self.shutdown_complete.notified() => {
                tracing::info!("Shutdown completed gracefully");
                true
            }
            _ = tokio::time::sleep(self.drain_deadline) => {
                tracing::warn!("Drain deadline expired, forcing shutdown");
                false
            }
        }
    }

    /// Signal that all components have finished draining.
    pub fn complete_shutdown(&self) {
        self.shutdown_complete.notify_waiters();
    }

    /// Installs SIGINT/SIGTERM handlers that initiate shutdown.
    ///
    /// Spawned once from the binary entry point; subsequent signals are
    /// absorbed by the idempotent `initiate_shutdown`.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();

            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(stream) => stream,
                    Err(error) => {
                        tracing::error!("Failed to install SIGTERM handler: {}", error);
                        if ctrl_c.await.is_ok() {
                            coordinator.initiate_shutdown();
                        }
                        return;
                    }
                };

                tokio::select! {
                    _ = ctrl_c => tracing::info!("SIGINT received"),
                    _ = sigterm.recv() => tracing::info!("SIGTERM received"),
                }
            }

            #[cfg(not(unix))]
            {
                if ctrl_c.await.is_ok() {
                    tracing::info!("Ctrl-C received");
                }
            }

            coordinator.initiate_shutdown();
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DRAIN_DEADLINE_SECS))
    }
}
