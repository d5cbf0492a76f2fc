//! Graceful shutdown handling for the dispatch service.
//!
//! Shutdown runs in order:
//! 1. Signal the worker pool and background tasks to stop
//! 2. Wait for in-flight batches to settle
//! 3. Flush pending status updates

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::WorkerConfig;
use crate::status::StatusReporter;
use crate::worker::WorkerPoolReport;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight batches (default: 30 seconds)
    pub drain_timeout: Duration,
    /// Time to wait for the status writer to catch up (default: 5 seconds)
    pub status_flush_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for ShutdownConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            drain_timeout: Duration::from_secs(config.drain_timeout_seconds),
            status_flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Handles graceful shutdown of the dispatch service
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    worker_pool: Option<JoinHandle<WorkerPoolReport>>,
    reporter: StatusReporter,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        shutdown_tx: broadcast::Sender<()>,
        worker_pool: Option<JoinHandle<WorkerPoolReport>>,
        reporter: StatusReporter,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            shutdown_tx,
            worker_pool,
            reporter,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(name = "graceful_shutdown", skip(self))]
    pub async fn execute(self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: Signal background tasks to stop
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling workers");
        let _ = self.shutdown_tx.send(());

        // Phase 2: Wait for in-flight batches
        tracing::info!("Phase 2: Draining in-flight batches");
        result.batches_drained = match self.worker_pool {
            // The pool enforces drain_timeout itself; the margin covers its exit
            Some(handle) => match timeout(self.config.drain_timeout + Duration::from_secs(1), handle).await {
                Ok(Ok(report)) => {
                    result.batches_dispatched = report.batches_dispatched;
                    report.drained
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Worker pool task failed");
                    false
                }
                Err(_) => {
                    tracing::warn!("Worker pool did not stop within drain timeout");
                    false
                }
            },
            None => true,
        };

        // Phase 3: Flush status updates
        tracing::info!("Phase 3: Flushing status updates");
        result.status_flushed = timeout(self.config.status_flush_timeout, self.reporter.flush())
            .await
            .is_ok();
        if !result.status_flushed {
            tracing::warn!("Status flush timeout, some updates may be lost");
        }

        result.duration = start.elapsed();
        result.success = result.batches_drained && result.status_flushed;

        tracing::info!(
            batches_dispatched = result.batches_dispatched,
            batches_drained = result.batches_drained,
            status_flushed = result.status_flushed,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every phase completed in time
    pub success: bool,
    pub batches_dispatched: u64,
    /// Whether in-flight batches settled before the timeout
    pub batches_drained: bool,
    pub status_flushed: bool,
    /// Total time taken for shutdown
    pub duration: Duration,
}
