use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::Settings;
use crate::queue::MessageQueueBackend;
use crate::ratelimit::DistributedRateLimiter;
use crate::status::{StatusReporter, StatusStore};

/// Lapsed leases are normally reclaimed on receive; this covers idle queues
const LEASE_RECLAIM_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub ratelimit_cleanup_interval: Duration,
    pub lease_reclaim_interval: Duration,
    pub status_cleanup_interval: Duration,
    pub status_retention: Duration,
}

impl From<&Settings> for MaintenanceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            ratelimit_cleanup_interval: Duration::from_secs(settings.ratelimit.cleanup_interval_seconds),
            lease_reclaim_interval: Duration::from_secs(LEASE_RECLAIM_INTERVAL_SECS),
            status_cleanup_interval: Duration::from_secs(settings.status.cleanup_interval_seconds),
            status_retention: Duration::from_secs(settings.status.retention_seconds),
        }
    }
}

/// Periodic housekeeping: stale rate limit buckets, lapsed leases and
/// expired status records.
pub struct MaintenanceTask {
    config: MaintenanceConfig,
    rate_limiter: Arc<dyn DistributedRateLimiter>,
    queue: Arc<dyn MessageQueueBackend>,
    status_store: Arc<StatusStore>,
    reporter: StatusReporter,
    shutdown: broadcast::Receiver<()>,
}

impl MaintenanceTask {
    pub fn new(
        config: MaintenanceConfig,
        rate_limiter: Arc<dyn DistributedRateLimiter>,
        queue: Arc<dyn MessageQueueBackend>,
        status_store: Arc<StatusStore>,
        reporter: StatusReporter,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            rate_limiter,
            queue,
            status_store,
            reporter,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ratelimit_timer = tokio::time::interval(self.config.ratelimit_cleanup_interval);
        let mut reclaim_timer = tokio::time::interval(self.config.lease_reclaim_interval);
        let mut status_timer = tokio::time::interval(self.config.status_cleanup_interval);

        // Skip immediate first tick
        ratelimit_timer.tick().await;
        reclaim_timer.tick().await;
        status_timer.tick().await;

        tracing::info!(
            ratelimit_cleanup_secs = self.config.ratelimit_cleanup_interval.as_secs(),
            lease_reclaim_secs = self.config.lease_reclaim_interval.as_secs(),
            status_cleanup_secs = self.config.status_cleanup_interval.as_secs(),
            "Maintenance task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Maintenance task received shutdown signal");
                    break;
                }
                _ = ratelimit_timer.tick() => {
                    self.cleanup_rate_limits();
                }
                _ = reclaim_timer.tick() => {
                    self.reclaim_leases().await;
                }
                _ = status_timer.tick() => {
                    self.cleanup_status();
                }
            }
        }

        tracing::info!("Maintenance task stopped");
    }

    fn cleanup_rate_limits(&self) -> usize {
        let removed = self.rate_limiter.cleanup_stale();
        if removed > 0 {
            tracing::debug!(removed = removed, "Removed stale rate limit buckets");
        }
        removed
    }

    async fn reclaim_leases(&self) -> usize {
        match self.queue.reclaim_expired().await {
            Ok(outcome) if outcome.is_empty() => 0,
            Ok(outcome) => {
                tracing::info!(
                    requeued = outcome.requeued,
                    dead_lettered = outcome.dead_lettered.len(),
                    "Reclaimed expired leases"
                );
                self.reporter.report_reclaimed(&outcome);
                outcome.total()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reclaim expired leases");
                0
            }
        }
    }

    fn cleanup_status(&self) -> usize {
        self.status_store.cleanup_expired(self.config.status_retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueueBackend, QueueConfig, QueueMessage};
    use crate::ratelimit::{LocalRateLimiterBackend, RateLimitConfig, RateLimiter};
    use crate::status::{spawn_status_writer, MessageStatus, StatusUpdate};

    fn task(visibility: Duration) -> (MaintenanceTask, Arc<MemoryQueueBackend>, Arc<StatusStore>, broadcast::Sender<()>) {
        task_with_queue(QueueConfig {
            visibility_timeout: visibility,
            ..QueueConfig::default()
        })
    }

    fn task_with_queue(
        queue_config: QueueConfig,
    ) -> (MaintenanceTask, Arc<MemoryQueueBackend>, Arc<StatusStore>, broadcast::Sender<()>) {
        let queue = Arc::new(MemoryQueueBackend::new(queue_config));
        let store = Arc::new(StatusStore::new(queue.clone()));
        let limiter = Arc::new(LocalRateLimiterBackend::new(Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
        ))));
        let (tx, rx) = broadcast::channel(1);
        let config = MaintenanceConfig {
            ratelimit_cleanup_interval: Duration::from_millis(10),
            lease_reclaim_interval: Duration::from_millis(10),
            status_cleanup_interval: Duration::from_millis(10),
            status_retention: Duration::ZERO,
        };
        let (reporter, _handle) = spawn_status_writer(store.clone(), 16);
        let task = MaintenanceTask::new(config, limiter, queue.clone(), store.clone(), reporter, rx);
        (task, queue, store, tx)
    }

    #[tokio::test]
    async fn test_reclaims_lapsed_leases() {
        let (task, queue, _store, _tx) = task(Duration::from_millis(10));
        queue.enqueue(QueueMessage::new("creator", "fan", "hi")).await.unwrap();
        let leased = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        assert_eq!(leased.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.reclaim_leases().await, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.messages_in_flight, 0);
        assert_eq!(stats.queue_depth, 1);
    }

    #[tokio::test]
    async fn test_lease_expiry_dead_letter_is_recorded_then_cleaned() {
        let (task, queue, store, _tx) = task_with_queue(QueueConfig {
            visibility_timeout: Duration::from_millis(20),
            max_receive_count: 1,
            ..QueueConfig::default()
        });
        let message = QueueMessage::new("creator", "fan", "hi");
        let id = queue.enqueue(message.clone()).await.unwrap();
        store.apply(StatusUpdate::queued(&message));
        let leased = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        store.apply(StatusUpdate::in_flight(&leased[0]));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(task.reclaim_leases().await, 1);
        task.reporter.flush().await;

        assert_eq!(store.get_message(id).unwrap().status, MessageStatus::DeadLettered);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(task.cleanup_status(), 1);
        assert!(store.get_message(id).is_none());
    }

    #[tokio::test]
    async fn test_cleans_terminal_records() {
        let (task, _queue, store, _tx) = task(Duration::from_secs(90));
        store.apply(StatusUpdate::delivered(&QueueMessage::new("creator", "fan", "hi")));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(task.cleanup_status(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let (task, _queue, _store, tx) = task(Duration::from_secs(90));
        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(25)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
