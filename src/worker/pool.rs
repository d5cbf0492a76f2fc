//! Semaphore-bounded polling loop feeding the dispatch worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::config::{QueueConfig, WorkerConfig};
use crate::metrics::WorkerMetrics;
use crate::queue::MessageQueueBackend;

use super::dispatch::DispatchWorker;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub batch_size: usize,
    /// Batches allowed in flight at once
    pub max_concurrency: usize,
    pub receive_wait: Duration,
    pub drain_timeout: Duration,
    /// Backoff applied while the queue cannot be polled
    pub poll_backoff: BackoffConfig,
}

impl WorkerPoolConfig {
    pub fn from_settings(worker: &WorkerConfig, queue: &QueueConfig) -> Self {
        Self {
            batch_size: worker.batch_size,
            max_concurrency: worker.max_concurrency,
            receive_wait: Duration::from_secs(queue.receive_wait_seconds),
            drain_timeout: Duration::from_secs(worker.drain_timeout_seconds),
            poll_backoff: BackoffConfig {
                initial_delay_ms: 500,
                max_delay_ms: 30_000,
                ..BackoffConfig::default()
            },
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerConfig::default(), &QueueConfig::default())
    }
}

/// Summary returned when the pool stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerPoolReport {
    pub batches_dispatched: u64,
    /// Whether every in-flight batch finished within the drain timeout
    pub drained: bool,
}

/// Polls the queue and hands batches to the dispatch worker.
///
/// A permit is taken before each receive and released only once the batch
/// is settled, so at most `max_concurrency` batches are outstanding and no
/// messages are leased that nobody is ready to deliver.
pub struct WorkerPool {
    queue: Arc<dyn MessageQueueBackend>,
    worker: Arc<DispatchWorker>,
    permits: Arc<Semaphore>,
    batches_dispatched: AtomicU64,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn MessageQueueBackend>,
        worker: Arc<DispatchWorker>,
        config: WorkerPoolConfig,
    ) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            queue,
            worker,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            batches_dispatched: AtomicU64::new(0),
            config: WorkerPoolConfig {
                max_concurrency,
                ..config
            },
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn batches_dispatched(&self) -> u64 {
        self.batches_dispatched.load(Ordering::Relaxed)
    }

    /// Run until a shutdown signal arrives, then wait for in-flight batches.
    #[tracing::instrument(
        name = "worker_pool",
        skip(self, shutdown),
        fields(
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            queue_backend = self.queue.backend_type()
        )
    )]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> WorkerPoolReport {
        tracing::info!("Worker pool started");
        let mut backoff = ExponentialBackoff::with_config(self.config.poll_backoff.clone());

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Lease-expiry dead letters never pass through a batch; record them here
            if let Err(e) = self.worker.reclaim_expired().await {
                tracing::debug!(error = %e, "Failed to reclaim expired leases before receive");
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                result = self.queue.receive_batch(self.config.batch_size, self.config.receive_wait) => result,
            };

            match received {
                Ok(messages) if messages.is_empty() => {
                    backoff.reset();
                }
                Ok(messages) => {
                    backoff.reset();
                    self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
                    let worker = self.worker.clone();
                    tokio::spawn(async move {
                        WorkerMetrics::batch_started();
                        worker.process_batch(messages).await;
                        WorkerMetrics::batch_finished();
                        drop(permit);
                    });
                }
                Err(e) => {
                    drop(permit);
                    WorkerMetrics::record_poll_error();
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempt(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to receive from queue"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let drained = self.drain().await;
        tracing::info!(
            batches_dispatched = self.batches_dispatched(),
            drained = drained,
            "Worker pool stopped"
        );

        WorkerPoolReport {
            batches_dispatched: self.batches_dispatched(),
            drained,
        }
    }

    /// Wait for every outstanding batch by reclaiming all permits
    async fn drain(&self) -> bool {
        let all = self.config.max_concurrency as u32;
        match timeout(self.config.drain_timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(
                    in_flight = self.config.max_concurrency - self.permits.available_permits(),
                    "Drain timeout, leases of unfinished batches will expire back to the queue"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use crate::delivery::{DeliveryError, DeliveryReceipt, MessageDeliveryClient};
    use crate::queue::{MemoryQueueBackend, QueueConfig as LeaseConfig, QueueMessage};
    use crate::status::{spawn_status_writer, StatusStore};
    use crate::worker::DispatchConfig;

    /// Tracks how many sends overlap
    struct GaugeClient {
        active: AtomicUsize,
        peak: AtomicUsize,
        sent: AtomicUsize,
        delay: Duration,
    }

    impl GaugeClient {
        fn new(delay: Duration) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                sent: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl MessageDeliveryClient for GaugeClient {
        fn name(&self) -> &'static str {
            "gauge"
        }

        async fn send(&self, _message: &QueueMessage) -> Result<DeliveryReceipt, DeliveryError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveryReceipt::now(None))
        }
    }

    fn pool_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            batch_size: 5,
            max_concurrency: 2,
            receive_wait: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(5),
            poll_backoff: BackoffConfig::default(),
        }
    }

    fn build(client: Arc<GaugeClient>) -> (Arc<MemoryQueueBackend>, Arc<WorkerPool>) {
        let queue = Arc::new(MemoryQueueBackend::new(LeaseConfig::default()));
        let store = Arc::new(StatusStore::new(queue.clone()));
        let (reporter, _handle) = spawn_status_writer(store, 256);
        let worker = Arc::new(DispatchWorker::new(
            queue.clone(),
            client,
            reporter,
            DispatchConfig::default(),
        ));
        let pool = Arc::new(WorkerPool::new(queue.clone(), worker, pool_config()));
        (queue, pool)
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let client = Arc::new(GaugeClient::new(Duration::from_millis(10)));
        let (queue, pool) = build(client.clone());
        for i in 0..20 {
            queue
                .enqueue(QueueMessage::new("creator", format!("fan-{}", i), "hi"))
                .await
                .unwrap();
        }

        let (tx, rx) = broadcast::channel(1);
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(rx).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.sent.load(Ordering::SeqCst) < 20 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(()).unwrap();
        let report = runner.await.unwrap();

        assert_eq!(client.sent.load(Ordering::SeqCst), 20);
        assert!(client.peak.load(Ordering::SeqCst) <= 2);
        assert!(report.batches_dispatched >= 4);
        assert!(report.drained);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.messages_in_flight, 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_batch() {
        let client = Arc::new(GaugeClient::new(Duration::from_millis(100)));
        let (queue, pool) = build(client.clone());
        queue.enqueue(QueueMessage::new("creator", "fan", "hi")).await.unwrap();

        let (tx, rx) = broadcast::channel(1);
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(rx).await })
        };

        while client.active.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(()).unwrap();
        let report = runner.await.unwrap();

        assert!(report.drained);
        assert_eq!(client.sent.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_idle_pool_stops_promptly() {
        let client = Arc::new(GaugeClient::new(Duration::ZERO));
        let (_queue, pool) = build(client);

        let (tx, rx) = broadcast::channel(1);
        let runner = tokio::spawn(async move { pool.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();

        let report = timeout(Duration::from_secs(1), runner).await.unwrap().unwrap();
        assert_eq!(report.batches_dispatched, 0);
        assert!(report.drained);
    }
}
