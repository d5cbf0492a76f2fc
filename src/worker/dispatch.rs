//! Per-batch delivery with partial failure reporting

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::backoff::BackoffConfig;
use crate::config::WorkerConfig;
use crate::delivery::{DeliveryError, MessageDeliveryClient};
use crate::metrics::DeliveryMetrics;
use crate::queue::{
    MessageQueueBackend, NackOutcome, QueueBackendError, QueueMessage, ReclaimOutcome,
};
use crate::status::{StatusReporter, StatusUpdate};
use crate::telemetry::{attributes, record_attributes};

const LEASE_LAPSED_REASON: &str = "lease expired before delivery";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound for a single outbound send
    pub delivery_timeout: Duration,
    /// Redelivery delay after a transient failure, by receive count
    pub retry_backoff: BackoffConfig,
}

impl From<&WorkerConfig> for DispatchConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            delivery_timeout: Duration::from_secs(config.delivery_timeout_seconds),
            retry_backoff: BackoffConfig {
                initial_delay_ms: config.retry_base_delay_ms,
                max_delay_ms: config.retry_max_delay_ms,
                ..BackoffConfig::default()
            },
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub message_id: Uuid,
    pub reason: String,
}

/// Outcome of one batch. Only messages listed in `batch_item_failures` are
/// left for redelivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
    pub delivered: usize,
    pub dead_lettered: usize,
}

impl BatchResponse {
    fn fail(&mut self, message_id: Uuid, reason: impl Into<String>) {
        self.batch_item_failures.push(BatchItemFailure {
            message_id,
            reason: reason.into(),
        });
    }
}

/// Delivers leased messages and settles each one with the queue.
pub struct DispatchWorker {
    queue: Arc<dyn MessageQueueBackend>,
    client: Arc<dyn MessageDeliveryClient>,
    reporter: StatusReporter,
    config: DispatchConfig,
}

impl DispatchWorker {
    pub fn new(
        queue: Arc<dyn MessageQueueBackend>,
        client: Arc<dyn MessageDeliveryClient>,
        reporter: StatusReporter,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            client,
            reporter,
            config,
        }
    }

    /// Deliver every message of a batch independently.
    ///
    /// Successes are acked, transient failures nacked with a growing delay,
    /// permanent failures dead-lettered without spending retries.
    #[tracing::instrument(skip(self, messages), fields(batch_size = messages.len(), client = self.client.name()))]
    pub async fn process_batch(&self, messages: Vec<QueueMessage>) -> BatchResponse {
        record_attributes(&tracing::Span::current(), [attributes::batch_size(messages.len())]);
        let mut response = BatchResponse::default();

        for message in messages {
            self.process_message(message, &mut response).await;
        }

        if !response.batch_item_failures.is_empty() {
            tracing::info!(
                delivered = response.delivered,
                dead_lettered = response.dead_lettered,
                failed = response.batch_item_failures.len(),
                "Batch settled with partial failures"
            );
        }
        response
    }

    /// Return lapsed leases to the queue and record those it dead-lettered
    pub async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueBackendError> {
        let outcome = self.queue.reclaim_expired().await?;
        if !outcome.dead_lettered.is_empty() {
            tracing::warn!(
                dead_lettered = outcome.dead_lettered.len(),
                "Messages dead-lettered after their final lease expired"
            );
        }
        self.reporter.report_reclaimed(&outcome);
        Ok(outcome)
    }

    #[tracing::instrument(
        name = "dispatch_message",
        skip_all,
        fields(message_id = %message.message_id, receive_count = message.receive_count)
    )]
    async fn process_message(&self, message: QueueMessage, response: &mut BatchResponse) {
        let message_id = message.message_id;
        record_attributes(
            &tracing::Span::current(),
            [
                attributes::message_id(message_id),
                attributes::user_id(&message.user_id),
                attributes::receive_count(message.receive_count),
            ],
        );
        let Some(receipt) = message.receipt_handle.clone() else {
            tracing::warn!(message_id = %message_id, "Received message without receipt handle");
            response.fail(message_id, "missing receipt handle");
            return;
        };

        let Some(lease_left) = message.lease_remaining(Utc::now()) else {
            tracing::warn!(
                message_id = %message_id,
                receive_count = message.receive_count,
                "Lease lapsed before delivery, leaving message for redelivery"
            );
            response.fail(message_id, LEASE_LAPSED_REASON);
            return;
        };

        self.reporter.report(StatusUpdate::in_flight(&message));

        let timeout = self.config.delivery_timeout.min(lease_left);
        let started = Instant::now();
        let (outcome, timed_out) =
            match tokio::time::timeout(timeout, self.client.send(&message)).await {
                Ok(result) => (result, false),
                Err(_) => {
                    DeliveryMetrics::record_timeout();
                    let reason = format!("delivery timed out after {}ms", timeout.as_millis());
                    (Err(DeliveryError::Transient(reason)), true)
                }
            };
        let latency = started.elapsed();

        match outcome {
            Ok(receipt_info) => {
                DeliveryMetrics::record_delivered(latency);
                match self.queue.ack(message_id, &receipt).await {
                    Ok(()) => {
                        tracing::debug!(
                            message_id = %message_id,
                            provider_message_id = ?receipt_info.provider_message_id,
                            "Message delivered"
                        );
                        self.reporter.report(StatusUpdate::delivered(&message));
                        mark_outcome("delivered");
                        response.delivered += 1;
                    }
                    Err(e) => {
                        // Delivered but the ack did not land: the message
                        // will be delivered again.
                        tracing::warn!(message_id = %message_id, error = %e, "Failed to ack delivered message");
                        mark_outcome("ack_failed");
                        response.fail(message_id, format!("ack failed: {}", e));
                    }
                }
            }
            Err(DeliveryError::Permanent(reason)) => {
                DeliveryMetrics::record_permanent_failure(latency);
                tracing::warn!(message_id = %message_id, reason = %reason, "Permanent delivery failure");
                match self.queue.dead_letter(message_id, &receipt, &reason).await {
                    Ok(()) => {
                        self.reporter
                            .report(StatusUpdate::dead_lettered(&message, reason));
                        mark_outcome("dead_lettered");
                        response.dead_lettered += 1;
                    }
                    Err(e) => {
                        log_settle_error(message_id, "dead_letter", &e);
                        response.fail(message_id, reason);
                    }
                }
            }
            Err(DeliveryError::Transient(reason)) => {
                if !timed_out {
                    DeliveryMetrics::record_transient_failure(latency);
                }
                let delay = self
                    .config
                    .retry_backoff
                    .delay_for_attempt(message.receive_count + 1);
                tracing::info!(
                    message_id = %message_id,
                    receive_count = message.receive_count,
                    retry_in_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient delivery failure"
                );
                match self.queue.nack(message_id, &receipt, delay).await {
                    Ok(NackOutcome::Requeued { .. }) => {
                        self.reporter.report(StatusUpdate::failed(&message, reason.clone()));
                        mark_outcome("requeued");
                    }
                    Ok(NackOutcome::DeadLettered) => {
                        self.reporter
                            .report(StatusUpdate::dead_lettered(&message, reason.clone()));
                        mark_outcome("dead_lettered");
                        response.dead_lettered += 1;
                    }
                    Err(e) => log_settle_error(message_id, "nack", &e),
                }
                response.fail(message_id, reason);
            }
        }
    }
}

fn mark_outcome(outcome: &str) {
    record_attributes(&tracing::Span::current(), [attributes::delivery_outcome(outcome)]);
}

fn log_settle_error(message_id: Uuid, operation: &str, err: &QueueBackendError) {
    match err {
        QueueBackendError::LeaseLost { .. } => tracing::warn!(
            message_id = %message_id,
            operation = operation,
            "Lease lost before settlement, message already handed back to the queue"
        ),
        e => tracing::error!(
            message_id = %message_id,
            operation = operation,
            error = %e,
            "Failed to settle message"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::delivery::DeliveryReceipt;
    use crate::queue::{MemoryQueueBackend, QueueConfig};
    use crate::status::{spawn_status_writer, MessageStatus, StatusStore};

    /// Client whose outcome is chosen by message content
    struct ScriptedClient {
        calls: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedClient {
        fn new() -> Self {
            Self {
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls(&self, content: &str) -> u32 {
            self.calls.lock().unwrap().get(content).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl MessageDeliveryClient for ScriptedClient {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, message: &QueueMessage) -> Result<DeliveryReceipt, DeliveryError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(message.content.clone())
                .or_insert(0) += 1;
            match message.content.as_str() {
                "transient" => Err(DeliveryError::Transient("503 from platform".to_string())),
                "permanent" => Err(DeliveryError::Permanent("recipient blocked".to_string())),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(DeliveryReceipt::now(None))
                }
                _ => Ok(DeliveryReceipt::now(Some("provider-1".to_string()))),
            }
        }
    }

    struct Harness {
        queue: Arc<MemoryQueueBackend>,
        store: Arc<StatusStore>,
        client: Arc<ScriptedClient>,
        worker: DispatchWorker,
        reporter: StatusReporter,
    }

    fn harness(delivery_timeout: Duration) -> Harness {
        harness_with_queue(delivery_timeout, QueueConfig::default())
    }

    fn harness_with_queue(delivery_timeout: Duration, queue_config: QueueConfig) -> Harness {
        let queue = Arc::new(MemoryQueueBackend::new(queue_config));
        let store = Arc::new(StatusStore::new(queue.clone()));
        let (reporter, _handle) = spawn_status_writer(store.clone(), 64);
        let client = Arc::new(ScriptedClient::new());
        let config = DispatchConfig {
            delivery_timeout,
            retry_backoff: BackoffConfig {
                initial_delay_ms: 1,
                max_delay_ms: 1,
                multiplier: 1.0,
                jitter_factor: 0.0,
            },
        };
        let worker = DispatchWorker::new(queue.clone(), client.clone(), reporter.clone(), config);
        Harness {
            queue,
            store,
            client,
            worker,
            reporter,
        }
    }

    async fn enqueue_all(queue: &MemoryQueueBackend, contents: &[&str]) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for content in contents {
            let id = queue
                .enqueue(QueueMessage::new("creator", "fan", *content))
                .await
                .unwrap();
            ids.push(id);
        }
        ids
    }

    #[tokio::test]
    async fn test_partial_batch_failure() {
        let h = harness(Duration::from_secs(1));
        let ids = enqueue_all(&h.queue, &["ok", "ok", "transient", "ok", "ok"]).await;

        let batch = h.queue.receive_batch(5, Duration::ZERO).await.unwrap();
        let response = h.worker.process_batch(batch).await;

        assert_eq!(response.delivered, 4);
        assert_eq!(response.batch_item_failures.len(), 1);
        assert_eq!(response.batch_item_failures[0].message_id, ids[2]);

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.messages_in_flight, 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let retry = h.queue.receive_batch(5, Duration::ZERO).await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].message_id, ids[2]);
        assert_eq!(h.client.calls("ok"), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_immediately() {
        let h = harness(Duration::from_secs(1));
        let ids = enqueue_all(&h.queue, &["permanent"]).await;

        let batch = h.queue.receive_batch(5, Duration::ZERO).await.unwrap();
        let response = h.worker.process_batch(batch).await;
        h.reporter.flush().await;

        assert_eq!(response.dead_lettered, 1);
        assert!(response.batch_item_failures.is_empty());
        assert_eq!(h.client.calls("permanent"), 1);

        let dlq = h.queue.dead_letters(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, "recipient blocked");

        let record = h.store.get_message(ids[0]).unwrap();
        assert_eq!(record.status, MessageStatus::DeadLettered);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_into_dlq() {
        let h = harness(Duration::from_secs(1));
        let ids = enqueue_all(&h.queue, &["transient"]).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let batch = h.queue.receive_batch(5, Duration::ZERO).await.unwrap();
            assert_eq!(batch.len(), 1);
            h.worker.process_batch(batch).await;
        }
        h.reporter.flush().await;

        assert_eq!(h.client.calls("transient"), 3);
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.dlq_count, 1);
        assert_eq!(stats.queue_depth, 0);

        let record = h.store.get_message(ids[0]).unwrap();
        assert_eq!(record.status, MessageStatus::DeadLettered);
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let h = harness(Duration::from_millis(20));
        enqueue_all(&h.queue, &["slow"]).await;

        let batch = h.queue.receive_batch(5, Duration::ZERO).await.unwrap();
        let response = h.worker.process_batch(batch).await;

        assert_eq!(response.delivered, 0);
        assert_eq!(response.batch_item_failures.len(), 1);
        assert!(response.batch_item_failures[0].reason.contains("timed out"));
        assert_eq!(h.queue.stats().await.unwrap().dlq_count, 0);
    }

    #[tokio::test]
    async fn test_lapsed_lease_is_not_delivered() {
        let h = harness(Duration::from_secs(1));
        enqueue_all(&h.queue, &["ok"]).await;

        let mut batch = h.queue.receive_batch(5, Duration::ZERO).await.unwrap();
        batch[0].visibility_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        let response = h.worker.process_batch(batch).await;

        assert_eq!(h.client.calls("ok"), 0);
        assert_eq!(response.batch_item_failures[0].reason, LEASE_LAPSED_REASON);
    }

    #[tokio::test]
    async fn test_reclaim_records_lease_expiry_dead_letters() {
        let h = harness_with_queue(
            Duration::from_secs(1),
            QueueConfig {
                visibility_timeout: Duration::from_millis(20),
                max_receive_count: 1,
                ..QueueConfig::default()
            },
        );
        let ids = enqueue_all(&h.queue, &["ok"]).await;
        let batch = h.queue.receive_batch(5, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);

        // The worker never settles it; the lease runs out on its only attempt
        tokio::time::sleep(Duration::from_millis(40)).await;
        let outcome = h.worker.reclaim_expired().await.unwrap();
        assert_eq!(outcome.dead_lettered.len(), 1);
        h.reporter.flush().await;

        let record = h.store.get_message(ids[0]).unwrap();
        assert_eq!(record.status, MessageStatus::DeadLettered);
        assert_eq!(h.store.get_queue_status().await.unwrap().dlq_count, 1);
    }

    #[tokio::test]
    async fn test_delivered_status_recorded() {
        let h = harness(Duration::from_secs(1));
        let ids = enqueue_all(&h.queue, &["ok"]).await;

        let batch = h.queue.receive_batch(5, Duration::ZERO).await.unwrap();
        h.worker.process_batch(batch).await;
        h.reporter.flush().await;

        let record = h.store.get_message(ids[0]).unwrap();
        assert_eq!(record.status, MessageStatus::Delivered);
        assert!(record.delivered_at.is_some());
        assert!(h.store.last_processed_at().is_some());
    }

    #[test]
    fn test_dispatch_config_from_settings() {
        let config = DispatchConfig::from(&WorkerConfig::default());
        assert_eq!(config.delivery_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_backoff.initial_delay_ms, 1_000);
        assert_eq!(config.retry_backoff.max_delay_ms, 30_000);
    }
}
