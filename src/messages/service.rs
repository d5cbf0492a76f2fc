//! Admission path: validate, rate limit, enqueue

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::queue::{DeadLetteredMessage, MessageQueueBackend, QueueMessage, RedrivenMessage};
use crate::ratelimit::{DistributedRateLimiter, RateLimitResult};
use crate::status::{MessageRecord, QueueStatus, StatusReporter, StatusStore, StatusUpdate};

use super::models::{BatchItemResult, SendMessageRequest, SendMessageResponse};
use super::validation::validate_send_request;

const DEFAULT_DLQ_PAGE: usize = 10;
const MAX_DLQ_PAGE: usize = 100;

/// Inputs for the delivery estimate returned on admission.
#[derive(Debug, Clone)]
pub struct MessageServiceConfig {
    pub max_content_length: usize,
    pub max_batch_size: usize,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub estimated_batch_seconds: u64,
}

impl From<&Settings> for MessageServiceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_content_length: settings.messages.max_content_length,
            max_batch_size: settings.messages.max_batch_size,
            batch_size: settings.worker.batch_size,
            max_concurrency: settings.worker.max_concurrency,
            estimated_batch_seconds: settings.worker.estimated_batch_seconds,
        }
    }
}

impl MessageServiceConfig {
    /// Batch rounds ahead of a message at `queue_depth`, times the batch time
    pub fn estimate_delivery(&self, queued_at: DateTime<Utc>, queue_depth: usize) -> DateTime<Utc> {
        let per_round = (self.batch_size * self.max_concurrency).max(1);
        let rounds = (queue_depth / per_round) as i64 + 1;
        queued_at + chrono::Duration::seconds(rounds * self.estimated_batch_seconds as i64)
    }
}

pub struct MessageService {
    rate_limiter: Arc<dyn DistributedRateLimiter>,
    queue: Arc<dyn MessageQueueBackend>,
    store: Arc<StatusStore>,
    reporter: StatusReporter,
    config: MessageServiceConfig,
}

impl MessageService {
    pub fn new(
        rate_limiter: Arc<dyn DistributedRateLimiter>,
        queue: Arc<dyn MessageQueueBackend>,
        store: Arc<StatusStore>,
        reporter: StatusReporter,
        config: MessageServiceConfig,
    ) -> Self {
        Self {
            rate_limiter,
            queue,
            store,
            reporter,
            config,
        }
    }

    pub fn config(&self) -> &MessageServiceConfig {
        &self.config
    }

    /// Admit one message.
    ///
    /// Invalid requests are rejected before any rate-limit token is spent;
    /// rate-limited requests are never enqueued.
    pub async fn send(&self, request: SendMessageRequest) -> Result<SendMessageResponse> {
        validate_send_request(&request, self.config.max_content_length)
            .map_err(AppError::Validation)?;

        let admission = self.rate_limiter.check(&request.user_id).await;
        if let RateLimitResult::Denied { retry_after, .. } = admission {
            return Err(AppError::RateLimited {
                retry_after,
                quota: admission.quota(),
            });
        }

        let message = QueueMessage::new(request.user_id, request.recipient_id, request.content)
            .with_media_urls(request.media_urls)
            .with_priority(request.priority)
            .with_metadata(request.metadata);
        let queued_at = message.enqueued_at;
        let status = StatusUpdate::queued(&message);

        let message_id = self.queue.enqueue(message).await?;
        self.reporter.report(status);

        let queue_depth = match self.queue.stats().await {
            Ok(stats) => stats.queue_depth,
            Err(e) => {
                tracing::debug!(error = %e, "Queue stats unavailable for delivery estimate");
                0
            }
        };

        tracing::debug!(message_id = %message_id, queue_depth = queue_depth, "Message queued");

        Ok(SendMessageResponse {
            success: true,
            message_id,
            queued_at,
            estimated_delivery: self.config.estimate_delivery(queued_at, queue_depth),
            rate_limit: admission.quota(),
        })
    }

    /// Admit each item independently, preserving request order.
    pub async fn send_batch(&self, requests: Vec<SendMessageRequest>) -> Result<Vec<BatchItemResult>> {
        if requests.is_empty() || requests.len() > self.config.max_batch_size {
            return Err(AppError::BatchTooLarge {
                max: self.config.max_batch_size,
            });
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = match self.send(request).await {
                Ok(response) => BatchItemResult::queued(response.message_id),
                Err(AppError::Validation(details)) => BatchItemResult {
                    details: Some(details),
                    ..BatchItemResult::failed("Validation failed")
                },
                Err(AppError::RateLimited { retry_after, .. }) => BatchItemResult {
                    retry_after: Some(retry_after),
                    ..BatchItemResult::failed("Rate limit exceeded")
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Batch item not queued");
                    BatchItemResult::failed("Message queue unavailable")
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    pub fn message_status(&self, message_id: Uuid) -> Result<MessageRecord> {
        self.store
            .get_message(message_id)
            .ok_or_else(|| AppError::NotFound(format!("message {}", message_id)))
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        Ok(self.store.get_queue_status().await?)
    }

    pub async fn dead_letters(&self, limit: Option<usize>) -> Result<Vec<DeadLetteredMessage>> {
        Ok(self.queue.dead_letters(page_size(limit)).await?)
    }

    /// Move DLQ entries back under fresh ids; old records stay dead-lettered.
    pub async fn redrive(&self, limit: Option<usize>) -> Result<Vec<RedrivenMessage>> {
        let redriven = self.queue.redrive_dead_letters(page_size(limit)).await?;

        for entry in &redriven {
            match self.store.get_message(entry.previous_message_id) {
                Some(previous) => self
                    .reporter
                    .report(StatusUpdate::redriven(&previous, entry.message_id)),
                None => tracing::debug!(
                    previous_message_id = %entry.previous_message_id,
                    "No status record for redriven message"
                ),
            }
        }

        tracing::info!(count = redriven.len(), "Redrove dead-lettered messages");
        Ok(redriven)
    }
}

fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_DLQ_PAGE).clamp(1, MAX_DLQ_PAGE)
}
