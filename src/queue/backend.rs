//! Backend trait for the outbound message queue.
//!
//! The queue is the single synchronization point between the HTTP layer and
//! the dispatch workers. A receive hands out a lease (visibility timeout plus
//! receipt handle); only the current lease holder may settle the message.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::redis::PoolError;

use super::models::{
    DeadLetteredMessage, NackOutcome, QueueBackendStats, QueueMessage, ReclaimOutcome,
    RedrivenMessage,
};

/// Errors that can occur during queue backend operations.
#[derive(Debug, Error)]
pub enum QueueBackendError {
    /// Backend is temporarily unavailable (e.g., circuit breaker open)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The caller's lease expired or was superseded by another receive
    #[error("Lease lost for message {message_id}")]
    LeaseLost { message_id: Uuid },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PoolError> for QueueBackendError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Redis(e) => QueueBackendError::Redis(e),
            PoolError::CircuitOpen => {
                QueueBackendError::Unavailable("Circuit breaker is open".to_string())
            }
            PoolError::ConnectionUnavailable(msg) => QueueBackendError::Unavailable(msg),
        }
    }
}

/// Backend trait for leased message queues.
///
/// # Thread Safety
///
/// Implementations are shared between the HTTP handlers, every worker task
/// and the maintenance task, so they must be `Send + Sync` and make each
/// lease transition atomic.
#[async_trait]
pub trait MessageQueueBackend: Send + Sync {
    fn backend_type(&self) -> &'static str;

    /// Store a message and return its id.
    async fn enqueue(&self, message: QueueMessage) -> Result<Uuid, QueueBackendError>;

    /// Lease up to `max_messages` visible messages.
    ///
    /// Waits up to `wait` for a message when the queue is empty. Each returned
    /// message carries a fresh receipt handle and visibility deadline.
    async fn receive_batch(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueBackendError>;

    /// Remove a delivered message.
    async fn ack(&self, message_id: Uuid, receipt: &str) -> Result<(), QueueBackendError>;

    /// Return a message to the pool after a failed delivery, visible again
    /// after `delay`. Dead-letters it once the receive budget is spent.
    async fn nack(
        &self,
        message_id: Uuid,
        receipt: &str,
        delay: Duration,
    ) -> Result<NackOutcome, QueueBackendError>;

    /// Move a leased message straight to the DLQ.
    async fn dead_letter(
        &self,
        message_id: Uuid,
        receipt: &str,
        reason: &str,
    ) -> Result<(), QueueBackendError>;

    /// Return messages whose lease lapsed to the pool.
    ///
    /// The outcome lists every lease-expiry dead letter not yet handed out,
    /// so callers can record the terminal status.
    async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueBackendError>;

    /// Oldest DLQ entries first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetteredMessage>, QueueBackendError>;

    /// Move up to `limit` DLQ entries back to the main queue under new ids.
    async fn redrive_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<RedrivenMessage>, QueueBackendError>;

    async fn stats(&self) -> Result<QueueBackendStats, QueueBackendError>;
}
