//! Leased outbound message queue.
//!
//! At-least-once, best-effort FIFO queue with SQS-style visibility timeouts:
//! a receive leases a message for `visibility_timeout`, an ack removes it, a
//! nack or lapsed lease makes it visible again, and messages that fail
//! `max_receive_count` times move to the dead-letter queue.

mod backend;
mod factory;
mod memory_backend;
mod models;
mod redis_backend;

pub use backend::{MessageQueueBackend, QueueBackendError};
pub use factory::create_queue_backend;
pub use memory_backend::MemoryQueueBackend;
pub use models::{
    DeadLetteredMessage, NackOutcome, QueueBackendStats, QueueConfig, QueueMessage,
    ReclaimOutcome, RedrivenMessage,
};
pub use redis_backend::RedisQueueBackend;
