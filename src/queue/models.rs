//! Queue data models

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{QueueConfig as SettingsQueueConfig, MAX_RECEIVE_BATCH};

/// Runtime configuration shared by every queue backend
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lease granted on receive; an unacknowledged message reappears after it
    pub visibility_timeout: Duration,
    /// Failed deliveries after which a message is dead-lettered
    pub max_receive_count: u32,
    /// Upper bound on `receive_batch` size
    pub max_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(90),
            max_receive_count: 3,
            max_batch_size: MAX_RECEIVE_BATCH,
        }
    }
}

impl From<&SettingsQueueConfig> for QueueConfig {
    fn from(settings: &SettingsQueueConfig) -> Self {
        Self {
            visibility_timeout: Duration::from_secs(settings.visibility_timeout_seconds),
            max_receive_count: settings.max_receive_count,
            max_batch_size: MAX_RECEIVE_BATCH,
        }
    }
}

/// An outbound message held by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub user_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries that ended without an ack
    #[serde(default)]
    pub receive_count: u32,
    /// End of the current lease, set only while the message is received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_deadline: Option<DateTime<Utc>>,
    /// Token of the current lease; required by ack, nack and dead_letter
    #[serde(skip)]
    pub receipt_handle: Option<String>,
}

impl QueueMessage {
    pub fn new(
        user_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            user_id: user_id.into(),
            recipient_id: recipient_id.into(),
            content: content.into(),
            media_urls: Vec::new(),
            priority: 0,
            metadata: None,
            enqueued_at: Utc::now(),
            receive_count: 0,
            visibility_deadline: None,
            receipt_handle: None,
        }
    }

    pub fn with_media_urls(mut self, media_urls: Vec<String>) -> Self {
        self.media_urls = media_urls;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Time left on the lease, `None` when not leased or already lapsed
    pub fn lease_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.visibility_deadline
            .and_then(|deadline| (deadline - now).to_std().ok())
            .filter(|remaining| !remaining.is_zero())
    }

    /// Clear lease state before the message goes back to the pool
    pub(crate) fn release(&mut self) {
        self.visibility_deadline = None;
        self.receipt_handle = None;
    }
}

/// A message parked in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetteredMessage {
    pub message: QueueMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Old and new id of a message moved from the DLQ back to the main queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedrivenMessage {
    pub previous_message_id: Uuid,
    pub message_id: Uuid,
}

/// Result of returning lapsed leases to the pool.
///
/// `dead_lettered` holds every message moved to the DLQ by lease expiry since
/// the previous `reclaim_expired` call, including those reclaimed implicitly
/// during receive or settlement, so each one is handed out exactly once.
#[derive(Debug, Clone, Default)]
pub struct ReclaimOutcome {
    /// Lapsed leases this call returned to the pool
    pub requeued: usize,
    pub dead_lettered: Vec<DeadLetteredMessage>,
}

impl ReclaimOutcome {
    pub fn total(&self) -> usize {
        self.requeued + self.dead_lettered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// What happened to a message returned with `nack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back in the pool, visible again at the given time
    Requeued { visible_at: DateTime<Utc> },
    /// Receive budget exhausted; moved to the DLQ
    DeadLettered,
}

/// Statistics about the queue backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueBackendStats {
    pub backend_type: String,
    /// Messages waiting to be received, including delayed redeliveries
    pub queue_depth: usize,
    pub messages_in_flight: usize,
    pub dlq_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_defaults() {
        let msg = QueueMessage::new("creator-1", "fan-9", "hello");

        assert!(!msg.message_id.is_nil());
        assert_eq!(msg.receive_count, 0);
        assert!(msg.media_urls.is_empty());
        assert!(msg.visibility_deadline.is_none());
        assert!(msg.receipt_handle.is_none());
    }

    #[test]
    fn test_serialization_uses_camel_case_and_skips_receipt() {
        let mut msg = QueueMessage::new("creator-1", "fan-9", "hello")
            .with_media_urls(vec!["https://cdn.example.com/a.jpg".to_string()]);
        msg.receipt_handle = Some("secret".to_string());

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["userId"], "creator-1");
        assert_eq!(json["mediaUrls"][0], "https://cdn.example.com/a.jpg");
        assert!(json.get("receiptHandle").is_none());
        assert!(json.get("visibilityDeadline").is_none());
    }

    #[test]
    fn test_lease_remaining() {
        let now = Utc::now();
        let mut msg = QueueMessage::new("u", "r", "c");
        assert!(msg.lease_remaining(now).is_none());

        msg.visibility_deadline = Some(now + chrono::Duration::seconds(30));
        assert_eq!(msg.lease_remaining(now), Some(Duration::from_secs(30)));

        msg.visibility_deadline = Some(now - chrono::Duration::seconds(1));
        assert!(msg.lease_remaining(now).is_none());
    }
}
