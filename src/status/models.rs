//! Status records

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::queue::{DeadLetteredMessage, QueueMessage};

/// Lifecycle state of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    Queued,
    InFlight,
    Delivered,
    /// Last attempt failed transiently; the message will be redelivered
    Failed,
    DeadLettered,
}

impl MessageStatus {
    /// Terminal states never change once recorded
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::InFlight => "in-flight",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::DeadLettered => "dead-lettered",
        }
    }
}

/// Latest known state of a message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: Uuid,
    pub user_id: String,
    pub recipient_id: String,
    pub status: MessageStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redriven_from: Option<Uuid>,
}

/// One state transition reported by the API or a worker.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub message_id: Uuid,
    pub user_id: String,
    pub recipient_id: String,
    pub status: MessageStatus,
    /// Delivery attempts made so far
    pub attempts: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub redriven_from: Option<Uuid>,
}

impl StatusUpdate {
    fn for_message(message: &QueueMessage, status: MessageStatus) -> Self {
        Self {
            message_id: message.message_id,
            user_id: message.user_id.clone(),
            recipient_id: message.recipient_id.clone(),
            status,
            attempts: message.receive_count,
            error: None,
            at: Utc::now(),
            queued_at: message.enqueued_at,
            redriven_from: None,
        }
    }

    pub fn queued(message: &QueueMessage) -> Self {
        Self::for_message(message, MessageStatus::Queued)
    }

    /// Fresh record for a message moved back from the DLQ under `message_id`
    pub fn redriven(previous: &MessageRecord, message_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            user_id: previous.user_id.clone(),
            recipient_id: previous.recipient_id.clone(),
            status: MessageStatus::Queued,
            attempts: 0,
            error: None,
            at: now,
            queued_at: now,
            redriven_from: Some(previous.message_id),
        }
    }

    pub fn in_flight(message: &QueueMessage) -> Self {
        Self {
            attempts: message.receive_count + 1,
            ..Self::for_message(message, MessageStatus::InFlight)
        }
    }

    pub fn delivered(message: &QueueMessage) -> Self {
        Self {
            attempts: message.receive_count + 1,
            ..Self::for_message(message, MessageStatus::Delivered)
        }
    }

    pub fn failed(message: &QueueMessage, error: impl Into<String>) -> Self {
        Self {
            attempts: message.receive_count + 1,
            error: Some(error.into()),
            ..Self::for_message(message, MessageStatus::Failed)
        }
    }

    pub fn dead_lettered(message: &QueueMessage, error: impl Into<String>) -> Self {
        Self {
            attempts: message.receive_count + 1,
            error: Some(error.into()),
            ..Self::for_message(message, MessageStatus::DeadLettered)
        }
    }

    /// Dead-lettered by the queue itself after its last lease lapsed; the
    /// stored receive count already includes that attempt
    pub fn lease_expired(entry: &DeadLetteredMessage) -> Self {
        Self {
            error: Some(entry.reason.clone()),
            at: entry.dead_lettered_at,
            ..Self::for_message(&entry.message, MessageStatus::DeadLettered)
        }
    }
}

impl MessageRecord {
    pub(crate) fn from_update(update: &StatusUpdate) -> Self {
        Self {
            message_id: update.message_id,
            user_id: update.user_id.clone(),
            recipient_id: update.recipient_id.clone(),
            status: MessageStatus::Queued,
            attempts: 0,
            error: None,
            queued_at: update.queued_at,
            updated_at: update.at,
            delivered_at: None,
            redriven_from: update.redriven_from,
        }
    }

    /// Apply a transition; returns false when the record is already terminal
    pub(crate) fn apply(&mut self, update: &StatusUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if update.redriven_from.is_some() {
            self.redriven_from = update.redriven_from;
        }
        // A worker may report progress before the admission update lands
        if update.status == MessageStatus::Queued && self.status != MessageStatus::Queued {
            return true;
        }
        self.status = update.status;
        self.attempts = self.attempts.max(update.attempts);
        self.updated_at = update.at;
        if update.error.is_some() {
            self.error = update.error.clone();
        }
        if update.status == MessageStatus::Delivered {
            self.delivered_at = Some(update.at);
            self.error = None;
        }
        true
    }
}

/// Aggregate queue health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_depth: usize,
    pub messages_in_flight: usize,
    pub dlq_count: usize,
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Messages settled (delivered or dead-lettered) in the last 60 seconds
    pub messages_per_minute: u64,
}
