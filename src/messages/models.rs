//! Request and response bodies of the messages API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FieldError;
use crate::queue::{DeadLetteredMessage, RedrivenMessage};
use crate::ratelimit::RateLimitQuota;

/// Missing string fields deserialize as empty so validation can name them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    pub message_id: Uuid,
    pub queued_at: DateTime<Utc>,
    pub estimated_delivery: DateTime<Utc>,
    /// Sent as `X-RateLimit-*` headers, not in the body
    #[serde(skip)]
    pub rate_limit: RateLimitQuota,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendBatchRequest {
    #[serde(default)]
    pub messages: Vec<SendMessageRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Queued,
    Failed,
}

/// Outcome of one item of a send-batch request, in request order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub status: BatchItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl BatchItemResult {
    pub fn queued(message_id: Uuid) -> Self {
        Self {
            message_id: Some(message_id),
            status: BatchItemStatus::Queued,
            error: None,
            details: None,
            retry_after: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            message_id: None,
            status: BatchItemStatus::Failed,
            error: Some(error.into()),
            details: None,
            retry_after: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendBatchResponse {
    pub success: bool,
    pub results: Vec<BatchItemResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterListResponse {
    pub count: usize,
    pub messages: Vec<DeadLetteredMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedriveRequest {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedriveResponse {
    pub success: bool,
    pub redriven: Vec<RedrivenMessage>,
}
