//! Delivery client abstraction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::queue::QueueMessage;

/// Failure reported by the external messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network failure, timeout or downstream throttling; worth retrying
    #[error("Transient delivery error: {0}")]
    Transient(String),

    /// Rejected content or recipient; retrying cannot succeed
    #[error("Permanent delivery error: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            DeliveryError::Transient(reason) | DeliveryError::Permanent(reason) => reason,
        }
    }
}

/// Proof of a completed send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Identifier assigned by the platform, when it returns one
    pub provider_message_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn now(provider_message_id: Option<String>) -> Self {
        Self {
            provider_message_id,
            delivered_at: Utc::now(),
        }
    }
}

/// Sends one message to the external platform.
#[async_trait]
pub trait MessageDeliveryClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, message: &QueueMessage) -> Result<DeliveryReceipt, DeliveryError>;
}
