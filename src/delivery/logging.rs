//! Delivery client that only logs, for local development.

use async_trait::async_trait;

use crate::queue::QueueMessage;

use super::client::{DeliveryError, DeliveryReceipt, MessageDeliveryClient};

pub struct LogDeliveryClient;

#[async_trait]
impl MessageDeliveryClient for LogDeliveryClient {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &QueueMessage) -> Result<DeliveryReceipt, DeliveryError> {
        tracing::info!(
            message_id = %message.message_id,
            user_id = %message.user_id,
            recipient_id = %message.recipient_id,
            content_chars = message.content.chars().count(),
            media = message.media_urls.len(),
            "Delivered message (log backend)"
        );
        Ok(DeliveryReceipt::now(None))
    }
}
