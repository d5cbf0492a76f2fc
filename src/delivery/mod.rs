//! Outbound delivery to the external messaging platform.

mod client;
mod http;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{DeliveryConfig, WorkerConfig};

pub use client::{DeliveryError, DeliveryReceipt, MessageDeliveryClient};
pub use http::{HttpDeliveryClient, HttpDeliveryConfig};
pub use logging::LogDeliveryClient;

/// Create a delivery client based on configuration.
///
/// - `"http"`: `HttpDeliveryClient` posting to `delivery.base_url`
/// - `"log"` (default): `LogDeliveryClient`
pub fn create_delivery_client(
    delivery: &DeliveryConfig,
    worker: &WorkerConfig,
) -> Result<Arc<dyn MessageDeliveryClient>, reqwest::Error> {
    match delivery.backend.as_str() {
        "http" => {
            tracing::info!(base_url = %delivery.base_url, "Creating HTTP delivery client");
            let client = HttpDeliveryClient::new(HttpDeliveryConfig {
                base_url: delivery.base_url.clone(),
                api_token: delivery.api_token.clone(),
                timeout: Duration::from_secs(worker.delivery_timeout_seconds),
            })?;
            Ok(Arc::new(client))
        }
        other => {
            if other != "log" {
                tracing::warn!(backend = %other, "Unknown delivery backend, using log");
            }
            tracing::info!("Using log delivery client");
            Ok(Arc::new(LogDeliveryClient))
        }
    }
}
