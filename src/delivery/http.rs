//! HTTP delivery client for the external messaging platform.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::queue::QueueMessage;

use super::client::{DeliveryError, DeliveryReceipt, MessageDeliveryClient};

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpDeliveryConfig {
    /// Base URL of the platform API; messages are posted to `{base_url}/messages`
    pub base_url: String,
    /// Bearer token sent with every request
    pub api_token: Option<String>,
    /// Request timeout
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    message_id: String,
    user_id: &'a str,
    recipient_id: &'a str,
    content: &'a str,
    media_urls: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    #[serde(default, alias = "messageId")]
    id: Option<String>,
}

/// Delivers messages with `POST {base_url}/messages`.
///
/// 2xx is a success. 408, 429, 5xx, timeouts and connection failures are
/// transient; every other status is permanent.
pub struct HttpDeliveryClient {
    client: Client,
    config: HttpDeliveryConfig,
}

impl HttpDeliveryClient {
    pub fn new(config: HttpDeliveryConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.config.base_url.trim_end_matches('/'))
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
    let reason = if body.is_empty() {
        format!("platform responded {}", status.as_u16())
    } else {
        format!("platform responded {}: {}", status.as_u16(), truncate(body, 200))
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        DeliveryError::Transient(reason)
    } else {
        DeliveryError::Permanent(reason)
    }
}

fn classify_transport(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        DeliveryError::Transient(err.to_string())
    } else if err.is_builder() {
        DeliveryError::Permanent(err.to_string())
    } else {
        DeliveryError::Transient(err.to_string())
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl MessageDeliveryClient for HttpDeliveryClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, message: &QueueMessage) -> Result<DeliveryReceipt, DeliveryError> {
        let request = SendMessageRequest {
            message_id: message.message_id.to_string(),
            user_id: &message.user_id,
            recipient_id: &message.recipient_id,
            content: &message.content,
            media_urls: &message.media_urls,
            metadata: message.metadata.as_ref(),
        };

        let mut builder = self
            .client
            .post(self.endpoint())
            // Redeliveries reuse the id so the platform can drop duplicates
            .header("Idempotency-Key", message.message_id.to_string())
            .json(&request);
        if let Some(token) = &self.config.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();

        if status.is_success() {
            let parsed = response
                .json::<SendMessageResponse>()
                .await
                .unwrap_or_default();
            tracing::debug!(
                message_id = %message.message_id,
                status = status.as_u16(),
                "Platform accepted message"
            );
            return Ok(DeliveryReceipt::now(parsed.id));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());

        assert!(!classify_status(StatusCode::BAD_REQUEST, "bad recipient").is_retryable());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_retryable());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, "").is_retryable());
    }

    #[test]
    fn test_reason_includes_truncated_body() {
        let body = "x".repeat(500);
        let err = classify_status(StatusCode::BAD_REQUEST, &body);
        assert!(err.reason().starts_with("platform responded 400: "));
        assert!(err.reason().len() < 250);
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let client = HttpDeliveryClient::new(HttpDeliveryConfig {
            base_url: "http://platform.local/api/".to_string(),
            api_token: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(client.endpoint(), "http://platform.local/api/messages");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let client = HttpDeliveryClient::new(HttpDeliveryConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_token: Some("token".to_string()),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let err = client
            .send(&QueueMessage::new("creator", "fan", "hello"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
