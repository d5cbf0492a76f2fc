//! Send request validation

use url::Url;

use crate::error::FieldError;

use super::models::SendMessageRequest;

/// Collect every field problem of a send request.
///
/// `max_content_length` counts characters, not bytes.
pub fn validate_send_request(
    request: &SendMessageRequest,
    max_content_length: usize,
) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    if request.user_id.trim().is_empty() {
        errors.push(FieldError::new("userId", "userId is required"));
    }
    if request.recipient_id.trim().is_empty() {
        errors.push(FieldError::new("recipientId", "recipientId is required"));
    }

    let content_length = request.content.chars().count();
    if content_length == 0 {
        errors.push(FieldError::new("content", "content is required"));
    } else if content_length > max_content_length {
        errors.push(FieldError::new(
            "content",
            format!("content must be at most {} characters", max_content_length),
        ));
    }

    for (i, media_url) in request.media_urls.iter().enumerate() {
        if !is_http_url(media_url) {
            errors.push(FieldError::new(
                format!("mediaUrls[{}]", i),
                "must be an absolute http or https URL",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_http_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}
