use axum::{extract::DefaultBodyLimit, http::HeaderValue, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::api::api_routes;
use crate::config::Settings;

use super::AppState;

/// Worst-case JSON size of one character: a `\uXXXX\uXXXX` surrogate pair
const MAX_ESCAPED_BYTES_PER_CHAR: usize = 12;
/// Ids, media URLs, metadata and framing allowed per message
const PER_MESSAGE_OVERHEAD_BYTES: usize = 16 * 1024;

/// Largest request body: a full batch of maximum-length, fully escaped messages
fn max_body_bytes(settings: &Settings) -> usize {
    let per_message = settings.messages.max_content_length * MAX_ESCAPED_BYTES_PER_CHAR
        + PER_MESSAGE_OVERHEAD_BYTES;
    settings.messages.max_batch_size.max(1) * per_message
}

pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.server.cors_origins);
    let body_limit = max_body_bytes(&state.settings);

    Router::new()
        .merge(api_routes(state.clone()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(allowed)
}
