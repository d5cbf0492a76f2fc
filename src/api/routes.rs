use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::messages::{
    list_dead_letters, message_status, queue_status, redrive_dead_letters, send_batch,
    send_message,
};
use crate::server::{api_key_auth, AppState};

use super::health::health;
use super::metrics::prometheus_metrics;

pub fn api_routes(state: AppState) -> Router<AppState> {
    let messages = Router::new()
        .route("/messages/send", post(send_message))
        .route("/messages/send-batch", post(send_batch))
        .route("/messages/status", get(queue_status))
        .route("/messages/{id}/status", get(message_status))
        .route("/messages/dlq", get(list_dead_letters))
        .route("/messages/dlq/redrive", post(redrive_dead_letters))
        .route_layer(middleware::from_fn_with_state(state, api_key_auth));

    Router::new()
        // Health & metrics stay reachable without an API key
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .merge(messages)
}
