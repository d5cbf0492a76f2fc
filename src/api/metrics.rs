//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics::{self, QueueMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_metrics_from_state(&state).await;

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Refresh the queue gauges before scraping
async fn update_metrics_from_state(state: &AppState) {
    match state.queue.stats().await {
        Ok(stats) => QueueMetrics::set_sizes(stats.queue_depth, stats.messages_in_flight, stats.dlq_count),
        Err(e) => tracing::debug!(error = %e, "Queue stats unavailable for metrics"),
    }
}
