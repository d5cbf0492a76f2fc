//! HTTP handlers for the messages API

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    Json,
};
use uuid::Uuid;

use crate::error::{insert_rate_limit_headers, AppError, FieldError, Result};
use crate::server::AppState;
use crate::status::{MessageRecord, QueueStatus};

use super::models::{
    DeadLetterListResponse, DeadLetterQuery, RedriveRequest, RedriveResponse, SendBatchRequest,
    SendBatchResponse, SendMessageRequest, SendMessageResponse,
};

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::Validation(vec![FieldError::new("body", rejection.body_text())]))
}

/// POST /messages/send
#[tracing::instrument(
    name = "http.send_message",
    skip(state, payload),
    fields(user_id = tracing::field::Empty)
)]
pub async fn send_message(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, HeaderMap, Json<SendMessageResponse>)> {
    let request = json_body(payload)?;
    tracing::Span::current().record("user_id", request.user_id.as_str());
    let response = state.messages.send(request).await?;

    let mut headers = HeaderMap::new();
    insert_rate_limit_headers(&mut headers, &response.rate_limit);
    Ok((StatusCode::ACCEPTED, headers, Json(response)))
}

/// POST /messages/send-batch
#[tracing::instrument(name = "http.send_batch", skip(state, payload))]
pub async fn send_batch(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SendBatchRequest>, JsonRejection>,
) -> Result<Json<SendBatchResponse>> {
    let request = json_body(payload)?;
    let results = state.messages.send_batch(request.messages).await?;
    Ok(Json(SendBatchResponse {
        success: true,
        results,
    }))
}

/// GET /messages/status
#[tracing::instrument(name = "http.queue_status", skip(state))]
pub async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>> {
    Ok(Json(state.messages.queue_status().await?))
}

/// GET /messages/{id}/status
#[tracing::instrument(name = "http.message_status", skip(state, id))]
pub async fn message_status(
    State(state): State<AppState>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
) -> Result<Json<MessageRecord>> {
    let Path(message_id) = id.map_err(|rejection| {
        AppError::Validation(vec![FieldError::new("id", rejection.body_text())])
    })?;
    Ok(Json(state.messages.message_status(message_id)?))
}

/// GET /messages/dlq
#[tracing::instrument(name = "http.list_dead_letters", skip(state))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLetterListResponse>> {
    let messages = state.messages.dead_letters(query.limit).await?;
    Ok(Json(DeadLetterListResponse {
        count: messages.len(),
        messages,
    }))
}

/// POST /messages/dlq/redrive
///
/// The body is optional; without one the default page is redriven.
#[tracing::instrument(name = "http.redrive_dead_letters", skip(state, payload))]
pub async fn redrive_dead_letters(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RedriveRequest>, JsonRejection>,
) -> Result<Json<RedriveResponse>> {
    let request = match payload {
        Err(JsonRejection::MissingJsonContentType(_)) => RedriveRequest::default(),
        other => json_body(other)?,
    };
    let redriven = state.messages.redrive(request.limit).await?;
    Ok(Json(RedriveResponse {
        success: true,
        redriven,
    }))
}
