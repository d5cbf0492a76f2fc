//! Messages API: admission, batch admission, status and DLQ operations.

mod handlers;
mod models;
mod service;
mod validation;

pub use handlers::{
    list_dead_letters, message_status, queue_status, redrive_dead_letters, send_batch,
    send_message,
};
pub use models::{
    BatchItemResult, BatchItemStatus, DeadLetterListResponse, DeadLetterQuery, RedriveRequest,
    RedriveResponse, SendBatchRequest, SendBatchResponse, SendMessageRequest, SendMessageResponse,
};
pub use service::{MessageService, MessageServiceConfig};
pub use validation::validate_send_request;
