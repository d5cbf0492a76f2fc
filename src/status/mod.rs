//! Message lifecycle tracking and queue health reporting.

mod models;
mod reporter;
mod store;

pub use models::{MessageRecord, MessageStatus, QueueStatus, StatusUpdate};
pub use reporter::{spawn_status_writer, StatusReporter};
pub use store::StatusStore;
