//! In-memory status store

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::queue::{MessageQueueBackend, QueueBackendError};

use super::models::{MessageRecord, MessageStatus, QueueStatus, StatusUpdate};

/// Per-message lifecycle records plus throughput bookkeeping.
///
/// Writes arrive through the status writer task; reads come from the HTTP
/// layer and are eventually consistent with the queue.
pub struct StatusStore {
    records: DashMap<Uuid, MessageRecord>,
    /// Unix ms of the latest settlement, 0 when none yet
    last_processed_ms: AtomicI64,
    /// Settlements per Unix second, pruned to the last minute
    settled_per_second: DashMap<i64, u64>,
    queue: Arc<dyn MessageQueueBackend>,
}

impl StatusStore {
    pub fn new(queue: Arc<dyn MessageQueueBackend>) -> Self {
        Self {
            records: DashMap::new(),
            last_processed_ms: AtomicI64::new(0),
            settled_per_second: DashMap::new(),
            queue,
        }
    }

    pub fn apply(&self, update: StatusUpdate) {
        let mut record = self
            .records
            .entry(update.message_id)
            .or_insert_with(|| MessageRecord::from_update(&update));

        if !record.apply(&update) {
            tracing::debug!(
                message_id = %update.message_id,
                current = record.status.as_str(),
                ignored = update.status.as_str(),
                "Ignoring update for message in terminal state"
            );
            return;
        }
        drop(record);

        if matches!(
            update.status,
            MessageStatus::Delivered | MessageStatus::Failed | MessageStatus::DeadLettered
        ) {
            self.last_processed_ms
                .fetch_max(update.at.timestamp_millis(), Ordering::AcqRel);
        }
        if update.status.is_terminal() {
            self.record_settlement(update.at);
        }
    }

    fn record_settlement(&self, at: DateTime<Utc>) {
        let second = at.timestamp();
        *self.settled_per_second.entry(second).or_insert(0) += 1;
        self.settled_per_second.retain(|s, _| *s > second - 60);
    }

    pub fn get_message(&self, message_id: Uuid) -> Option<MessageRecord> {
        self.records.get(&message_id).map(|r| r.clone())
    }

    pub fn last_processed_at(&self) -> Option<DateTime<Utc>> {
        match self.last_processed_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn messages_per_minute(&self) -> u64 {
        let cutoff = Utc::now().timestamp() - 60;
        self.settled_per_second
            .iter()
            .filter(|entry| *entry.key() > cutoff)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Queue counters from the backend combined with local bookkeeping
    pub async fn get_queue_status(&self) -> Result<QueueStatus, QueueBackendError> {
        let stats = self.queue.stats().await?;
        Ok(QueueStatus {
            queue_depth: stats.queue_depth,
            messages_in_flight: stats.messages_in_flight,
            dlq_count: stats.dlq_count,
            last_processed_at: self.last_processed_at(),
            messages_per_minute: self.messages_per_minute(),
        })
    }

    /// Drop terminal records not touched within `retention`
    pub fn cleanup_expired(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(retention.as_millis() as i64);
        let before = self.records.len();
        self.records
            .retain(|_, record| !(record.status.is_terminal() && record.updated_at < cutoff));
        let removed = before.saturating_sub(self.records.len());

        if removed > 0 {
            tracing::debug!(removed = removed, remaining = self.records.len(), "Cleaned up status records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueueBackend, QueueConfig, QueueMessage};

    fn store() -> StatusStore {
        StatusStore::new(Arc::new(MemoryQueueBackend::new(QueueConfig::default())))
    }

    #[tokio::test]
    async fn test_empty_system_status() {
        let status = store().get_queue_status().await.unwrap();
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.messages_in_flight, 0);
        assert_eq!(status.dlq_count, 0);
        assert!(status.last_processed_at.is_none());
        assert_eq!(status.messages_per_minute, 0);
    }

    #[test]
    fn test_lifecycle_updates() {
        let store = store();
        let message = QueueMessage::new("creator", "fan", "hi");

        store.apply(StatusUpdate::queued(&message));
        assert_eq!(store.get_message(message.message_id).unwrap().status, MessageStatus::Queued);

        store.apply(StatusUpdate::in_flight(&message));
        store.apply(StatusUpdate::delivered(&message));

        let record = store.get_message(message.message_id).unwrap();
        assert_eq!(record.status, MessageStatus::Delivered);
        assert_eq!(record.attempts, 1);
        assert!(store.last_processed_at().is_some());
        assert_eq!(store.messages_per_minute(), 1);
    }

    #[test]
    fn test_dead_lettered_is_immutable() {
        let store = store();
        let message = QueueMessage::new("creator", "fan", "hi");

        store.apply(StatusUpdate::dead_lettered(&message, "invalid recipient"));
        store.apply(StatusUpdate::delivered(&message));

        let record = store.get_message(message.message_id).unwrap();
        assert_eq!(record.status, MessageStatus::DeadLettered);
        assert_eq!(record.error.as_deref(), Some("invalid recipient"));
    }

    #[test]
    fn test_cleanup_keeps_active_records() {
        let store = store();
        let done = QueueMessage::new("creator", "fan", "done");
        let pending = QueueMessage::new("creator", "fan", "pending");

        store.apply(StatusUpdate::delivered(&done));
        store.apply(StatusUpdate::queued(&pending));

        assert_eq!(store.cleanup_expired(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(store.cleanup_expired(Duration::ZERO), 1);
        assert!(store.get_message(pending.message_id).is_some());
        assert!(store.get_message(done.message_id).is_none());
    }
}
