//! Fire-and-forget status reporting

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::metrics::STATUS_UPDATES_DROPPED_TOTAL;
use crate::queue::ReclaimOutcome;

use super::models::StatusUpdate;
use super::store::StatusStore;

enum StatusCommand {
    Update(StatusUpdate),
    Flush(oneshot::Sender<()>),
}

/// Handle used by the API and workers to record transitions.
///
/// `report` never waits: when the writer falls behind and the channel is
/// full the update is dropped and counted.
#[derive(Clone)]
pub struct StatusReporter {
    tx: mpsc::Sender<StatusCommand>,
}

impl StatusReporter {
    pub fn report(&self, update: StatusUpdate) {
        match self.tx.try_send(StatusCommand::Update(update)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(StatusCommand::Update(update))) => {
                STATUS_UPDATES_DROPPED_TOTAL.inc();
                tracing::warn!(
                    message_id = %update.message_id,
                    status = update.status.as_str(),
                    "Status channel full, dropping update"
                );
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                STATUS_UPDATES_DROPPED_TOTAL.inc();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Status writer stopped, update discarded");
            }
        }
    }

    /// Record the terminal status of messages the queue dead-lettered on
    /// lease expiry
    pub fn report_reclaimed(&self, outcome: &ReclaimOutcome) {
        for entry in &outcome.dead_lettered {
            self.report(StatusUpdate::lease_expired(entry));
        }
    }

    /// Wait until every update reported before this call has been applied
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(StatusCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Spawn the writer task that applies reported updates to `store`.
///
/// The task ends once every `StatusReporter` clone has been dropped.
pub fn spawn_status_writer(store: Arc<StatusStore>, capacity: usize) -> (StatusReporter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                StatusCommand::Update(update) => store.apply(update),
                StatusCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Status writer stopped");
    });

    (StatusReporter { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueueBackend, QueueConfig, QueueMessage};
    use crate::status::MessageStatus;

    fn store() -> Arc<StatusStore> {
        Arc::new(StatusStore::new(Arc::new(MemoryQueueBackend::new(
            QueueConfig::default(),
        ))))
    }

    #[tokio::test]
    async fn test_flush_applies_pending_updates() {
        let store = store();
        let (reporter, _handle) = spawn_status_writer(store.clone(), 16);
        let message = QueueMessage::new("creator", "fan", "hi");

        reporter.report(StatusUpdate::queued(&message));
        reporter.report(StatusUpdate::delivered(&message));
        reporter.flush().await;

        let record = store.get_message(message.message_id).unwrap();
        assert_eq!(record.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let store = store();
        let (tx, _rx) = mpsc::channel(1);
        let reporter = StatusReporter { tx };

        let before = STATUS_UPDATES_DROPPED_TOTAL.get();
        for _ in 0..3 {
            reporter.report(StatusUpdate::queued(&QueueMessage::new("u", "r", "c")));
        }

        assert!(STATUS_UPDATES_DROPPED_TOTAL.get() >= before + 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lease_expiry_dead_letter_reaches_store() {
        use crate::queue::MessageQueueBackend;
        use std::time::Duration;

        let queue = Arc::new(MemoryQueueBackend::new(QueueConfig {
            visibility_timeout: Duration::from_millis(20),
            max_receive_count: 1,
            ..QueueConfig::default()
        }));
        let store = Arc::new(StatusStore::new(queue.clone()));
        let (reporter, _handle) = spawn_status_writer(store.clone(), 16);

        let message = QueueMessage::new("creator", "fan", "hi");
        let id = queue.enqueue(message.clone()).await.unwrap();
        reporter.report(StatusUpdate::queued(&message));
        let leased = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        reporter.report(StatusUpdate::in_flight(&leased[0]));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let outcome = queue.reclaim_expired().await.unwrap();
        reporter.report_reclaimed(&outcome);
        reporter.flush().await;

        assert_eq!(queue.stats().await.unwrap().dlq_count, 1);
        let record = store.get_message(id).unwrap();
        assert_eq!(record.status, MessageStatus::DeadLettered);
        assert_eq!(record.attempts, 1);

        // Terminal now, so retention can remove it
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_expired(Duration::ZERO), 1);
        assert!(store.get_message(id).is_none());
    }

    #[tokio::test]
    async fn test_writer_stops_when_reporters_dropped() {
        let (reporter, handle) = spawn_status_writer(store(), 4);
        drop(reporter);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
