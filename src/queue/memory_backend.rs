//! In-memory leased queue backend.
//!
//! Messages are lost on restart. Suitable for a single instance and tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::metrics::QueueMetrics;

use super::backend::{MessageQueueBackend, QueueBackendError};
use super::models::{
    DeadLetteredMessage, NackOutcome, QueueBackendStats, QueueConfig, QueueMessage,
    ReclaimOutcome, RedrivenMessage,
};

pub(crate) const LEASE_EXPIRED_REASON: &str = "visibility timeout expired";
pub(crate) const RECEIVE_LIMIT_REASON: &str = "max receive count exceeded";

struct InFlight {
    message: QueueMessage,
    receipt: String,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    /// Visible messages, oldest first
    ready: VecDeque<QueueMessage>,
    /// Nacked messages waiting out their retry delay
    delayed: Vec<(DateTime<Utc>, QueueMessage)>,
    in_flight: HashMap<Uuid, InFlight>,
    dead_letter: VecDeque<DeadLetteredMessage>,
    /// Lease-expiry dead letters not yet returned by `reclaim_expired`
    expired_unreported: Vec<DeadLetteredMessage>,
}

impl QueueState {
    fn promote_delayed(&mut self, now: DateTime<Utc>) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(visible_at, _)| *visible_at);
        let due = self
            .delayed
            .iter()
            .take_while(|(visible_at, _)| *visible_at <= now)
            .count();
        self.ready
            .extend(self.delayed.drain(..due).map(|(_, message)| message));
    }

    /// Returns expired leases to the pool, dead-lettering exhausted messages.
    /// Returns how many went back to the pool.
    fn reclaim(&mut self, now: DateTime<Utc>, max_receive_count: u32) -> usize {
        let mut requeued = 0;
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(lease) = self.in_flight.remove(id) {
                let mut message = lease.message;
                message.release();
                message.receive_count += 1;

                if message.receive_count >= max_receive_count {
                    tracing::warn!(
                        message_id = %message.message_id,
                        receive_count = message.receive_count,
                        "Lease expired on final attempt, dead-lettering message"
                    );
                    let entry = self.push_dead_letter(message, LEASE_EXPIRED_REASON, now);
                    self.expired_unreported.push(entry);
                } else {
                    tracing::debug!(
                        message_id = %message.message_id,
                        receive_count = message.receive_count,
                        "Lease expired, message visible again"
                    );
                    QueueMetrics::record_requeued();
                    requeued += 1;
                    self.ready.push_back(message);
                }
            }
        }

        if !expired.is_empty() {
            QueueMetrics::record_leases_expired(expired.len() as u64);
        }
        requeued
    }

    fn lease(&mut self, max: usize, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<QueueMessage> {
        let mut batch = Vec::with_capacity(max.min(self.ready.len()));
        while batch.len() < max {
            let Some(mut message) = self.ready.pop_front() else {
                break;
            };

            let receipt = Uuid::new_v4().to_string();
            let deadline = now + timeout;
            message.visibility_deadline = Some(deadline);
            message.receipt_handle = Some(receipt.clone());

            self.in_flight.insert(
                message.message_id,
                InFlight {
                    message: message.clone(),
                    receipt,
                    deadline,
                },
            );
            batch.push(message);
        }
        batch
    }

    /// Remove the lease held under `receipt`, rejecting stale or foreign receipts
    fn take_lease(&mut self, message_id: Uuid, receipt: &str) -> Result<InFlight, QueueBackendError> {
        match self.in_flight.get(&message_id) {
            Some(lease) if lease.receipt == receipt => self
                .in_flight
                .remove(&message_id)
                .ok_or(QueueBackendError::LeaseLost { message_id }),
            _ => Err(QueueBackendError::LeaseLost { message_id }),
        }
    }

    fn push_dead_letter(
        &mut self,
        message: QueueMessage,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DeadLetteredMessage {
        QueueMetrics::record_dead_lettered();
        let entry = DeadLetteredMessage {
            message,
            reason: reason.to_string(),
            dead_lettered_at: now,
        };
        self.dead_letter.push_back(entry.clone());
        entry
    }

    fn take_reclaimed(&mut self, requeued: usize) -> ReclaimOutcome {
        ReclaimOutcome {
            requeued,
            dead_lettered: std::mem::take(&mut self.expired_unreported),
        }
    }

    /// Earliest moment something may become receivable
    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let delayed = self.delayed.iter().map(|(visible_at, _)| *visible_at);
        let leases = self.in_flight.values().map(|lease| lease.deadline);
        delayed.chain(leases).min()
    }
}

/// In-memory queue with visibility-timeout leases.
///
/// All state sits behind one async mutex so every lease transition is atomic;
/// receivers long-poll on a `Notify` that enqueue and requeue paths signal.
pub struct MemoryQueueBackend {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

impl MemoryQueueBackend {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn visibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.visibility_timeout.as_millis() as i64)
    }
}

#[async_trait]
impl MessageQueueBackend for MemoryQueueBackend {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, mut message: QueueMessage) -> Result<Uuid, QueueBackendError> {
        message.release();
        let message_id = message.message_id;

        let depth = {
            let mut state = self.state.lock().await;
            state.ready.push_back(message);
            state.ready.len()
        };
        self.notify.notify_waiters();
        QueueMetrics::record_enqueued();

        tracing::debug!(message_id = %message_id, ready = depth, "Message enqueued");
        Ok(message_id)
    }

    async fn receive_batch(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueBackendError> {
        let max = max_messages.min(self.config.max_batch_size);
        if max == 0 {
            return Ok(Vec::new());
        }

        let give_up_at = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so an enqueue in between is not missed
            notified.as_mut().enable();

            let next_wakeup = {
                let mut state = self.state.lock().await;
                let now = Utc::now();
                state.reclaim(now, self.config.max_receive_count);
                state.promote_delayed(now);

                let batch = state.lease(max, now, self.visibility_timeout());
                if !batch.is_empty() {
                    tracing::debug!(count = batch.len(), "Leased message batch");
                    return Ok(batch);
                }
                state.next_wakeup()
            };

            let now = Instant::now();
            if now >= give_up_at {
                return Ok(Vec::new());
            }

            let mut sleep_until = give_up_at;
            if let Some(at) = next_wakeup {
                let until_event = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep_until = sleep_until.min(now + until_event);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(sleep_until) => {}
            }
        }
    }

    async fn ack(&self, message_id: Uuid, receipt: &str) -> Result<(), QueueBackendError> {
        let mut state = self.state.lock().await;
        state.reclaim(Utc::now(), self.config.max_receive_count);
        state.take_lease(message_id, receipt)?;
        QueueMetrics::record_acked();
        Ok(())
    }

    async fn nack(
        &self,
        message_id: Uuid,
        receipt: &str,
        delay: Duration,
    ) -> Result<NackOutcome, QueueBackendError> {
        let outcome = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            state.reclaim(now, self.config.max_receive_count);

            let mut message = state.take_lease(message_id, receipt)?.message;
            message.release();
            message.receive_count += 1;

            if message.receive_count >= self.config.max_receive_count {
                tracing::warn!(
                    message_id = %message_id,
                    receive_count = message.receive_count,
                    "Receive budget exhausted, dead-lettering message"
                );
                state.push_dead_letter(message, RECEIVE_LIMIT_REASON, now);
                NackOutcome::DeadLettered
            } else {
                let visible_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                QueueMetrics::record_requeued();
                if delay.is_zero() {
                    state.ready.push_back(message);
                } else {
                    state.delayed.push((visible_at, message));
                }
                NackOutcome::Requeued { visible_at }
            }
        };

        self.notify.notify_waiters();
        Ok(outcome)
    }

    async fn dead_letter(
        &self,
        message_id: Uuid,
        receipt: &str,
        reason: &str,
    ) -> Result<(), QueueBackendError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.reclaim(now, self.config.max_receive_count);

        let mut message = state.take_lease(message_id, receipt)?.message;
        message.release();
        state.push_dead_letter(message, reason, now);
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueBackendError> {
        let outcome = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let requeued = state.reclaim(now, self.config.max_receive_count);
            state.promote_delayed(now);
            state.take_reclaimed(requeued)
        };
        if outcome.requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetteredMessage>, QueueBackendError> {
        let state = self.state.lock().await;
        Ok(state.dead_letter.iter().take(limit).cloned().collect())
    }

    async fn redrive_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<RedrivenMessage>, QueueBackendError> {
        let redriven = {
            let mut state = self.state.lock().await;
            let count = limit.min(state.dead_letter.len());
            let now = Utc::now();
            let mut redriven = Vec::with_capacity(count);

            let entries: Vec<DeadLetteredMessage> = state.dead_letter.drain(..count).collect();
            for entry in entries {
                let mut message = entry.message;
                let previous_message_id = message.message_id;
                message.message_id = Uuid::new_v4();
                message.receive_count = 0;
                message.enqueued_at = now;
                message.release();

                redriven.push(RedrivenMessage {
                    previous_message_id,
                    message_id: message.message_id,
                });
                state.ready.push_back(message);
            }
            redriven
        };

        if !redriven.is_empty() {
            QueueMetrics::record_redriven(redriven.len() as u64);
            self.notify.notify_waiters();
            tracing::info!(count = redriven.len(), "Redrove dead-lettered messages");
        }
        Ok(redriven)
    }

    async fn stats(&self) -> Result<QueueBackendStats, QueueBackendError> {
        let state = self.state.lock().await;
        Ok(QueueBackendStats {
            backend_type: self.backend_type().to_string(),
            queue_depth: state.ready.len() + state.delayed.len(),
            messages_in_flight: state.in_flight.len(),
            dlq_count: state.dead_letter.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn backend(visibility_ms: u64, max_receive_count: u32) -> MemoryQueueBackend {
        MemoryQueueBackend::new(QueueConfig {
            visibility_timeout: Duration::from_millis(visibility_ms),
            max_receive_count,
            ..Default::default()
        })
    }

    fn message(content: &str) -> QueueMessage {
        QueueMessage::new("creator-1", "fan-1", content)
    }

    fn receipt(msg: &QueueMessage) -> String {
        msg.receipt_handle.clone().unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_then_receive_exactly_once() {
        let queue = backend(90_000, 3);
        let id = queue.enqueue(message("hi")).await.unwrap();

        let batch = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);
        assert!(batch[0].visibility_deadline.is_some());

        let again = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        assert!(again.is_empty());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.messages_in_flight, 1);
    }

    #[tokio::test]
    async fn test_batch_capped_at_five() {
        let queue = backend(90_000, 3);
        for i in 0..8 {
            queue.enqueue(message(&format!("m{}", i))).await.unwrap();
        }

        let batch = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0].content, "m0");

        let rest = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = backend(90_000, 3);
        queue.enqueue(message("hi")).await.unwrap();
        let msg = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);

        queue.ack(msg.message_id, &receipt(&msg)).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats, QueueBackendStats {
            backend_type: "memory".to_string(),
            queue_depth: 0,
            messages_in_flight: 0,
            dlq_count: 0,
        });
    }

    #[tokio::test]
    async fn test_wrong_receipt_is_rejected() {
        let queue = backend(90_000, 3);
        queue.enqueue(message("hi")).await.unwrap();
        let msg = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);

        let result = queue.ack(msg.message_id, "not-the-receipt").await;
        assert!(matches!(result, Err(QueueBackendError::LeaseLost { .. })));
        assert_eq!(queue.stats().await.unwrap().messages_in_flight, 1);
    }

    #[tokio::test]
    async fn test_nack_increments_receive_count_and_requeues() {
        let queue = backend(90_000, 3);
        queue.enqueue(message("hi")).await.unwrap();
        let msg = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);

        let outcome = queue
            .nack(msg.message_id, &receipt(&msg), Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(outcome, NackOutcome::Requeued { .. }));

        let redelivered = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);
        assert_eq!(redelivered.message_id, msg.message_id);
        assert_eq!(redelivered.receive_count, 1);
        assert_ne!(redelivered.receipt_handle, msg.receipt_handle);
    }

    #[tokio::test]
    async fn test_nack_delay_hides_message() {
        let queue = backend(90_000, 3);
        queue.enqueue(message("hi")).await.unwrap();
        let msg = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);

        queue
            .nack(msg.message_id, &receipt(&msg), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(queue.receive_batch(1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().queue_depth, 1);

        let batch = queue.receive_batch(1, Duration::from_millis(500)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_receive_count_dead_letters() {
        let queue = backend(90_000, 3);
        let id = queue.enqueue(message("hi")).await.unwrap();

        let mut last = None;
        for _ in 0..3 {
            let msg = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);
            last = Some(
                queue
                    .nack(msg.message_id, &receipt(&msg), Duration::ZERO)
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(last, Some(NackOutcome::DeadLettered));
        assert!(queue.receive_batch(1, Duration::ZERO).await.unwrap().is_empty());

        let dlq = queue.dead_letters(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].message.message_id, id);
        assert_eq!(dlq[0].message.receive_count, 3);
        assert_eq!(dlq[0].reason, RECEIVE_LIMIT_REASON);
        assert_eq!(queue.stats().await.unwrap().dlq_count, 1);
    }

    #[tokio::test]
    async fn test_lease_expiry_makes_message_visible_again() {
        let queue = backend(50, 3);
        queue.enqueue(message("hi")).await.unwrap();
        let first = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.receive_count, 1);

        // The first worker's lease is gone
        let stale = queue.ack(first.message_id, &receipt(&first)).await;
        assert!(matches!(stale, Err(QueueBackendError::LeaseLost { .. })));
        queue.ack(second.message_id, &receipt(&second)).await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_expiry_on_last_attempt_dead_letters() {
        let queue = backend(20, 1);
        queue.enqueue(message("hi")).await.unwrap();
        queue.receive_batch(1, Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let outcome = queue.reclaim_expired().await.unwrap();
        assert_eq!(outcome.requeued, 0);
        assert_eq!(outcome.dead_lettered.len(), 1);
        assert_eq!(outcome.dead_lettered[0].message.receive_count, 1);

        let dlq = queue.dead_letters(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, LEASE_EXPIRED_REASON);

        // Handed out once
        assert!(queue.reclaim_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_reclaimed_during_receive_is_still_reported() {
        let queue = backend(20, 1);
        let id = queue.enqueue(message("hi")).await.unwrap();
        queue.receive_batch(1, Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Receive reclaims the lapsed lease itself
        assert!(queue.receive_batch(1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().dlq_count, 1);

        let outcome = queue.reclaim_expired().await.unwrap();
        assert_eq!(outcome.dead_lettered.len(), 1);
        assert_eq!(outcome.dead_lettered[0].message.message_id, id);
    }

    #[tokio::test]
    async fn test_dead_letter_skips_retries() {
        let queue = backend(90_000, 3);
        queue.enqueue(message("hi")).await.unwrap();
        let msg = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);

        queue
            .dead_letter(msg.message_id, &receipt(&msg), "recipient blocked")
            .await
            .unwrap();

        let dlq = queue.dead_letters(10).await.unwrap();
        assert_eq!(dlq[0].reason, "recipient blocked");
        assert_eq!(dlq[0].message.receive_count, 0);
    }

    #[tokio::test]
    async fn test_redrive_assigns_fresh_ids() {
        let queue = backend(90_000, 1);
        let id = queue.enqueue(message("hi")).await.unwrap();
        let msg = queue.receive_batch(1, Duration::ZERO).await.unwrap().remove(0);
        queue.nack(msg.message_id, &receipt(&msg), Duration::ZERO).await.unwrap();

        let redriven = queue.redrive_dead_letters(10).await.unwrap();
        assert_eq!(redriven.len(), 1);
        assert_eq!(redriven[0].previous_message_id, id);
        assert_ne!(redriven[0].message_id, id);

        let batch = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        assert_eq!(batch[0].message_id, redriven[0].message_id);
        assert_eq!(batch[0].receive_count, 0);
        assert_eq!(queue.stats().await.unwrap().dlq_count, 0);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_enqueue() {
        let queue = Arc::new(backend(90_000, 3));

        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive_batch(5, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(message("late")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receiver should wake up")
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_long_poll_times_out_empty() {
        let queue = backend(90_000, 3);
        let started = std::time::Instant::now();
        let batch = queue.receive_batch(5, Duration::from_millis(50)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_concurrent_receivers_never_share_a_message() {
        let queue = Arc::new(backend(90_000, 3));
        for i in 0..20 {
            queue.enqueue(message(&format!("m{}", i))).await.unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    loop {
                        let batch = queue.receive_batch(5, Duration::ZERO).await.unwrap();
                        if batch.is_empty() {
                            break seen;
                        }
                        seen.extend(batch.into_iter().map(|m| m.message_id));
                    }
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }
}
