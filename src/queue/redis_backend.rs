//! Redis-based leased queue backend.
//!
//! Messages survive service restarts and are shared by every instance. Lease
//! transitions run as Lua scripts so receive, ack, nack and reclamation stay
//! atomic across concurrent workers.
//!
//! Key layout under `{prefix}`:
//! - `{prefix}:pending`   sorted set of message ids scored by visible-at (ms)
//! - `{prefix}:inflight`  sorted set of leased ids scored by lease deadline (ms)
//! - `{prefix}:receipts`  hash id -> current receipt handle
//! - `{prefix}:receives`  hash id -> failed delivery count
//! - `{prefix}:dlq`       list of dead-lettered ids, oldest first
//! - `{prefix}:dlq:meta`  hash id -> JSON `{reason, deadLetteredAt}`
//! - `{prefix}:dlq:expired` list of lease-expiry dead letters not yet reported
//! - `{prefix}:msg:{id}`  message body as JSON

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use redis::{FromRedisValue, RedisResult, Script};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::QueueMetrics;
use crate::redis::{current_time_ms, RedisPool};

use super::backend::{MessageQueueBackend, QueueBackendError};
use super::memory_backend::{LEASE_EXPIRED_REASON, RECEIVE_LIMIT_REASON};
use super::models::{
    DeadLetteredMessage, NackOutcome, QueueBackendStats, QueueConfig, QueueMessage,
    ReclaimOutcome, RedrivenMessage,
};

/// Stored as the DLQ reason for bodies that no longer parse
const UNDECODABLE_REASON: &str = "stored message body could not be decoded";

lazy_static! {
    /// KEYS: pending, inflight, receipts, receives, dlq, dlq_meta, dlq_expired
    /// ARGV: now_ms, max_receive_count, dlq meta JSON, drain flag
    /// Returns the requeued and expired counts followed by the unreported
    /// dead-lettered ids when the drain flag is "1"
    static ref RECLAIM_SCRIPT: Script = Script::new(
        r#"
        local requeued = 0
        local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
        for _, id in ipairs(expired) do
            redis.call('ZREM', KEYS[2], id)
            redis.call('HDEL', KEYS[3], id)
            local count = redis.call('HINCRBY', KEYS[4], id, 1)
            if count >= tonumber(ARGV[2]) then
                redis.call('RPUSH', KEYS[5], id)
                redis.call('HSET', KEYS[6], id, ARGV[3])
                redis.call('RPUSH', KEYS[7], id)
            else
                redis.call('ZADD', KEYS[1], ARGV[1], id)
                requeued = requeued + 1
            end
        end
        local reply = {tostring(requeued), tostring(#expired)}
        if ARGV[4] == '1' then
            local unreported = redis.call('LRANGE', KEYS[7], 0, -1)
            redis.call('DEL', KEYS[7])
            for _, id in ipairs(unreported) do
                table.insert(reply, id)
            end
        end
        return reply
        "#,
    );

    /// KEYS: pending, inflight, receipts, receives
    /// ARGV: now_ms, deadline_ms, receipt handles (one per leasable message)
    static ref RECEIVE_SCRIPT: Script = Script::new(
        r#"
        local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, #ARGV - 2)
        local leased = {}
        for i, id in ipairs(ids) do
            local receipt = ARGV[i + 2]
            redis.call('ZREM', KEYS[1], id)
            redis.call('ZADD', KEYS[2], ARGV[2], id)
            redis.call('HSET', KEYS[3], id, receipt)
            local count = redis.call('HGET', KEYS[4], id) or '0'
            table.insert(leased, {id, receipt, count})
        end
        return leased
        "#,
    );

    /// KEYS: inflight, receipts, receives, message
    /// ARGV: id, receipt, now_ms
    static ref ACK_SCRIPT: Script = Script::new(
        r#"
        local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
        if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2]
            or not deadline or tonumber(deadline) <= tonumber(ARGV[3]) then
            return 0
        end
        redis.call('ZREM', KEYS[1], ARGV[1])
        redis.call('HDEL', KEYS[2], ARGV[1])
        redis.call('HDEL', KEYS[3], ARGV[1])
        redis.call('DEL', KEYS[4])
        return 1
        "#,
    );

    /// KEYS: pending, inflight, receipts, receives, dlq, dlq_meta
    /// ARGV: id, receipt, now_ms, visible_at_ms, max_receive_count, dlq meta JSON
    /// Returns 0 when the lease is lost, 1 when requeued, 2 when dead-lettered
    static ref NACK_SCRIPT: Script = Script::new(
        r#"
        local deadline = redis.call('ZSCORE', KEYS[2], ARGV[1])
        if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2]
            or not deadline or tonumber(deadline) <= tonumber(ARGV[3]) then
            return 0
        end
        redis.call('ZREM', KEYS[2], ARGV[1])
        redis.call('HDEL', KEYS[3], ARGV[1])
        local count = redis.call('HINCRBY', KEYS[4], ARGV[1], 1)
        if count >= tonumber(ARGV[5]) then
            redis.call('RPUSH', KEYS[5], ARGV[1])
            redis.call('HSET', KEYS[6], ARGV[1], ARGV[6])
            return 2
        end
        redis.call('ZADD', KEYS[1], ARGV[4], ARGV[1])
        return 1
        "#,
    );

    /// KEYS: inflight, receipts, dlq, dlq_meta
    /// ARGV: id, receipt, now_ms, dlq meta JSON
    static ref DEAD_LETTER_SCRIPT: Script = Script::new(
        r#"
        local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
        if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2]
            or not deadline or tonumber(deadline) <= tonumber(ARGV[3]) then
            return 0
        end
        redis.call('ZREM', KEYS[1], ARGV[1])
        redis.call('HDEL', KEYS[2], ARGV[1])
        redis.call('RPUSH', KEYS[3], ARGV[1])
        redis.call('HSET', KEYS[4], ARGV[1], ARGV[4])
        return 1
        "#,
    );

    /// KEYS: dlq, dlq_meta, pending, receives
    /// ARGV: message key prefix, now_ms, fresh ids (one per entry to move)
    /// Returns a flat list of old id, new id pairs
    static ref REDRIVE_SCRIPT: Script = Script::new(
        r#"
        local moved = {}
        for i = 3, #ARGV do
            local old = redis.call('LPOP', KEYS[1])
            if not old then
                break
            end
            redis.call('HDEL', KEYS[2], old)
            redis.call('HDEL', KEYS[4], old)
            local old_key = ARGV[1] .. old
            if redis.call('EXISTS', old_key) == 1 then
                redis.call('RENAME', old_key, ARGV[1] .. ARGV[i])
                redis.call('ZADD', KEYS[3], ARGV[2], ARGV[i])
                table.insert(moved, old)
                table.insert(moved, ARGV[i])
            end
        end
        return moved
        "#,
    );
}

/// Stored alongside each DLQ entry
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetterMeta {
    reason: String,
    dead_lettered_at: DateTime<Utc>,
}

/// Redis-based leased queue backend.
pub struct RedisQueueBackend {
    pool: Arc<RedisPool>,
    config: QueueConfig,
    prefix: String,
}

impl RedisQueueBackend {
    pub fn new(config: QueueConfig, pool: Arc<RedisPool>, prefix: String) -> Self {
        Self {
            pool,
            config,
            prefix,
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn message_key_prefix(&self) -> String {
        format!("{}:msg:", self.prefix)
    }

    fn message_key(&self, id: &str) -> String {
        format!("{}{}", self.message_key_prefix(), id)
    }

    fn dead_letter_meta(reason: &str) -> Result<String, QueueBackendError> {
        Ok(serde_json::to_string(&DeadLetterMeta {
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        })?)
    }

    async fn run_script<T>(
        &self,
        script: &'static Script,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<T, QueueBackendError>
    where
        T: FromRedisValue + Send,
    {
        let reply = self
            .pool
            .execute(|mut conn| async move {
                let mut invocation = script.prepare_invoke();
                for key in &keys {
                    invocation.key(key);
                }
                for arg in &args {
                    invocation.arg(arg);
                }
                let reply: RedisResult<T> = invocation.invoke_async(&mut conn).await;
                reply
            })
            .await?;
        Ok(reply)
    }

    async fn get_bodies(&self, ids: &[String]) -> Result<Vec<Option<String>>, QueueBackendError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.message_key(id)).collect();
        let bodies = self
            .pool
            .execute(|mut conn| async move {
                let reply: RedisResult<Vec<Option<String>>> =
                    redis::cmd("MGET").arg(&keys).query_async(&mut conn).await;
                reply
            })
            .await?;
        Ok(bodies)
    }

    async fn hash_values(
        &self,
        hash: String,
        ids: &[String],
    ) -> Result<Vec<Option<String>>, QueueBackendError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let fields = ids.to_vec();
        let values = self
            .pool
            .execute(|mut conn| async move {
                let reply: RedisResult<Vec<Option<String>>> = redis::cmd("HMGET")
                    .arg(&hash)
                    .arg(&fields)
                    .query_async(&mut conn)
                    .await;
                reply
            })
            .await?;
        Ok(values)
    }

    /// Parse a stored body, taking the id from its key so redriven copies
    /// report their new id
    fn decode(id: &str, body: &str) -> Result<QueueMessage, QueueBackendError> {
        let mut message: QueueMessage = serde_json::from_str(body)?;
        if let Ok(parsed) = Uuid::parse_str(id) {
            message.message_id = parsed;
        }
        Ok(message)
    }

    /// Pair leased ids with their bodies. Undecodable entries come back
    /// separately with their receipt so the caller can dead-letter them
    /// without failing the rest of the batch.
    fn assemble_batch(
        leased: Vec<(String, String, u32)>,
        bodies: Vec<Option<String>>,
        visibility_deadline: Option<DateTime<Utc>>,
    ) -> (Vec<QueueMessage>, Vec<(String, String)>) {
        let mut batch = Vec::with_capacity(leased.len());
        let mut undecodable = Vec::new();
        for ((id, receipt, receive_count), body) in leased.into_iter().zip(bodies) {
            let Some(body) = body else {
                tracing::warn!(message_id = %id, "Leased message has no stored body");
                continue;
            };
            match Self::decode(&id, &body) {
                Ok(mut message) => {
                    message.receive_count = receive_count;
                    message.visibility_deadline = visibility_deadline;
                    message.receipt_handle = Some(receipt);
                    batch.push(message);
                }
                Err(e) => {
                    tracing::error!(
                        message_id = %id,
                        error = %e,
                        "Leased message body is undecodable, dead-lettering it"
                    );
                    undecodable.push((id, receipt));
                }
            }
        }
        (batch, undecodable)
    }

    /// Run the reclaim script; with `drain` also take the unreported
    /// lease-expiry dead letters
    async fn reclaim(&self, drain: bool) -> Result<(usize, Vec<String>), QueueBackendError> {
        let reply: Vec<String> = self
            .run_script(
                &RECLAIM_SCRIPT,
                vec![
                    self.key("pending"),
                    self.key("inflight"),
                    self.key("receipts"),
                    self.key("receives"),
                    self.key("dlq"),
                    self.key("dlq:meta"),
                    self.key("dlq:expired"),
                ],
                vec![
                    current_time_ms().to_string(),
                    self.config.max_receive_count.to_string(),
                    Self::dead_letter_meta(LEASE_EXPIRED_REASON)?,
                    if drain { "1" } else { "0" }.to_string(),
                ],
            )
            .await?;

        let mut reply = reply.into_iter();
        let requeued: usize = reply.next().and_then(|n| n.parse().ok()).unwrap_or(0);
        let expired: usize = reply.next().and_then(|n| n.parse().ok()).unwrap_or(0);
        if expired > 0 {
            QueueMetrics::record_leases_expired(expired as u64);
            QueueMetrics::record_reclaimed(requeued as u64, expired.saturating_sub(requeued) as u64);
            tracing::debug!(expired = expired, requeued = requeued, "Reclaimed expired Redis leases");
        }
        Ok((requeued, reply.collect()))
    }

    /// Move a leased message whose body no longer parses to the DLQ so the
    /// rest of its batch can still be delivered
    async fn park_undecodable(&self, id: &str, receipt: &str) {
        let meta = match Self::dead_letter_meta(UNDECODABLE_REASON) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "Failed to encode DLQ metadata");
                return;
            }
        };
        let moved: Result<i64, QueueBackendError> = self
            .run_script(
                &DEAD_LETTER_SCRIPT,
                vec![
                    self.key("inflight"),
                    self.key("receipts"),
                    self.key("dlq"),
                    self.key("dlq:meta"),
                ],
                vec![
                    id.to_string(),
                    receipt.to_string(),
                    current_time_ms().to_string(),
                    meta,
                ],
            )
            .await;
        match moved {
            Ok(1) => QueueMetrics::record_dead_lettered(),
            Ok(_) => tracing::debug!(message_id = %id, "Undecodable message lease already lost"),
            Err(e) => tracing::warn!(message_id = %id, error = %e, "Failed to dead-letter undecodable message"),
        }
    }

    /// Load DLQ entries for `ids`, skipping ids whose body is gone or unreadable
    async fn load_dead_letters(
        &self,
        ids: &[String],
    ) -> Result<Vec<DeadLetteredMessage>, QueueBackendError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let bodies = self.get_bodies(ids).await?;
        let metas = self.hash_values(self.key("dlq:meta"), ids).await?;
        let counts = self.hash_values(self.key("receives"), ids).await?;

        let mut entries = Vec::with_capacity(ids.len());
        for (((id, body), meta), count) in ids.iter().zip(bodies).zip(metas).zip(counts) {
            let Some(body) = body else { continue };
            let mut message = match Self::decode(id, &body) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "Skipping undecodable DLQ entry");
                    continue;
                }
            };
            message.receive_count = count.and_then(|c| c.parse().ok()).unwrap_or(0);

            let meta = meta
                .and_then(|m| serde_json::from_str::<DeadLetterMeta>(&m).ok())
                .unwrap_or_else(|| DeadLetterMeta {
                    reason: "unknown".to_string(),
                    dead_lettered_at: message.enqueued_at,
                });

            entries.push(DeadLetteredMessage {
                message,
                reason: meta.reason,
                dead_lettered_at: meta.dead_lettered_at,
            });
        }
        Ok(entries)
    }

    fn lease_lost(message_id: Uuid) -> QueueBackendError {
        QueueBackendError::LeaseLost { message_id }
    }
}

#[async_trait]
impl MessageQueueBackend for RedisQueueBackend {
    fn backend_type(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, mut message: QueueMessage) -> Result<Uuid, QueueBackendError> {
        message.release();
        message.receive_count = 0;
        let message_id = message.message_id;
        let body = serde_json::to_string(&message)?;

        let id = message_id.to_string();
        let message_key = self.message_key(&id);
        let pending_key = self.key("pending");
        let now = current_time_ms();

        self.pool
            .execute(|mut conn| async move {
                let reply: RedisResult<()> = redis::pipe()
                    .atomic()
                    .set(&message_key, &body)
                    .ignore()
                    .zadd(&pending_key, &id, now)
                    .ignore()
                    .query_async(&mut conn)
                    .await;
                reply
            })
            .await?;

        QueueMetrics::record_enqueued();
        tracing::debug!(message_id = %message_id, "Message enqueued to Redis");
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

        let give_up_at = tokio::time::Instant::now() + wait;
        // Redis has no blocking pop on sorted sets by score; poll instead
        let poll_interval = Duration::from_millis(250);

        loop {
            self.reclaim(false).await?;

            let now = current_time_ms();
            let deadline = now + self.config.visibility_timeout.as_millis() as i64;
            let mut args = vec![now.to_string(), deadline.to_string()];
            args.extend((0..max).map(|_| Uuid::new_v4().to_string()));

            let leased: Vec<(String, String, u32)> = self
                .run_script(
                    &RECEIVE_SCRIPT,
                    vec![
                        self.key("pending"),
                        self.key("inflight"),
                        self.key("receipts"),
                        self.key("receives"),
                    ],
                    args,
                )
                .await?;

            if !leased.is_empty() {
                let ids: Vec<String> = leased.iter().map(|(id, _, _)| id.clone()).collect();
                let bodies = self.get_bodies(&ids).await?;
                let visibility_deadline = Utc.timestamp_millis_opt(deadline).single();

                let (batch, undecodable) = Self::assemble_batch(leased, bodies, visibility_deadline);
                for (id, receipt) in undecodable {
                    self.park_undecodable(&id, &receipt).await;
                }

                if !batch.is_empty() {
                    tracing::debug!(count = batch.len(), "Leased message batch from Redis");
                    return Ok(batch);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= give_up_at {
                return Ok(Vec::new());
            }
            tokio::time::sleep_until(give_up_at.min(now + poll_interval)).await;
        }
    }

    async fn ack(&self, message_id: Uuid, receipt: &str) -> Result<(), QueueBackendError> {
        let id = message_id.to_string();
        let acked: i64 = self
            .run_script(
                &ACK_SCRIPT,
                vec![
                    self.key("inflight"),
                    self.key("receipts"),
                    self.key("receives"),
                    self.message_key(&id),
                ],
                vec![id, receipt.to_string(), current_time_ms().to_string()],
            )
            .await?;

        if acked == 0 {
            return Err(Self::lease_lost(message_id));
        }
        QueueMetrics::record_acked();
        Ok(())
    }

    async fn nack(
        &self,
        message_id: Uuid,
        receipt: &str,
        delay: Duration,
    ) -> Result<NackOutcome, QueueBackendError> {
        let now = current_time_ms();
        let visible_at = now + delay.as_millis() as i64;

        let outcome: i64 = self
            .run_script(
                &NACK_SCRIPT,
                vec![
                    self.key("pending"),
                    self.key("inflight"),
                    self.key("receipts"),
                    self.key("receives"),
                    self.key("dlq"),
                    self.key("dlq:meta"),
                ],
                vec![
                    message_id.to_string(),
                    receipt.to_string(),
                    now.to_string(),
                    visible_at.to_string(),
                    self.config.max_receive_count.to_string(),
                    Self::dead_letter_meta(RECEIVE_LIMIT_REASON)?,
                ],
            )
            .await?;

        match outcome {
            1 => {
                QueueMetrics::record_requeued();
                Ok(NackOutcome::Requeued {
                    visible_at: Utc
                        .timestamp_millis_opt(visible_at)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            }
            2 => {
                QueueMetrics::record_dead_lettered();
                tracing::warn!(message_id = %message_id, "Receive budget exhausted, dead-lettering message");
                Ok(NackOutcome::DeadLettered)
            }
            _ => Err(Self::lease_lost(message_id)),
        }
    }

    async fn dead_letter(
        &self,
        message_id: Uuid,
        receipt: &str,
        reason: &str,
    ) -> Result<(), QueueBackendError> {
        let moved: i64 = self
            .run_script(
                &DEAD_LETTER_SCRIPT,
                vec![
                    self.key("inflight"),
                    self.key("receipts"),
                    self.key("dlq"),
                    self.key("dlq:meta"),
                ],
                vec![
                    message_id.to_string(),
                    receipt.to_string(),
                    current_time_ms().to_string(),
                    Self::dead_letter_meta(reason)?,
                ],
            )
            .await?;

        if moved == 0 {
            return Err(Self::lease_lost(message_id));
        }
        QueueMetrics::record_dead_lettered();
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueBackendError> {
        let (requeued, ids) = self.reclaim(true).await?;
        let dead_lettered = self.load_dead_letters(&ids).await?;
        Ok(ReclaimOutcome {
            requeued,
            dead_lettered,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetteredMessage>, QueueBackendError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let dlq_key = self.key("dlq");
        let stop = limit as isize - 1;
        let ids = self
            .pool
            .execute(|mut conn| async move {
                let reply: RedisResult<Vec<String>> = redis::cmd("LRANGE")
                    .arg(&dlq_key)
                    .arg(0)
                    .arg(stop)
                    .query_async(&mut conn)
                    .await;
                reply
            })
            .await?;

        self.load_dead_letters(&ids).await
    }

    async fn redrive_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<RedrivenMessage>, QueueBackendError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut args = vec![self.message_key_prefix(), current_time_ms().to_string()];
        args.extend((0..limit).map(|_| Uuid::new_v4().to_string()));

        let moved: Vec<String> = self
            .run_script(
                &REDRIVE_SCRIPT,
                vec![
                    self.key("dlq"),
                    self.key("dlq:meta"),
                    self.key("pending"),
                    self.key("receives"),
                ],
                args,
            )
            .await?;

        let redriven: Vec<RedrivenMessage> = moved
            .chunks_exact(2)
            .filter_map(|pair| {
                Some(RedrivenMessage {
                    previous_message_id: Uuid::parse_str(&pair[0]).ok()?,
                    message_id: Uuid::parse_str(&pair[1]).ok()?,
                })
            })
            .collect();

        if !redriven.is_empty() {
            QueueMetrics::record_redriven(redriven.len() as u64);
            tracing::info!(count = redriven.len(), "Redrove dead-lettered messages");
        }
        Ok(redriven)
    }

    async fn stats(&self) -> Result<QueueBackendStats, QueueBackendError> {
        let pending_key = self.key("pending");
        let inflight_key = self.key("inflight");
        let dlq_key = self.key("dlq");

        let (depth, in_flight, dlq): (usize, usize, usize) = self
            .pool
            .execute(|mut conn| async move {
                let reply: RedisResult<(usize, usize, usize)> = redis::pipe()
                    .zcard(&pending_key)
                    .zcard(&inflight_key)
                    .llen(&dlq_key)
                    .query_async(&mut conn)
                    .await;
                reply
            })
            .await?;

        Ok(QueueBackendStats {
            backend_type: self.backend_type().to_string(),
            queue_depth: depth,
            messages_in_flight: in_flight,
            dlq_count: dlq,
        })
    }
}
