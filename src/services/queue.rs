//! Redis-backed queue with visibility timeouts and a dead-letter list.
//!
//! Received messages move to an in-flight sorted set scored by their
//! visibility deadline. A message that is neither acknowledged nor
//! dead-lettered before its deadline becomes visible again on the next
//! receive, unless it has already been received `max_receive_count` times,
//! in which case it is moved to the dead-letter list instead.

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::models::outcome::Outcome;

const DEFAULT_PREFIX: &str = "image_labeler";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Reclaims expired in-flight messages, then pops up to ARGV[3] messages.
/// KEYS: pending, inflight, receives, bodies, dead
/// ARGV: now_ms, visibility_ms, max_messages, max_receive_count
const RECEIVE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    local count = tonumber(redis.call('HGET', KEYS[3], id) or '0')
    if count >= tonumber(ARGV[4]) then
        redis.call('LPUSH', KEYS[5], id)
    else
        redis.call('RPUSH', KEYS[1], id)
    end
end
local out = {}
for _ = 1, tonumber(ARGV[3]) do
    local id = redis.call('RPOP', KEYS[1])
    if not id then break end
    local body = redis.call('HGET', KEYS[4], id)
    if body then
        local count = redis.call('HINCRBY', KEYS[3], id, 1)
        redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
        table.insert(out, id)
        table.insert(out, body)
        table.insert(out, tostring(count))
    end
end
return out
"#;

/// Removes an in-flight message; on success either deletes it (ack) or
/// pushes it to the dead-letter list.
/// KEYS: inflight, bodies, receives, dead   ARGV: id, dead_letter (0/1)
const SETTLE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
if ARGV[2] == '1' then
    redis.call('LPUSH', KEYS[4], ARGV[1])
else
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('HDEL', KEYS[3], ARGV[1])
end
return 1
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub prefix: String,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 2,
        }
    }
}

/// A message handed to a consumer. `id` doubles as the receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub id: String,
    pub body: String,
    pub receive_count: u32,
}

pub struct RedisQueue {
    client: redis::Client,
    settings: QueueSettings,
    receive_script: Script,
    settle_script: Script,
}

impl RedisQueue {
    pub fn new(redis_url: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            settings,
            receive_script: Script::new(RECEIVE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.settings.prefix, name)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Enqueue a message body, returning its id.
    pub async fn send(&self, body: &str) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let id = Uuid::new_v4().to_string();
        redis::pipe()
            .atomic()
            .hset(self.key("bodies"), &id, body)
            .ignore()
            .lpush(self.key("pending"), &id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(id)
    }

    /// Receive up to `max` messages without waiting.
    pub async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let reply: Vec<String> = self
            .receive_script
            .key(self.key("pending"))
            .key(self.key("inflight"))
            .key(self.key("receives"))
            .key(self.key("bodies"))
            .key(self.key("dead"))
            .arg(Utc::now().timestamp_millis())
            .arg(self.settings.visibility_timeout.as_millis() as u64)
            .arg(max)
            .arg(self.settings.max_receive_count)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        parse_receive_reply(reply)
    }

    /// Receive up to `max` messages, polling until at least one arrives or
    /// `wait` elapses.
    pub async fn receive_wait(
        &self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let messages = self.receive(max).await?;
            if !messages.is_empty() || Instant::now() + POLL_INTERVAL > deadline {
                return Ok(messages);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Delete a processed message. Returns false when the message was no
    /// longer in flight (its visibility timeout already expired).
    pub async fn ack(&self, id: &str) -> Result<bool, QueueError> {
        self.settle(id, false).await
    }

    /// Move an in-flight message to the dead-letter list.
    pub async fn dead_letter(&self, id: &str) -> Result<bool, QueueError> {
        self.settle(id, true).await
    }

    async fn settle(&self, id: &str, dead_letter: bool) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let settled: i64 = self
            .settle_script
            .key(self.key("inflight"))
            .key(self.key("bodies"))
            .key(self.key("receives"))
            .key(self.key("dead"))
            .arg(id)
            .arg(if dead_letter { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(settled == 1)
    }

    /// Number of messages waiting to be received.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        conn.llen(self.key("pending")).await.map_err(QueueError::Redis)
    }

    /// Number of dead-lettered messages.
    pub async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        conn.llen(self.key("dead")).await.map_err(QueueError::Redis)
    }

    /// Bodies currently in the dead-letter list, newest first.
    pub async fn dead_letters(&self, limit: isize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .lrange(self.key("dead"), 0, limit - 1)
            .await
            .map_err(QueueError::Redis)?;

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let body: Option<String> = conn
                .hget(self.key("bodies"), &id)
                .await
                .map_err(QueueError::Redis)?;
            let receive_count: Option<u32> = conn
                .hget(self.key("receives"), &id)
                .await
                .map_err(QueueError::Redis)?;
            if let Some(body) = body {
                messages.push(ReceivedMessage {
                    id,
                    body,
                    receive_count: receive_count.unwrap_or(0),
                });
            }
        }
        Ok(messages)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

/// Settle operations a consumer needs once a batch has been processed.
#[async_trait]
pub trait MessageSettler: Send + Sync {
    /// Returns false when the message was no longer in flight.
    async fn ack(&self, id: &str) -> Result<bool, QueueError>;

    /// Returns false when the message was no longer in flight.
    async fn dead_letter(&self, id: &str) -> Result<bool, QueueError>;
}

#[async_trait]
impl MessageSettler for RedisQueue {
    async fn ack(&self, id: &str) -> Result<bool, QueueError> {
        RedisQueue::ack(self, id).await
    }

    async fn dead_letter(&self, id: &str) -> Result<bool, QueueError> {
        RedisQueue::dead_letter(self, id).await
    }
}

/// Tally of one settle pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleSummary {
    pub acked: usize,
    pub dead_lettered: usize,
    pub retried: usize,
    /// Visibility expired before the settle reached the queue.
    pub expired: usize,
    /// Settle calls that errored; those messages will be redelivered.
    pub failed: usize,
}

/// Apply per-message outcomes to the queue.
///
/// `Ack` deletes, `DeadLetter` moves to the dead-letter list and `Retry`
/// leaves the message in flight. A failed settle is logged and the pass
/// continues with the remaining messages.
pub async fn settle_batch(
    queue: &dyn MessageSettler,
    messages: &[ReceivedMessage],
    outcomes: &[(usize, Outcome)],
) -> SettleSummary {
    let mut summary = SettleSummary::default();

    for &(index, outcome) in outcomes {
        let Some(message) = messages.get(index) else {
            tracing::error!(index, "Outcome reported for an unknown message");
            continue;
        };
        let settled = match outcome {
            Outcome::Ack => queue.ack(&message.id).await,
            Outcome::DeadLetter => queue.dead_letter(&message.id).await,
            // stays in flight until its visibility timeout expires
            Outcome::Retry => {
                summary.retried += 1;
                continue;
            }
        };
        match settled {
            Ok(true) if outcome == Outcome::Ack => summary.acked += 1,
            Ok(true) => summary.dead_lettered += 1,
            Ok(false) => {
                summary.expired += 1;
                tracing::warn!(
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    %outcome,
                    "Message visibility expired before it was settled"
                );
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(
                    message_id = %message.id,
                    %outcome,
                    error = %e,
                    "Failed to settle message, it will be redelivered"
                );
            }
        }
    }

    summary
}

/// The receive script returns a flat `[id, body, count, id, body, count, ...]`.
fn parse_receive_reply(reply: Vec<String>) -> Result<Vec<ReceivedMessage>, QueueError> {
    if reply.len() % 3 != 0 {
        return Err(QueueError::Protocol(format!(
            "receive reply has {} elements",
            reply.len()
        )));
    }

    reply
        .chunks_exact(3)
        .map(|chunk| {
            let receive_count = chunk[2].parse().map_err(|_| {
                QueueError::Protocol(format!("bad receive count {:?}", chunk[2]))
            })?;
            Ok(ReceivedMessage {
                id: chunk[0].clone(),
                body: chunk[1].clone(),
                receive_count,
            })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected queue reply: {0}")]
    Protocol(String),
}
