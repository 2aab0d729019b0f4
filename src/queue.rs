//! At-least-once delivery of job ids between producers and workers.
//!
//! A received id stays invisible for the visibility timeout. If it is not
//! acknowledged in time it is delivered again, so consumers must tolerate
//! duplicates (the job store claim takes care of that).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::MultiplexedConnection};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue transport unavailable: {0}")]
    Unavailable(String),
    #[error("malformed queue entry: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(value: redis::RedisError) -> Self {
        QueueError::Unavailable(value.to_string())
    }
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Schedules a delivery of `job_id`, no earlier than `not_before` when given.
    async fn enqueue(&self, job_id: Uuid, not_before: Option<DateTime<Utc>>)
    -> Result<(), QueueError>;

    /// Waits up to `wait` for a deliverable id.
    async fn receive(&self, wait: Duration) -> Result<Option<Uuid>, QueueError>;

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;
}

#[derive(Default)]
struct MemoryQueueState {
    ready: Vec<(DateTime<Utc>, Uuid)>,
    in_flight: HashMap<Uuid, DateTime<Utc>>,
}

impl MemoryQueueState {
    fn requeue_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.in_flight.remove(&id);
            self.schedule(now, id);
        }
    }

    /// One entry per id; scheduling again moves it, like `ZADD` on an existing member.
    fn schedule(&mut self, at: DateTime<Utc>, id: Uuid) {
        match self.ready.iter_mut().find(|(_, queued)| *queued == id) {
            Some(entry) => entry.0 = at,
            None => self.ready.push((at, id)),
        }
    }

    fn pop_due(&mut self, now: DateTime<Utc>) -> Option<Uuid> {
        let index = self
            .ready
            .iter()
            .enumerate()
            .filter(|(_, (at, _))| *at <= now)
            .min_by_key(|(_, (at, _))| *at)
            .map(|(index, _)| index)?;
        Some(self.ready.remove(index).1)
    }

    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let ready = self.ready.iter().map(|(at, _)| *at).min();
        let deadline = self.in_flight.values().min().copied();
        match (ready, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process transport with the same visibility semantics as the Redis one.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<MemoryQueueState>>,
    notify: Arc<Notify>,
    visibility: Duration,
}

impl MemoryQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryQueueState::default())),
            notify: Arc::new(Notify::new()),
            visibility,
        }
    }

    /// Number of ids waiting for delivery, due or not.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn enqueue(
        &self,
        job_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let at = not_before.unwrap_or_else(Utc::now);
        self.state.lock().await.schedule(at, job_id);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Uuid>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let sleep_for = {
                let mut state = self.state.lock().await;
                let now = Utc::now();
                state.requeue_expired(now);
                if let Some(id) = state.pop_due(now) {
                    let visible_again = now
                        + chrono::Duration::from_std(self.visibility)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    state.in_flight.insert(id, visible_again);
                    return Ok(Some(id));
                }
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                state
                    .next_wakeup()
                    .and_then(|at| (at - now).to_std().ok())
                    .map(|until| until.min(remaining))
                    .unwrap_or(remaining)
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.in_flight.remove(&job_id);
        Ok(())
    }
}

// Moves expired in-flight ids back to ready, then moves the earliest due id
// from ready to in-flight with a fresh visibility deadline.
const RECEIVE_SCRIPT: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('ZADD', KEYS[1], ARGV[1], id)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
  return false
end
redis.call('ZREM', KEYS[1], due[1])
redis.call('ZADD', KEYS[2], ARGV[2], due[1])
return due[1]
";

/// Redis transport: a `ready` sorted set scored by delivery time and an
/// `inflight` sorted set scored by visibility deadline.
///
/// The handle is opened once at startup and passed to whoever needs it.
#[derive(Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
    ready_key: String,
    inflight_key: String,
    visibility: Duration,
    poll_interval: Duration,
    receive_script: Arc<redis::Script>,
}

impl RedisQueue {
    pub async fn connect(
        url: &str,
        namespace: &str,
        visibility: Duration,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            ready_key: format!("{namespace}:ready"),
            inflight_key: format!("{namespace}:inflight"),
            visibility,
            poll_interval,
            receive_script: Arc::new(redis::Script::new(RECEIVE_SCRIPT)),
        })
    }

    async fn try_receive(&self) -> Result<Option<Uuid>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let deadline_ms = now_ms + self.visibility.as_millis() as i64;
        let mut conn = self.conn.clone();
        let mut invocation = self.receive_script.prepare_invoke();
        invocation
            .key(&self.ready_key)
            .key(&self.inflight_key)
            .arg(now_ms)
            .arg(deadline_ms);
        let id: Option<String> = invocation.invoke_async(&mut conn).await?;
        id.map(|raw| Uuid::parse_str(&raw).map_err(|_| QueueError::Malformed(raw)))
            .transpose()
    }
}

#[async_trait]
impl QueueTransport for RedisQueue {
    async fn enqueue(
        &self,
        job_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let score = not_before.unwrap_or_else(Utc::now).timestamp_millis();
        let mut conn = self.conn.clone();
        // LT keeps the earliest schedule when the id is already waiting.
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.ready_key)
            .arg("LT")
            .arg(score)
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Uuid>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(id) = self.try_receive().await? {
                debug!(target = "relist.queue", job_id = %id, "delivered");
                return Ok(Some(id));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(&self.inflight_key, job_id.to_string()).await?;
        Ok(())
    }
}
