//! At-least-once job queue.
//!
//! A dequeued message is leased to one consumer for the visibility window.
//! The consumer acks it once the job's terminal state is persisted; a lease
//! that expires without an ack puts the message back at the head of its queue
//! with `attempt + 1`, which is how crashed workers are recovered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::job::JobKind;

/// Message body stored in a queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub kind: JobKind,
    pub queue: String,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Returned by `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueHandle {
    pub message_id: Uuid,
    pub queue: String,
}

/// Opaque proof of a lease, passed back to `ack`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken(pub String);

/// A leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub queue: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub token: DeliveryToken,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a job. The message is visible to consumers once this returns.
    async fn enqueue(&self, queue: &str, job_id: Uuid, kind: JobKind)
        -> Result<EnqueueHandle, QueueError>;

    /// Lease the next message from the first non-empty queue in `queues`.
    async fn try_dequeue(&self, queues: &[String]) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery. Returns `false` if the lease had already expired.
    async fn ack(&self, token: &DeliveryToken) -> Result<bool, QueueError>;

    /// Number of messages waiting in `queue` (excludes leased messages).
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;

    fn poll_interval(&self) -> Duration;

    /// Block until a message is available.
    async fn dequeue(&self, queues: &[String]) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.try_dequeue(queues).await? {
                return Ok(delivery);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No queues to listen on")]
    NoQueues,
}

/// Pop the first available message from KEYS[2..] and lease it in KEYS[1]
/// for ARGV[1] milliseconds. Deadlines use the Redis server clock so that
/// workers on different hosts agree on them.
const DEQUEUE_LUA: &str = r#"
local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
for i = 2, #KEYS do
    local payload = redis.call('RPOP', KEYS[i])
    if payload then
        redis.call('ZADD', KEYS[1], now_ms + tonumber(ARGV[1]), payload)
        return payload
    end
end
return false
"#;

/// Move expired leases back to the consuming end of their queue.
const RECLAIM_LUA: &str = r#"
local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now_ms, 'LIMIT', 0, ARGV[1])
for _, payload in ipairs(expired) do
    redis.call('ZREM', KEYS[1], payload)
    local message = cjson.decode(payload)
    message['attempt'] = message['attempt'] + 1
    redis.call('RPUSH', ARGV[2] .. message['queue'], cjson.encode(message))
end
return #expired
"#;

const RECLAIM_BATCH: usize = 32;

/// Redis-backed broker.
///
/// Keys: `{prefix}:queue:{name}` lists (LPUSH in, RPOP out) and a
/// `{prefix}:leases` sorted set scored by lease deadline in milliseconds.
pub struct RedisBroker {
    client: redis::Client,
    prefix: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    dequeue_script: Script,
    reclaim_script: Script,
}

impl RedisBroker {
    pub fn new(
        redis_url: &str,
        prefix: &str,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            visibility_timeout,
            poll_interval,
            dequeue_script: Script::new(DEQUEUE_LUA),
            reclaim_script: Script::new(RECLAIM_LUA),
        })
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn leases_key(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Requeue messages whose lease has expired. Returns how many moved.
    pub async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let moved: usize = self
            .reclaim_script
            .key(self.leases_key())
            .arg(RECLAIM_BATCH)
            .arg(format!("{}:queue:", self.prefix))
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            tracing::warn!(count = moved, "Requeued messages with expired leases");
        }
        Ok(moved)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: Uuid,
        kind: JobKind,
    ) -> Result<EnqueueHandle, QueueError> {
        let envelope = Envelope {
            message_id: Uuid::new_v4(),
            job_id,
            kind,
            queue: queue.to_string(),
            attempt: 1,
            enqueued_at: Utc::now(),
        };
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(self.queue_key(queue), &payload).await?;

        Ok(EnqueueHandle {
            message_id: envelope.message_id,
            queue: envelope.queue,
        })
    }

    async fn try_dequeue(&self, queues: &[String]) -> Result<Option<Delivery>, QueueError> {
        if queues.is_empty() {
            return Err(QueueError::NoQueues);
        }
        self.reclaim_expired().await?;

        let mut conn = self.connection().await?;
        let lease_ms = u64::try_from(self.visibility_timeout.as_millis()).unwrap_or(u64::MAX);

        let mut invocation = self.dequeue_script.prepare_invoke();
        invocation.key(self.leases_key());
        for queue in queues {
            invocation.key(self.queue_key(queue));
        }
        invocation.arg(lease_ms);

        let payload: Option<String> = invocation.invoke_async(&mut conn).await?;
        let Some(payload) = payload else {
            return Ok(None);
        };

        let envelope: Envelope = serde_json::from_str(&payload)?;
        Ok(Some(Delivery {
            job_id: envelope.job_id,
            kind: envelope.kind,
            queue: envelope.queue,
            attempt: envelope.attempt,
            token: DeliveryToken(payload),
        }))
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.zrem(self.leases_key(), &token.0).await?;
        Ok(removed > 0)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(self.queue_key(queue)).await?;
        Ok(depth)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

struct Lease {
    envelope: Envelope,
    token: DeliveryToken,
    deadline: Instant,
}

#[derive(Default)]
struct MemoryQueues {
    queues: HashMap<String, VecDeque<Envelope>>,
    leases: Vec<Lease>,
}

/// In-process broker with the same lease semantics as [`RedisBroker`].
pub struct MemoryBroker {
    inner: Mutex<MemoryQueues>,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(MemoryQueues::default()),
            visibility_timeout,
            poll_interval,
        }
    }

    /// Number of messages currently leased and not yet acked.
    pub fn in_flight(&self) -> usize {
        self.lock().leases.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueues> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reclaim(state: &mut MemoryQueues, now: Instant) {
        let (expired, live): (Vec<Lease>, Vec<Lease>) = std::mem::take(&mut state.leases)
            .into_iter()
            .partition(|lease| lease.deadline <= now);
        state.leases = live;

        for lease in expired {
            let mut envelope = lease.envelope;
            envelope.attempt += 1;
            tracing::warn!(
                job_id = %envelope.job_id,
                attempt = envelope.attempt,
                "Lease expired, requeueing message"
            );
            state
                .queues
                .entry(envelope.queue.clone())
                .or_default()
                .push_front(envelope);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: Uuid,
        kind: JobKind,
    ) -> Result<EnqueueHandle, QueueError> {
        let envelope = Envelope {
            message_id: Uuid::new_v4(),
            job_id,
            kind,
            queue: queue.to_string(),
            attempt: 1,
            enqueued_at: Utc::now(),
        };
        let handle = EnqueueHandle {
            message_id: envelope.message_id,
            queue: envelope.queue.clone(),
        };
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(envelope);
        Ok(handle)
    }

    async fn try_dequeue(&self, queues: &[String]) -> Result<Option<Delivery>, QueueError> {
        if queues.is_empty() {
            return Err(QueueError::NoQueues);
        }
        let now = Instant::now();
        let mut state = self.lock();
        Self::reclaim(&mut state, now);

        for queue in queues {
            let Some(envelope) = state.queues.get_mut(queue).and_then(|q| q.pop_front()) else {
                continue;
            };
            let token = DeliveryToken(format!("{}:{}", envelope.message_id, envelope.attempt));
            let delivery = Delivery {
                job_id: envelope.job_id,
                kind: envelope.kind,
                queue: envelope.queue.clone(),
                attempt: envelope.attempt,
                token: token.clone(),
            };
            state.leases.push(Lease {
                envelope,
                token,
                deadline: now + self.visibility_timeout,
            });
            return Ok(Some(delivery));
        }
        Ok(None)
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<bool, QueueError> {
        let mut state = self.lock();
        let before = state.leases.len();
        state.leases.retain(|lease| &lease.token != token);
        Ok(state.leases.len() < before)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self.lock().queues.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn broker(visibility_ms: u64) -> MemoryBroker {
        MemoryBroker::new(
            Duration::from_millis(visibility_ms),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_enqueue_is_immediately_visible_in_fifo_order() {
        let broker = broker(1_000);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        broker.enqueue("default", first, JobKind::ComicNarration).await.unwrap();
        broker.enqueue("default", second, JobKind::ComicNarration).await.unwrap();
        assert_eq!(broker.depth("default").await.unwrap(), 2);

        let listen = queues(&["default"]);
        let a = broker.try_dequeue(&listen).await.unwrap().unwrap();
        let b = broker.try_dequeue(&listen).await.unwrap().unwrap();
        assert_eq!((a.job_id, b.job_id), (first, second));
        assert_eq!(a.attempt, 1);
        assert!(broker.try_dequeue(&listen).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queues_are_scanned_in_priority_order() {
        let broker = broker(1_000);
        let heavy = Uuid::new_v4();
        let light = Uuid::new_v4();
        broker.enqueue("heavy", heavy, JobKind::ComicNarration).await.unwrap();
        broker.enqueue("default", light, JobKind::ComicNarration).await.unwrap();

        let got = broker
            .try_dequeue(&queues(&["default", "heavy"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.job_id, light);
        assert_eq!(got.queue, "default");
    }

    #[tokio::test]
    async fn test_leased_message_is_hidden_until_timeout() {
        let broker = broker(40);
        let listen = queues(&["default"]);
        let job_id = Uuid::new_v4();
        broker.enqueue("default", job_id, JobKind::ComicNarration).await.unwrap();

        let first = broker.try_dequeue(&listen).await.unwrap().unwrap();
        assert!(broker.try_dequeue(&listen).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let again = broker.try_dequeue(&listen).await.unwrap().unwrap();
        assert_eq!(again.job_id, job_id);
        assert_eq!(again.attempt, 2);

        // The stale token no longer holds a lease.
        assert!(!broker.ack(&first.token).await.unwrap());
        assert!(broker.ack(&again.token).await.unwrap());
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_acked_message_is_not_redelivered() {
        let broker = broker(20);
        let listen = queues(&["default"]);
        broker
            .enqueue("default", Uuid::new_v4(), JobKind::ComicNarration)
            .await
            .unwrap();

        let delivery = broker.try_dequeue(&listen).await.unwrap().unwrap();
        assert!(broker.ack(&delivery.token).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(broker.try_dequeue(&listen).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocking_dequeue_waits_for_enqueue() {
        let broker = std::sync::Arc::new(broker(1_000));
        let job_id = Uuid::new_v4();

        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue(&queues(&["default"])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue("default", job_id, JobKind::ComicNarration).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.job_id, job_id);
    }

    #[tokio::test]
    async fn test_no_queues_is_an_error() {
        let broker = broker(1_000);
        assert!(matches!(
            broker.try_dequeue(&[]).await,
            Err(QueueError::NoQueues)
        ));
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope {
            message_id: Uuid::nil(),
            job_id: Uuid::nil(),
            kind: JobKind::ComicNarration,
            queue: "default".to_string(),
            attempt: 1,
            enqueued_at: Utc::now(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["kind"], "comic_narration");
        assert_eq!(value["attempt"], 1);
    }

    /// Requires a running Redis instance (`REDIS_URL`).
    #[tokio::test]
    #[ignore]
    async fn test_redis_lease_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let prefix = format!("test:{}", Uuid::new_v4());
        let broker = RedisBroker::new(
            &url,
            &prefix,
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
        .unwrap();
        broker.ping().await.unwrap();

        let job_id = Uuid::new_v4();
        broker.enqueue("default", job_id, JobKind::ComicNarration).await.unwrap();
        let listen = queues(&["default"]);

        let first = broker.try_dequeue(&listen).await.unwrap().unwrap();
        assert_eq!(first.job_id, job_id);
        assert!(broker.try_dequeue(&listen).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let again = broker.try_dequeue(&listen).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert!(broker.ack(&again.token).await.unwrap());
    }
}
