use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

/// How often a blocking dequeue re-checks an empty Redis list.
const EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One delivery of a job identifier.
///
/// The receipt is unique per delivery, so acking a duplicate delivery can
/// never release the lease another worker holds for the same job.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job_id: Uuid,
    pub receipt: String,
    pub leased_until: DateTime<Utc>,
}

/// At-least-once channel of job identifiers with leased deliveries.
///
/// A dequeued identifier stays in flight until it is acked or its lease
/// expires; `reclaim_expired` returns expired identifiers to the head of the
/// queue. The queue also carries cancel requests, since the worker that owns
/// a job is its only writer.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Oldest unclaimed identifier, waiting up to `timeout` for one to arrive.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Push the lease deadline forward. Returns `false` if the lease was
    /// already reclaimed.
    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Requeue every delivery whose lease has expired. Returns how many.
    async fn reclaim_expired(&self) -> Result<u64, QueueError>;

    /// Identifiers waiting to be dequeued.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, QueueError>;

    async fn clear_cancel(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed job identifier in queue: {0}")]
    Malformed(String),
}

// ── Redis ──────────────────────────────────────────────────────────────

const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then
  return false
end
redis.call('ZADD', KEYS[2], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[2], id)
return id
"#;

const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, receipt in ipairs(expired) do
  local id = redis.call('HGET', KEYS[2], receipt)
  redis.call('ZREM', KEYS[1], receipt)
  redis.call('HDEL', KEYS[2], receipt)
  if id then
    redis.call('RPUSH', KEYS[3], id)
  end
end
return #expired
"#;

struct QueueKeys {
    ready: String,
    leases: String,
    receipts: String,
    cancels: String,
}

impl QueueKeys {
    fn new(namespace: &str) -> Self {
        Self {
            ready: format!("{namespace}:jobs"),
            leases: format!("{namespace}:leases"),
            receipts: format!("{namespace}:receipts"),
            cancels: format!("{namespace}:cancel_requests"),
        }
    }
}

/// Redis-backed queue: a ready list, a sorted set of lease deadlines and a
/// receipt hash, moved together by Lua scripts.
pub struct RedisJobQueue {
    client: redis::Client,
    keys: QueueKeys,
    lease: Duration,
    dequeue_script: redis::Script,
    reclaim_script: redis::Script,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str, namespace: &str, lease: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            keys: QueueKeys::new(namespace),
            lease,
            dequeue_script: redis::Script::new(DEQUEUE_SCRIPT),
            reclaim_script: redis::Script::new(RECLAIM_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn lease_deadline(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    async fn try_dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let receipt = Uuid::new_v4().to_string();
        let leased_until = self.lease_deadline();

        let popped: Option<String> = self
            .dequeue_script
            .key(&self.keys.ready)
            .key(&self.keys.leases)
            .key(&self.keys.receipts)
            .arg(leased_until.timestamp_millis())
            .arg(&receipt)
            .invoke_async(&mut conn)
            .await?;

        let Some(raw) = popped else {
            return Ok(None);
        };

        match Uuid::parse_str(&raw) {
            Ok(job_id) => Ok(Some(Delivery {
                job_id,
                receipt,
                leased_until,
            })),
            Err(_) => {
                // Drop the poison entry so it is not redelivered forever.
                self.release(&mut conn, &receipt).await?;
                Err(QueueError::Malformed(raw))
            }
        }
    }

    async fn release(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        receipt: &str,
    ) -> Result<(), QueueError> {
        redis::pipe()
            .atomic()
            .zrem(&self.keys.leases, receipt)
            .hdel(&self.keys.receipts, receipt)
            .query_async::<()>(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(&self.keys.ready, job_id.to_string())
            .await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_dequeue().await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(EMPTY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        self.release(&mut conn, &delivery.receipt).await
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let changed: i64 = redis::cmd("ZADD")
            .arg(&self.keys.leases)
            .arg("XX")
            .arg("CH")
            .arg(self.lease_deadline().timestamp_millis())
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await?;
        Ok(changed > 0)
    }

    async fn reclaim_expired(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let reclaimed: u64 = self
            .reclaim_script
            .key(&self.keys.leases)
            .key(&self.keys.receipts)
            .key(&self.keys.ready)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(reclaimed)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(&self.keys.ready).await?;
        Ok(depth)
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.sadd::<_, _, ()>(&self.keys.cancels, job_id.to_string())
            .await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let requested: bool = conn
            .sismember(&self.keys.cancels, job_id.to_string())
            .await?;
        Ok(requested)
    }

    async fn clear_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.srem::<_, _, ()>(&self.keys.cancels, job_id.to_string())
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

// ── In-memory ──────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    ready: VecDeque<Uuid>,
    leases: HashMap<String, (Uuid, Instant)>,
    cancels: HashSet<Uuid>,
}

/// Process-local queue with the same lease semantics as [`RedisJobQueue`].
pub struct InMemoryJobQueue {
    state: Mutex<MemoryState>,
    available: Notify,
    lease: Duration,
}

impl InMemoryJobQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: Notify::new(),
            lease,
        }
    }

    /// Deliveries currently leased and not yet acked.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.leases.len()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.ready.push_back(job_id);
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(job_id) = state.ready.pop_front() {
                    let receipt = Uuid::new_v4().to_string();
                    state
                        .leases
                        .insert(receipt.clone(), (job_id, Instant::now() + self.lease));
                    let leased_until = Utc::now()
                        + chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::days(1));
                    return Ok(Some(Delivery {
                        job_id,
                        receipt,
                        leased_until,
                    }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // A permit stored by `notify_one` wakes us even if it fired
            // between the unlock above and this wait.
            let _ = tokio::time::timeout(deadline - now, self.available.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().await.leases.remove(&delivery.receipt);
        Ok(())
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&delivery.receipt) {
            Some((_, expires)) => {
                *expires = Instant::now() + self.lease;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_expired(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, (_, expires))| *expires <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in &expired {
            if let Some((job_id, _)) = state.leases.remove(receipt) {
                state.ready.push_front(job_id);
            }
        }
        drop(state);

        for _ in &expired {
            self.available.notify_one();
        }
        Ok(expired.len() as u64)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.ready.len() as u64)
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.cancels.insert(job_id);
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.state.lock().await.cancels.contains(&job_id))
    }

    async fn clear_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.cancels.remove(&job_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
