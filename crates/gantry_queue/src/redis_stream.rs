//! Queue on Redis Streams.
//!
//! One stream per pool, read through a single consumer group. The pending
//! entries list is the in-flight set. A side hash maps task ids to stream
//! entry ids so acks can be addressed by task. Every state change that
//! touches more than one key runs as a Lua script.
//!
//! Reads never use `BLOCK`: the connection is multiplexed, so a blocking
//! read would stall every other caller. `dequeue` polls instead.

use crate::entry::{QueueEntry, field};
use crate::error::{QueueError, QueueResult};
use crate::queue::{AckOutcome, Delivery, Queue, Reclaimed};
use async_trait::async_trait;
use gantry_core::{PoolName, Task, TaskId, Timestamp};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

mod scripts {
    use redis::Script;

    /// KEYS: stream. ARGV: group.
    pub fn ensure_group() -> Script {
        Script::new(
            r"
            redis.pcall('XGROUP', 'CREATE', KEYS[1], ARGV[1], '0', 'MKSTREAM')
            return 1
            ",
        )
    }

    /// KEYS: stream, inflight. ARGV: group, consumer.
    /// Returns `[entry_id, field, value, ...]` or nil.
    pub fn read_one() -> Script {
        Script::new(
            r"
            local r = redis.call('XREADGROUP', 'GROUP', ARGV[1], ARGV[2], 'COUNT', 1, 'STREAMS', KEYS[1], '>')
            if not r then return false end
            local entry = r[1][2][1]
            if not entry then return false end
            local id = entry[1]
            local fields = entry[2]
            local out = { id }
            for i = 1, #fields, 2 do
                if fields[i] == 'task_id' then
                    redis.call('HSET', KEYS[2], fields[i + 1], id)
                end
                out[#out + 1] = fields[i]
                out[#out + 1] = fields[i + 1]
            end
            return out
            ",
        )
    }

    /// KEYS: stream, inflight. ARGV: group, task_id.
    pub fn ack() -> Script {
        Script::new(
            r"
            local id = redis.call('HGET', KEYS[2], ARGV[2])
            if not id then return 0 end
            redis.call('XACK', KEYS[1], ARGV[1], id)
            redis.call('XDEL', KEYS[1], id)
            redis.call('HDEL', KEYS[2], ARGV[2])
            return 1
            ",
        )
    }

    /// KEYS: stream, inflight. ARGV: group, task_id.
    pub fn release() -> Script {
        Script::new(
            r"
            local id = redis.call('HGET', KEYS[2], ARGV[2])
            if not id then return 0 end
            local found = redis.call('XRANGE', KEYS[1], id, id)
            redis.call('XACK', KEYS[1], ARGV[1], id)
            redis.call('XDEL', KEYS[1], id)
            redis.call('HDEL', KEYS[2], ARGV[2])
            if found[1] then
                redis.call('XADD', KEYS[1], '*', unpack(found[1][2]))
            end
            return 1
            ",
        )
    }

    /// KEYS: stream, inflight. ARGV: group, consumer, min_idle_ms, now.
    /// Returns `[task_id, attempts, ...]`.
    pub fn reclaim() -> Script {
        Script::new(
            r"
            local out = {}
            local cursor = '0-0'
            repeat
                local r = redis.call('XAUTOCLAIM', KEYS[1], ARGV[1], ARGV[2], ARGV[3], cursor, 'COUNT', 100)
                cursor = r[1]
                for _, e in ipairs(r[2]) do
                    if type(e) == 'table' and type(e[2]) == 'table' then
                        local id = e[1]
                        local fields = e[2]
                        local task_id = nil
                        local attempts = 0
                        local rebuilt = {}
                        for i = 1, #fields, 2 do
                            local k = fields[i]
                            local v = fields[i + 1]
                            if k == 'task_id' then task_id = v end
                            if k == 'attempts' then
                                attempts = tonumber(v) or 0
                            elseif k ~= 'enqueued_at' then
                                rebuilt[#rebuilt + 1] = k
                                rebuilt[#rebuilt + 1] = v
                            end
                        end
                        attempts = attempts + 1
                        rebuilt[#rebuilt + 1] = 'enqueued_at'
                        rebuilt[#rebuilt + 1] = ARGV[4]
                        rebuilt[#rebuilt + 1] = 'attempts'
                        rebuilt[#rebuilt + 1] = tostring(attempts)
                        redis.call('XACK', KEYS[1], ARGV[1], id)
                        redis.call('XDEL', KEYS[1], id)
                        redis.call('XADD', KEYS[1], '*', unpack(rebuilt))
                        if task_id then
                            redis.call('HDEL', KEYS[2], task_id)
                            out[#out + 1] = task_id
                            out[#out + 1] = tostring(attempts)
                        end
                    end
                end
            until cursor == '0-0'
            return out
            ",
        )
    }
}

/// Connection and naming settings for [`RedisStreamQueue`]
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis URL
    pub url: String,
    /// Key prefix
    pub prefix: String,
    /// Consumer group name
    pub group: String,
    /// Consumer name within the group
    pub consumer: String,
    /// Sleep between empty reads
    pub poll_interval: Duration,
}

impl RedisQueueConfig {
    /// Defaults for `url`
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefix: "gantry".to_string(),
            group: "gantry".to_string(),
            consumer: format!("gantry-{}", std::process::id()),
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Set the key prefix
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the consumer group
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set the consumer name
    #[must_use]
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Set the poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Queue backed by Redis Streams consumer groups
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    config: RedisQueueConfig,
    groups: Mutex<HashSet<PoolName>>,
}

impl std::fmt::Debug for RedisStreamQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamQueue")
            .field("connection", &"ConnectionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStreamQueue {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the URL is invalid or Redis is unreachable
    pub async fn connect(config: RedisQueueConfig) -> QueueResult<Self> {
        tracing::info!(url = %config.url, prefix = %config.prefix, "Connecting queue to Redis");
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            config,
            groups: Mutex::new(HashSet::new()),
        })
    }

    fn stream_key(&self, pool: &PoolName) -> String {
        format!("{}:stream:{}", self.config.prefix, pool)
    }

    fn inflight_key(&self, pool: &PoolName) -> String {
        format!("{}:inflight:{}", self.config.prefix, pool)
    }

    fn pools_key(&self) -> String {
        format!("{}:pools", self.config.prefix)
    }

    async fn ensure_group(&self, pool: &PoolName) -> QueueResult<()> {
        let mut groups = self.groups.lock().await;
        if groups.contains(pool) {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        scripts::ensure_group()
            .key(self.stream_key(pool))
            .arg(&self.config.group)
            .invoke_async::<i64>(&mut conn)
            .await?;
        groups.insert(pool.clone());
        Ok(())
    }

    async fn read_one(&self, pool: &PoolName) -> QueueResult<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let Some(reply) = scripts::read_one()
            .key(self.stream_key(pool))
            .key(self.inflight_key(pool))
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .invoke_async::<Option<Vec<String>>>(&mut conn)
            .await?
        else {
            return Ok(None);
        };

        let mut values = reply.into_iter();
        let Some(entry_id) = values.next() else {
            return Ok(None);
        };
        let mut fields = HashMap::new();
        while let (Some(k), Some(v)) = (values.next(), values.next()) {
            fields.insert(k, v);
        }

        match QueueEntry::from_fields(&fields) {
            Ok(entry) => Ok(Some(Delivery {
                task: entry.task,
                attempts: entry.attempts,
                delivered_at: Timestamp::now(),
            })),
            Err(err) => {
                tracing::warn!(pool = %pool, entry_id = %entry_id, error = %err, "Dropping malformed stream entry");
                self.discard(pool, &entry_id, fields.get(field::TASK_ID)).await?;
                Err(err)
            }
        }
    }

    async fn discard(&self, pool: &PoolName, entry_id: &str, task_id: Option<&String>) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let stream = self.stream_key(pool);
        redis::cmd("XACK")
            .arg(&stream)
            .arg(&self.config.group)
            .arg(entry_id)
            .query_async::<i64>(&mut conn)
            .await?;
        redis::cmd("XDEL")
            .arg(&stream)
            .arg(entry_id)
            .query_async::<i64>(&mut conn)
            .await?;
        if let Some(task_id) = task_id {
            conn.hdel::<_, _, ()>(self.inflight_key(pool), task_id).await?;
        }
        Ok(())
    }

    async fn settle(&self, script: Script, pool: &PoolName, task_id: &TaskId) -> QueueResult<AckOutcome> {
        self.ensure_group(pool).await?;
        let mut conn = self.conn.clone();
        let settled = script
            .key(self.stream_key(pool))
            .key(self.inflight_key(pool))
            .arg(&self.config.group)
            .arg(task_id.as_str())
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(if settled == 1 {
            AckOutcome::Acked
        } else {
            AckOutcome::AlreadySettled
        })
    }
}

#[async_trait]
impl Queue for RedisStreamQueue {
    async fn enqueue(&self, pool: &PoolName, task: Task) -> QueueResult<()> {
        self.ensure_group(pool).await?;
        let entry = QueueEntry::new(task);
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(pool)).arg("*");
        for (name, value) in entry.to_fields()? {
            cmd.arg(name).arg(value);
        }
        let mut conn = self.conn.clone();
        let entry_id: String = cmd.query_async(&mut conn).await?;
        conn.sadd::<_, _, ()>(self.pools_key(), pool.as_str()).await?;
        tracing::debug!(pool = %pool, task_id = %entry.task_id(), entry_id = %entry_id, "Enqueue");
        Ok(())
    }

    async fn dequeue(&self, pool: &PoolName, timeout: Duration) -> QueueResult<Option<Delivery>> {
        self.ensure_group(pool).await?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.read_one(pool).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, pool: &PoolName, task_id: &TaskId) -> QueueResult<AckOutcome> {
        self.settle(scripts::ack(), pool, task_id).await
    }

    async fn release(&self, pool: &PoolName, task_id: &TaskId) -> QueueResult<AckOutcome> {
        self.settle(scripts::release(), pool, task_id).await
    }

    async fn requeue_orphans(&self, idle: Duration) -> QueueResult<Vec<Reclaimed>> {
        let now = Timestamp::now().to_rfc3339();
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let mut reclaimed = Vec::new();
        for pool in self.pools().await? {
            self.ensure_group(&pool).await?;
            let mut conn = self.conn.clone();
            let flat = scripts::reclaim()
                .key(self.stream_key(&pool))
                .key(self.inflight_key(&pool))
                .arg(&self.config.group)
                .arg(&self.config.consumer)
                .arg(idle_ms)
                .arg(&now)
                .invoke_async::<Vec<String>>(&mut conn)
                .await?;
            for pair in flat.chunks(2) {
                let [task_id, attempts] = pair else {
                    continue;
                };
                let task_id = TaskId::parse(task_id.as_str())?;
                let attempts = attempts
                    .parse()
                    .map_err(|e| QueueError::malformed("reclaim reply", e))?;
                tracing::info!(pool = %pool, task_id = %task_id, attempts, "Requeued orphan");
                reclaimed.push(Reclaimed {
                    pool: pool.clone(),
                    task_id,
                    attempts,
                });
            }
        }
        Ok(reclaimed)
    }

    async fn pending(&self, pool: &PoolName) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("XLEN")
            .arg(self.stream_key(pool))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn pools(&self) -> QueueResult<Vec<PoolName>> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = conn.smembers(self.pools_key()).await?;
        let mut pools = names
            .iter()
            .map(|n| PoolName::parse(n.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        pools.sort();
        Ok(pools)
    }
}

/// Redis URL for integration tests, from `GANTRY_REDIS_URL`
#[cfg(test)]
pub(crate) fn test_redis_url() -> String {
    std::env::var("GANTRY_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}
