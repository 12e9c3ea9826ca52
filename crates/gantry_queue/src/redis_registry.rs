//! Worker registry on Redis.
//!
//! Each worker is a hash that expires after the liveness TTL; per-pool sets
//! index them. Set members whose hash has expired are removed lazily when
//! the set is read.

use crate::error::{QueueError, QueueResult};
use crate::worker::{DEFAULT_WORKER_TTL, Worker, WorkerRegistry};
use async_trait::async_trait;
use gantry_core::{PoolName, Timestamp, WorkerId};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

fn refresh_script() -> redis::Script {
    // KEYS: worker hash. ARGV: metrics, last_seen, ttl_secs, pool, url.
    redis::Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
        redis.call('HSET', KEYS[1], 'metrics', ARGV[1], 'last_seen', ARGV[2])
        if ARGV[4] ~= '' then redis.call('HSET', KEYS[1], 'pool', ARGV[4]) end
        if ARGV[5] ~= '' then redis.call('HSET', KEYS[1], 'url', ARGV[5]) end
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        return 1
        ",
    )
}

/// Registry backed by expiring Redis hashes
pub struct RedisWorkerRegistry {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl std::fmt::Debug for RedisWorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWorkerRegistry")
            .field("connection", &"ConnectionManager")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RedisWorkerRegistry {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the URL is invalid or Redis is unreachable
    pub async fn connect(url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            ttl: DEFAULT_WORKER_TTL,
        })
    }

    /// Set the liveness TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn worker_key(&self, id: &str) -> String {
        format!("{}:worker:{}", self.prefix, id)
    }

    fn pool_key(&self, pool: &str) -> String {
        format!("{}:pool:{}:workers", self.prefix, pool)
    }

    fn pools_key(&self) -> String {
        format!("{}:worker_pools", self.prefix)
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.ttl.as_secs().max(1)).unwrap_or(i64::MAX)
    }

    async fn load(&self, id: &str) -> QueueResult<Option<Worker>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.worker_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode(id, &fields).map(Some)
    }

    async fn members(&self, pool: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(self.pool_key(pool)).await?)
    }

    async fn all_pools(&self) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(self.pools_key()).await?)
    }

    async fn unindex(&self, pool: &str, id: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(self.pool_key(pool), id).await?;
        Ok(())
    }

    /// Every worker whose hash still exists, pruning dangling set members
    async fn scan(&self, pool: Option<&PoolName>) -> QueueResult<Vec<Worker>> {
        let pools = match pool {
            Some(pool) => vec![pool.to_string()],
            None => self.all_pools().await?,
        };
        let mut workers = Vec::new();
        for pool in pools {
            for id in self.members(&pool).await? {
                match self.load(&id).await? {
                    Some(worker) if worker.pool.as_str() == pool => workers.push(worker),
                    _ => self.unindex(&pool, &id).await?,
                }
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers.dedup_by(|a, b| a.worker_id == b.worker_id);
        Ok(workers)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> QueueResult<String> {
    serde_json::to_string(value).map_err(|e| QueueError::malformed("worker hash", e))
}

fn from_json<T: serde::de::DeserializeOwned + Default>(raw: Option<&String>) -> QueueResult<T> {
    match raw {
        Some(raw) => serde_json::from_str(raw).map_err(|e| QueueError::malformed("worker hash", e)),
        None => Ok(T::default()),
    }
}

fn decode(id: &str, fields: &HashMap<String, String>) -> QueueResult<Worker> {
    let get = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| QueueError::malformed("worker hash", format!("missing {}", name)))
    };
    Ok(Worker {
        worker_id: WorkerId::parse(id)?,
        pool: PoolName::parse(get("pool")?.as_str())?,
        url: get("url")?.clone(),
        advertises: from_json(fields.get("advertises"))?,
        handlers: from_json(fields.get("handlers"))?,
        last_seen: Timestamp::parse(get("last_seen")?)?,
        metrics: from_json(fields.get("metrics"))?,
    })
}

fn encode(worker: &Worker) -> QueueResult<Vec<(&'static str, String)>> {
    Ok(vec![
        ("pool", worker.pool.to_string()),
        ("url", worker.url.clone()),
        ("advertises", to_json(&worker.advertises)?),
        ("handlers", to_json(&worker.handlers)?),
        ("metrics", to_json(&worker.metrics)?),
        ("last_seen", worker.last_seen.to_rfc3339()),
    ])
}

#[async_trait]
impl WorkerRegistry for RedisWorkerRegistry {
    async fn register(&self, mut worker: Worker) -> QueueResult<()> {
        worker.last_seen = Timestamp::now();
        let key = self.worker_key(worker.worker_id.as_str());
        let fields = encode(&worker)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, fields.as_slice())
            .ignore()
            .expire(&key, self.ttl_secs())
            .ignore()
            .sadd(self.pool_key(worker.pool.as_str()), worker.worker_id.as_str())
            .ignore()
            .sadd(self.pools_key(), worker.pool.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        tracing::info!(worker_id = %worker.worker_id, pool = %worker.pool, url = %worker.url, "Worker registered");
        Ok(())
    }

    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        metrics: Map<String, Value>,
        pool: Option<PoolName>,
        url: Option<String>,
    ) -> QueueResult<bool> {
        let metrics_json = to_json(&metrics)?;
        let mut conn = self.conn.clone();
        let refreshed: i64 = refresh_script()
            .key(self.worker_key(worker_id.as_str()))
            .arg(metrics_json)
            .arg(Timestamp::now().to_rfc3339())
            .arg(self.ttl_secs())
            .arg(pool.as_ref().map(PoolName::as_str).unwrap_or(""))
            .arg(url.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        if refreshed == 1 {
            if let Some(pool) = &pool {
                let _: () = redis::pipe()
                    .sadd(self.pool_key(pool.as_str()), worker_id.as_str())
                    .ignore()
                    .sadd(self.pools_key(), pool.as_str())
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
            }
            return Ok(true);
        }
        match (pool, url) {
            (Some(pool), Some(url)) => {
                let mut worker = Worker::new(worker_id.clone(), pool, url);
                worker.metrics = metrics;
                self.register(worker).await?;
                Ok(true)
            }
            _ => {
                tracing::debug!(worker_id = %worker_id, "Heartbeat from unknown worker refused");
                Ok(false)
            }
        }
    }

    async fn list(&self, pool: Option<&PoolName>) -> QueueResult<Vec<Worker>> {
        self.scan(pool).await
    }

    async fn get(&self, worker_id: &WorkerId) -> QueueResult<Option<Worker>> {
        self.load(worker_id.as_str()).await
    }

    async fn remove(&self, worker_id: &WorkerId) -> QueueResult<bool> {
        let Some(worker) = self.load(worker_id.as_str()).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.worker_key(worker_id.as_str())).await?;
        self.unindex(worker.pool.as_str(), worker_id.as_str()).await?;
        Ok(removed > 0)
    }

    async fn prune_stale(&self, ttl: Duration) -> QueueResult<Vec<WorkerId>> {
        let now = Timestamp::now();
        let mut pruned = Vec::new();
        for worker in self.scan(None).await? {
            if now.duration_since(&worker.last_seen) > ttl {
                let mut conn = self.conn.clone();
                conn.del::<_, ()>(self.worker_key(worker.worker_id.as_str())).await?;
                self.unindex(worker.pool.as_str(), worker.worker_id.as_str()).await?;
                tracing::info!(worker_id = %worker.worker_id, "Pruned stale worker");
                pruned.push(worker.worker_id);
            }
        }
        Ok(pruned)
    }
}
