//! Worker registry.
//!
//! Workers register with a pool and a callback URL, then keep themselves
//! alive with heartbeats. A worker whose last heartbeat is older than the
//! registry's TTL is no longer listed.

use crate::error::QueueResult;
use async_trait::async_trait;
use gantry_core::{Clock, PoolName, SystemClock, Timestamp, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Liveness window used when none is configured
pub const DEFAULT_WORKER_TTL: Duration = Duration::from_secs(15);

/// A registered worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Worker id
    pub worker_id: WorkerId,
    /// Pool it serves
    pub pool: PoolName,
    /// RPC endpoint
    pub url: String,
    /// Free-form capabilities
    #[serde(default)]
    pub advertises: Map<String, Value>,
    /// Actions the worker can run; empty means any
    #[serde(default)]
    pub handlers: Vec<String>,
    /// Last registration or heartbeat
    pub last_seen: Timestamp,
    /// Metrics from the last heartbeat
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl Worker {
    /// Create a worker seen now
    #[must_use]
    pub fn new(worker_id: WorkerId, pool: PoolName, url: impl Into<String>) -> Self {
        Self {
            worker_id,
            pool,
            url: url.into(),
            advertises: Map::new(),
            handlers: Vec::new(),
            last_seen: Timestamp::now(),
            metrics: Map::new(),
        }
    }

    /// Set the handler list
    #[must_use]
    pub fn with_handlers(mut self, handlers: Vec<String>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Set advertised capabilities
    #[must_use]
    pub fn with_advertises(mut self, advertises: Map<String, Value>) -> Self {
        self.advertises = advertises;
        self
    }

    /// Whether this worker can run a task needing `action`
    #[must_use]
    pub fn handles(&self, action: Option<&str>) -> bool {
        match action {
            None => true,
            Some(_) if self.handlers.is_empty() => true,
            Some(action) => self.handlers.iter().any(|h| h == action),
        }
    }
}

/// Worker liveness tracking
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Add or replace a worker, marking it seen now
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be written
    async fn register(&self, worker: Worker) -> QueueResult<()>;

    /// Refresh a worker
    ///
    /// An unknown worker is registered when `pool` and `url` are both given;
    /// otherwise the heartbeat is refused and `false` returned.
    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        metrics: Map<String, Value>,
        pool: Option<PoolName>,
        url: Option<String>,
    ) -> QueueResult<bool>;

    /// Live workers, optionally limited to one pool, sorted by id
    async fn list(&self, pool: Option<&PoolName>) -> QueueResult<Vec<Worker>>;

    /// Look up a live worker
    async fn get(&self, worker_id: &WorkerId) -> QueueResult<Option<Worker>>;

    /// Drop a worker; `false` if it was not registered
    async fn remove(&self, worker_id: &WorkerId) -> QueueResult<bool>;

    /// Drop every worker not seen within `ttl`
    async fn prune_stale(&self, ttl: Duration) -> QueueResult<Vec<WorkerId>>;
}

type Lane = Arc<RwLock<HashMap<WorkerId, Worker>>>;

/// Registry held in process memory
///
/// Workers are kept in one lane per pool, like the queue's lanes, so
/// listing a pool never touches another pool's workers. A worker-to-pool
/// index serves lookups by id. Membership changes lock the index before
/// any lane; plain refreshes and listings only read it.
pub struct MemoryWorkerRegistry {
    lanes: RwLock<HashMap<PoolName, Lane>>,
    index: RwLock<HashMap<WorkerId, PoolName>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl std::fmt::Debug for MemoryWorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWorkerRegistry")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl MemoryWorkerRegistry {
    /// Create a registry on the system clock
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(Arc::new(SystemClock), ttl)
    }

    /// Create a registry reading time from `clock`
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    fn is_live(&self, worker: &Worker, now: &Timestamp) -> bool {
        now.duration_since(&worker.last_seen) <= self.ttl
    }

    async fn lane(&self, pool: &PoolName) -> Lane {
        if let Some(lane) = self.lanes.read().await.get(pool) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write().await;
        Arc::clone(lanes.entry(pool.clone()).or_default())
    }

    async fn existing_lane(&self, pool: &PoolName) -> Option<Lane> {
        self.lanes.read().await.get(pool).map(Arc::clone)
    }

    async fn all_lanes(&self) -> Vec<Lane> {
        self.lanes.read().await.values().map(Arc::clone).collect()
    }

    // Caller holds the index write lock.
    async fn place(&self, index: &mut HashMap<WorkerId, PoolName>, worker: Worker) {
        let id = worker.worker_id.clone();
        let pool = worker.pool.clone();
        if let Some(old) = index.insert(id.clone(), pool.clone()) {
            if old != pool {
                if let Some(lane) = self.existing_lane(&old).await {
                    lane.write().await.remove(&id);
                }
                tracing::info!(worker_id = %id, from = %old, to = %pool, "Worker moved pool");
            }
        }
        self.lane(&pool).await.write().await.insert(id, worker);
    }

    async fn refresh(
        &self,
        worker_id: &WorkerId,
        pool: &PoolName,
        metrics: Map<String, Value>,
        url: Option<String>,
        now: Timestamp,
    ) -> Option<Map<String, Value>> {
        let lane = self.existing_lane(pool).await?;
        let mut lane = lane.write().await;
        let Some(worker) = lane.get_mut(worker_id) else {
            return Some(metrics);
        };
        worker.last_seen = now;
        worker.metrics = metrics;
        if let Some(url) = url {
            worker.url = url;
        }
        None
    }
}

impl Default for MemoryWorkerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_TTL)
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn register(&self, mut worker: Worker) -> QueueResult<()> {
        worker.last_seen = self.clock.now();
        tracing::info!(worker_id = %worker.worker_id, pool = %worker.pool, url = %worker.url, "Worker registered");
        let mut index = self.index.write().await;
        self.place(&mut index, worker).await;
        Ok(())
    }

    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        metrics: Map<String, Value>,
        pool: Option<PoolName>,
        url: Option<String>,
    ) -> QueueResult<bool> {
        let now = self.clock.now();
        let current = self.index.read().await.get(worker_id).cloned();

        // Same pool: refresh in place under the lane lock alone.
        let metrics = match &current {
            Some(known) if pool.as_ref().is_none_or(|p| p == known) => {
                match self.refresh(worker_id, known, metrics, url.clone(), now).await {
                    None => return Ok(true),
                    Some(metrics) => metrics,
                }
            }
            _ => metrics,
        };

        let mut index = self.index.write().await;
        let known = match index.get(worker_id).cloned() {
            Some(known) => match self.existing_lane(&known).await {
                Some(lane) => lane.write().await.remove(worker_id),
                None => None,
            },
            None => None,
        };
        let mut worker = match (known, pool, url) {
            (Some(mut worker), pool, url) => {
                if let Some(pool) = pool {
                    worker.pool = pool;
                }
                if let Some(url) = url {
                    worker.url = url;
                }
                worker
            }
            (None, Some(pool), Some(url)) => {
                tracing::info!(worker_id = %worker_id, pool = %pool, "Worker registered by heartbeat");
                Worker::new(worker_id.clone(), pool, url)
            }
            (None, _, _) => {
                index.remove(worker_id);
                tracing::debug!(worker_id = %worker_id, "Heartbeat from unknown worker refused");
                return Ok(false);
            }
        };
        worker.last_seen = now;
        worker.metrics = metrics;
        self.place(&mut index, worker).await;
        Ok(true)
    }

    async fn list(&self, pool: Option<&PoolName>) -> QueueResult<Vec<Worker>> {
        let now = self.clock.now();
        let lanes = match pool {
            Some(pool) => self.existing_lane(pool).await.into_iter().collect(),
            None => self.all_lanes().await,
        };
        let mut live = Vec::new();
        for lane in lanes {
            live.extend(
                lane.read()
                    .await
                    .values()
                    .filter(|w| self.is_live(w, &now))
                    .cloned(),
            );
        }
        live.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(live)
    }

    async fn get(&self, worker_id: &WorkerId) -> QueueResult<Option<Worker>> {
        let now = self.clock.now();
        let Some(pool) = self.index.read().await.get(worker_id).cloned() else {
            return Ok(None);
        };
        let Some(lane) = self.existing_lane(&pool).await else {
            return Ok(None);
        };
        let worker = lane
            .read()
            .await
            .get(worker_id)
            .filter(|w| self.is_live(w, &now))
            .cloned();
        Ok(worker)
    }

    async fn remove(&self, worker_id: &WorkerId) -> QueueResult<bool> {
        let mut index = self.index.write().await;
        let Some(pool) = index.remove(worker_id) else {
            return Ok(false);
        };
        Ok(match self.existing_lane(&pool).await {
            Some(lane) => lane.write().await.remove(worker_id).is_some(),
            None => false,
        })
    }

    async fn prune_stale(&self, ttl: Duration) -> QueueResult<Vec<WorkerId>> {
        let now = self.clock.now();
        let mut index = self.index.write().await;
        let mut stale = Vec::new();
        for lane in self.all_lanes().await {
            lane.write().await.retain(|id, w| {
                let keep = now.duration_since(&w.last_seen) <= ttl;
                if !keep {
                    stale.push(id.clone());
                }
                keep
            });
        }
        stale.sort();
        for id in &stale {
            index.remove(id);
            tracing::info!(worker_id = %id, "Pruned stale worker");
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;
    use gantry_core::ManualClock;

    fn clocked() -> (Arc<ManualClock>, MemoryWorkerRegistry) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000).unwrap()));
        let registry = MemoryWorkerRegistry::with_clock(clock.clone(), DEFAULT_WORKER_TTL);
        (clock, registry)
    }

    #[tokio::test]
    async fn test_register_and_list() {
        contract::register_and_list(&MemoryWorkerRegistry::default()).await;
    }

    #[tokio::test]
    async fn test_heartbeat_rules() {
        contract::heartbeat_rules(&MemoryWorkerRegistry::default()).await;
    }

    #[tokio::test]
    async fn test_remove_worker() {
        contract::remove_worker(&MemoryWorkerRegistry::default()).await;
    }

    #[tokio::test]
    async fn test_heartbeat_moves_pool() {
        contract::heartbeat_moves_pool(&MemoryWorkerRegistry::default()).await;
    }

    #[tokio::test]
    async fn test_lanes_are_separate() {
        let registry = MemoryWorkerRegistry::default();
        let a = PoolName::parse("a").unwrap();
        let b = PoolName::parse("b").unwrap();
        registry
            .register(Worker::new(WorkerId::parse("wa").unwrap(), a.clone(), "http://wa"))
            .await
            .unwrap();
        registry
            .register(Worker::new(WorkerId::parse("wb").unwrap(), b.clone(), "http://wb"))
            .await
            .unwrap();

        // A writer parked on pool b's lane does not block pool a.
        let lane_b = registry.existing_lane(&b).await.unwrap();
        let held = lane_b.write().await;
        let listed = tokio::time::timeout(Duration::from_millis(200), registry.list(Some(&a)))
            .await
            .expect("pool a listing blocked by pool b")
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(
            tokio::time::timeout(
                Duration::from_millis(200),
                registry.heartbeat(&WorkerId::parse("wa").unwrap(), Map::new(), None, None),
            )
            .await
            .expect("pool a heartbeat blocked by pool b")
            .unwrap()
        );
        drop(held);

        let all: Vec<String> = registry
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.worker_id.to_string())
            .collect();
        assert_eq!(all, vec!["wa", "wb"]);
    }

    #[tokio::test]
    async fn test_prune_stale() {
        let (clock, registry) = clocked();
        let pool = PoolName::parse("p").unwrap();
        let old = WorkerId::parse("old").unwrap();
        let fresh = WorkerId::parse("fresh").unwrap();
        registry
            .register(Worker::new(old.clone(), pool.clone(), "http://old"))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));
        registry
            .register(Worker::new(fresh.clone(), pool.clone(), "http://fresh"))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6));

        assert_eq!(registry.prune_stale(DEFAULT_WORKER_TTL).await.unwrap(), vec![old.clone()]);
        assert!(registry.get(&old).await.unwrap().is_none());
        assert!(registry.get(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_worker_not_listed() {
        let (clock, registry) = clocked();
        let pool = PoolName::parse("p").unwrap();
        registry
            .register(Worker::new(WorkerId::parse("w").unwrap(), pool.clone(), "http://w"))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(16));
        assert!(registry.list(Some(&pool)).await.unwrap().is_empty());

        assert!(
            registry
                .heartbeat(&WorkerId::parse("w").unwrap(), Map::new(), None, None)
                .await
                .unwrap()
        );
        assert_eq!(registry.list(Some(&pool)).await.unwrap().len(), 1);
    }

    #[test]
    fn test_handles() {
        let pool = PoolName::parse("p").unwrap();
        let any = Worker::new(WorkerId::parse("a").unwrap(), pool.clone(), "http://a");
        assert!(any.handles(None));
        assert!(any.handles(Some("eval")));

        let picky = any.clone().with_handlers(vec!["eval".into()]);
        assert!(picky.handles(Some("eval")));
        assert!(!picky.handles(Some("mutate")));
        assert!(picky.handles(None));
    }
}
