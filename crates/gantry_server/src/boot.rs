//! Backend selection and daemon assembly.
//!
//! Every backend kind is looked up by name in a factory map once, at
//! startup. Queue and registry factories are async because the Redis
//! variants connect on open.

use crate::config::GatewayConfig;
use futures::future::{BoxFuture, FutureExt};
use gantry_cluster::{Gateway, HttpDispatcher, Scheduler, Supervisor, TransportError};
use gantry_core::{CoreError, PoolName};
use gantry_provenance::{
    MemoryProvenanceStore, ProvenanceError, ProvenanceStore, RedbProvenanceStore,
};
use gantry_queue::{
    MemoryQueue, MemoryWorkerRegistry, Queue, QueueError, RedisQueueConfig, RedisStreamQueue,
    RedisWorkerRegistry, WorkerRegistry,
};
use gantry_storage::{BackendOptions, BackendRegistry, ResultBackend, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// No factory registered under the configured name
    #[error("Unknown {kind} backend: {name}")]
    UnknownBackend {
        /// Backend kind
        kind: &'static str,
        /// Configured name
        name: String,
    },

    /// A file-backed store was configured without a path
    #[error("{0} backend requires a path")]
    MissingPath(String),

    /// Queue or registry failed to open
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Result backend failed to open
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Provenance store failed to open
    #[error("Provenance error: {0}")]
    Provenance(#[from] ProvenanceError),

    /// HTTP client could not be built
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A configured pool name is invalid
    #[error("Invalid pool: {0}")]
    Pool(#[from] CoreError),
}

/// Startup result type
pub type BootResult<T> = Result<T, BootError>;

type QueueFactory = fn(&GatewayConfig) -> BoxFuture<'_, BootResult<Arc<dyn Queue>>>;
type RegistryFactory = fn(&GatewayConfig) -> BoxFuture<'_, BootResult<Arc<dyn WorkerRegistry>>>;
type ProvenanceFactory = fn(&GatewayConfig) -> BootResult<Arc<dyn ProvenanceStore>>;

fn worker_ttl(config: &GatewayConfig) -> Duration {
    Duration::from_millis(config.scheduler.worker_ttl_ms)
}

fn memory_queue(_: &GatewayConfig) -> BoxFuture<'_, BootResult<Arc<dyn Queue>>> {
    async { Ok(Arc::new(MemoryQueue::new()) as Arc<dyn Queue>) }.boxed()
}

fn redis_queue(config: &GatewayConfig) -> BoxFuture<'_, BootResult<Arc<dyn Queue>>> {
    async move {
        let section = &config.queue;
        let mut redis = RedisQueueConfig::new(section.redis_url.as_str())
            .with_prefix(section.prefix.as_str())
            .with_group(section.group.as_str())
            .with_poll_interval(Duration::from_millis(section.poll_interval_ms));
        if let Some(consumer) = &section.consumer {
            redis = redis.with_consumer(consumer.as_str());
        }
        let queue = RedisStreamQueue::connect(redis).await?;
        Ok(Arc::new(queue) as Arc<dyn Queue>)
    }
    .boxed()
}

fn memory_registry(config: &GatewayConfig) -> BoxFuture<'_, BootResult<Arc<dyn WorkerRegistry>>> {
    async move {
        Ok(Arc::new(MemoryWorkerRegistry::new(worker_ttl(config))) as Arc<dyn WorkerRegistry>)
    }
    .boxed()
}

fn redis_registry(config: &GatewayConfig) -> BoxFuture<'_, BootResult<Arc<dyn WorkerRegistry>>> {
    async move {
        let registry =
            RedisWorkerRegistry::connect(&config.queue.redis_url, config.queue.prefix.as_str())
                .await?
                .with_ttl(worker_ttl(config));
        Ok(Arc::new(registry) as Arc<dyn WorkerRegistry>)
    }
    .boxed()
}

fn memory_provenance(_: &GatewayConfig) -> BootResult<Arc<dyn ProvenanceStore>> {
    Ok(Arc::new(MemoryProvenanceStore::new()))
}

fn redb_provenance(config: &GatewayConfig) -> BootResult<Arc<dyn ProvenanceStore>> {
    let path = config
        .provenance
        .path
        .as_deref()
        .ok_or_else(|| BootError::MissingPath("redb".to_string()))?;
    Ok(Arc::new(RedbProvenanceStore::open(path)?))
}

/// Backend factories by name
///
/// The queue and registry maps share the `[queue] backend` key, so both
/// always come from the same store.
pub struct Backends {
    queues: HashMap<&'static str, QueueFactory>,
    registries: HashMap<&'static str, RegistryFactory>,
    results: BackendRegistry,
    provenance: HashMap<&'static str, ProvenanceFactory>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("results", &self.results.names())
            .finish_non_exhaustive()
    }
}

impl Default for Backends {
    fn default() -> Self {
        let mut queues: HashMap<&'static str, QueueFactory> = HashMap::new();
        queues.insert("memory", memory_queue);
        queues.insert("redis", redis_queue);

        let mut registries: HashMap<&'static str, RegistryFactory> = HashMap::new();
        registries.insert("memory", memory_registry);
        registries.insert("redis", redis_registry);

        let mut provenance: HashMap<&'static str, ProvenanceFactory> = HashMap::new();
        provenance.insert("memory", memory_provenance);
        provenance.insert("redb", redb_provenance);

        Self {
            queues,
            registries,
            results: BackendRegistry::default(),
            provenance,
        }
    }
}

fn lookup<F: Copy>(
    map: &HashMap<&'static str, F>,
    kind: &'static str,
    name: &str,
) -> BootResult<F> {
    map.get(name).copied().ok_or_else(|| BootError::UnknownBackend {
        kind,
        name: name.to_string(),
    })
}

impl Backends {
    /// Open the queue named by `[queue] backend`
    ///
    /// # Errors
    ///
    /// `UnknownBackend`, or the backend's own open error
    pub async fn queue(&self, config: &GatewayConfig) -> BootResult<Arc<dyn Queue>> {
        let open = lookup(&self.queues, "queue", &config.queue.backend)?;
        open(config).await
    }

    /// Open the worker registry named by `[queue] backend`
    ///
    /// # Errors
    ///
    /// `UnknownBackend`, or the backend's own open error
    pub async fn registry(&self, config: &GatewayConfig) -> BootResult<Arc<dyn WorkerRegistry>> {
        let open = lookup(&self.registries, "registry", &config.queue.backend)?;
        open(config).await
    }

    /// Open the result backend named by `[results] backend`
    ///
    /// # Errors
    ///
    /// `UnknownBackend`, or the backend's own open error
    pub fn results(&self, config: &GatewayConfig) -> BootResult<Arc<dyn ResultBackend>> {
        let name = config.results.backend.as_str();
        if !self.results.names().iter().any(|known| *known == name) {
            return Err(BootError::UnknownBackend {
                kind: "result",
                name: name.to_string(),
            });
        }
        let mut options = BackendOptions::default();
        if let Some(path) = &config.results.path {
            options = options.with_path(path.clone());
        }
        Ok(self.results.open(name, &options)?)
    }

    /// Open the provenance store named by `[provenance] backend`
    ///
    /// # Errors
    ///
    /// `UnknownBackend`, or the backend's own open error
    pub fn provenance(&self, config: &GatewayConfig) -> BootResult<Arc<dyn ProvenanceStore>> {
        let open = lookup(&self.provenance, "provenance", &config.provenance.backend)?;
        open(config)
    }
}

/// A running gateway: the RPC facade plus the loops behind it
#[derive(Debug, Clone)]
pub struct Daemon {
    /// RPC facade
    pub gateway: Gateway,
    /// Pool loops and sweeper
    pub supervisor: Arc<Supervisor>,
}

impl Daemon {
    /// Open every backend, start the configured pools and the sweeper
    ///
    /// # Errors
    ///
    /// Returns the first backend or pool-name error
    pub async fn start(config: &GatewayConfig, backends: &Backends) -> BootResult<Self> {
        let pools = config
            .scheduler
            .pools
            .iter()
            .map(|name| PoolName::parse(name.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let scheduler_config = config.scheduler.to_config();
        let dispatcher = HttpDispatcher::new(scheduler_config.dispatch_timeout)?;
        let scheduler = Scheduler::new(
            backends.queue(config).await?,
            backends.registry(config).await?,
            backends.results(config)?,
            backends.provenance(config)?,
            Arc::new(dispatcher),
        )
        .with_config(scheduler_config);

        let supervisor = Arc::new(Supervisor::new(Arc::new(scheduler)));
        let gateway = Gateway::new(Arc::clone(supervisor.scheduler()))
            .with_supervisor(Arc::clone(&supervisor));

        for pool in &pools {
            supervisor.ensure(pool).await;
        }
        supervisor.start_sweeper().await;

        tracing::info!(
            queue = %config.queue.backend,
            results = %config.results.backend,
            provenance = %config.provenance.backend,
            pools = pools.len(),
            "Gateway started"
        );
        Ok(Self {
            gateway,
            supervisor,
        })
    }
}
