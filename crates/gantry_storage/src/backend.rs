//! The result backend contract and backend registration.

use crate::run::TaskRun;
use async_trait::async_trait;
use gantry_core::{PoolName, TaskId, TaskStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// No backend registered under the name
    #[error("Unknown result backend: {0}")]
    UnknownBackend(String),

    /// Backend needs a path and none was configured
    #[error("Result backend {0} requires a path")]
    MissingPath(String),

    /// Row encode/decode failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Backing store failure
    #[error("Storage error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Change applied by [`ResultBackend::transition`]
pub type RunUpdate = Box<dyn FnOnce(TaskRun) -> TaskRun + Send>;

/// Outcome of a conditional update
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The run was in one of the expected statuses and has been replaced
    Applied {
        /// The run before the update
        previous: TaskRun,
        /// The run as stored
        run: TaskRun,
    },
    /// The run is in another status; nothing was written
    Refused(TaskRun),
    /// No run is stored for the task
    Missing,
}

/// Durable store of task outcomes
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Insert or replace a run
    ///
    /// A run seen for the first time gets the next arrival number; updates
    /// keep the arrival of the first insert. Returns the stored run.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot write
    async fn store(&self, run: TaskRun) -> StorageResult<TaskRun>;

    /// Apply `update` to a run only if its status is one of `from`
    ///
    /// The check and the write happen under one lock or transaction, so two
    /// racing transitions out of the same status cannot both apply. The
    /// update cannot change the run's id or arrival.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot read or write
    async fn transition(
        &self,
        task_id: &TaskId,
        from: &[TaskStatus],
        update: RunUpdate,
    ) -> StorageResult<Transition>;

    /// Look up a run
    async fn get(&self, task_id: &TaskId) -> StorageResult<Option<TaskRun>>;

    /// Runs matching the filters, ordered by arrival
    async fn list(
        &self,
        pool: Option<&PoolName>,
        status: Option<TaskStatus>,
    ) -> StorageResult<Vec<TaskRun>>;

    /// Number of runs matching the filters
    async fn count(&self, pool: Option<&PoolName>, status: Option<TaskStatus>) -> StorageResult<usize> {
        Ok(self.list(pool, status).await?.len())
    }
}

/// Where a backend keeps its data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions {
    /// Database file for file-backed stores
    pub path: Option<PathBuf>,
}

impl BackendOptions {
    /// Options pointing at a file
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// The configured path, or an error naming the backend
    ///
    /// # Errors
    ///
    /// `MissingPath` if no path was set
    pub fn require_path(&self, backend: &str) -> StorageResult<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| StorageError::MissingPath(backend.to_string()))
    }
}

type Opener = fn(&BackendOptions) -> StorageResult<Arc<dyn ResultBackend>>;

/// Result backends by name
pub struct BackendRegistry {
    openers: HashMap<&'static str, Opener>,
}

impl BackendRegistry {
    /// A registry with no backends
    #[must_use]
    pub fn empty() -> Self {
        Self {
            openers: HashMap::new(),
        }
    }

    /// Register a backend under `name`, replacing any previous one
    pub fn register(&mut self, name: &'static str, opener: Opener) {
        self.openers.insert(name, opener);
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.openers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Open the backend registered under `name`
    ///
    /// # Errors
    ///
    /// `UnknownBackend` for an unregistered name, or the opener's error
    pub fn open(&self, name: &str, options: &BackendOptions) -> StorageResult<Arc<dyn ResultBackend>> {
        let opener = self
            .openers
            .get(name)
            .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))?;
        opener(options)
    }
}

fn open_memory(_: &BackendOptions) -> StorageResult<Arc<dyn ResultBackend>> {
    Ok(Arc::new(crate::memory::MemoryResultBackend::new()))
}

fn open_redb(options: &BackendOptions) -> StorageResult<Arc<dyn ResultBackend>> {
    let path = options.require_path("redb")?;
    Ok(Arc::new(crate::durable::RedbResultBackend::open(path)?))
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", open_memory);
        registry.register("redb", open_redb);
        registry
    }
}
