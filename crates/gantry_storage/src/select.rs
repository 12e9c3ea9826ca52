//! Leader and candidate selection over stored runs.
//!
//! Evolutionary loops ask a selector for the current best run (the leader)
//! and a batch of in-flight candidates. Bootstrap and input selectors hand
//! out a fixed first batch once, then behave like a result backend selector.

use crate::backend::{ResultBackend, StorageResult};
use crate::run::TaskRun;
use async_trait::async_trait;
use gantry_core::{PoolName, TaskStatus};
use std::cmp::Ordering;
use std::sync::Arc;

/// What a selector returns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Best successful run so far
    pub leader: Option<TaskRun>,
    /// Runs to consider next
    pub candidates: Vec<TaskRun>,
}

/// A source of selections
#[async_trait]
pub trait Selector: Send {
    /// Produce the next selection
    ///
    /// # Errors
    ///
    /// Returns error if the backing store cannot be read
    async fn select(&mut self) -> StorageResult<Selection>;
}

/// Picks from the runs stored in a result backend
#[derive(Clone)]
pub struct ResultBackendSelector {
    backend: Arc<dyn ResultBackend>,
    pool: PoolName,
    n: usize,
}

impl ResultBackendSelector {
    /// Select at most `n` candidates from `pool`
    #[must_use]
    pub fn new(backend: Arc<dyn ResultBackend>, pool: PoolName, n: usize) -> Self {
        Self { backend, pool, n }
    }

    /// Highest-scoring successful run, earliest arrival on ties
    ///
    /// Runs without a numeric score rank below any scored run.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read
    pub async fn leader(&self) -> StorageResult<Option<TaskRun>> {
        let runs = self
            .backend
            .list(Some(&self.pool), Some(TaskStatus::Success))
            .await?;
        Ok(runs.into_iter().reduce(|best, run| {
            match compare_scores(run.score(), best.score()) {
                Ordering::Greater => run,
                Ordering::Less => best,
                Ordering::Equal if run.arrival < best.arrival => run,
                Ordering::Equal => best,
            }
        }))
    }

    /// Up to `n` running runs in arrival order
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read
    pub async fn candidates(&self) -> StorageResult<Vec<TaskRun>> {
        let mut runs = self
            .backend
            .list(Some(&self.pool), Some(TaskStatus::Running))
            .await?;
        runs.truncate(self.n);
        Ok(runs)
    }
}

fn compare_scores(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[async_trait]
impl Selector for ResultBackendSelector {
    async fn select(&mut self) -> StorageResult<Selection> {
        Ok(Selection {
            leader: self.leader().await?,
            candidates: self.candidates().await?,
        })
    }
}

/// Returns a seed run first, then delegates to the backend
pub struct BootstrapSelector {
    seed: Option<TaskRun>,
    inner: ResultBackendSelector,
}

impl BootstrapSelector {
    /// Create a selector whose first selection is `[bootstrap]`
    #[must_use]
    pub fn new(
        backend: Arc<dyn ResultBackend>,
        pool: PoolName,
        bootstrap: TaskRun,
        n: usize,
    ) -> Self {
        Self {
            seed: Some(bootstrap),
            inner: ResultBackendSelector::new(backend, pool, n),
        }
    }
}

#[async_trait]
impl Selector for BootstrapSelector {
    async fn select(&mut self) -> StorageResult<Selection> {
        if let Some(seed) = self.seed.take() {
            return Ok(Selection {
                leader: None,
                candidates: vec![seed],
            });
        }
        self.inner.select().await
    }
}

/// Returns caller-supplied candidates first, then delegates to the backend
pub struct InputSelector {
    initial: Option<Vec<TaskRun>>,
    inner: ResultBackendSelector,
}

impl InputSelector {
    /// Create a selector whose first selection is up to `n` of `initial`
    #[must_use]
    pub fn new(
        backend: Arc<dyn ResultBackend>,
        pool: PoolName,
        initial: Vec<TaskRun>,
        n: usize,
    ) -> Self {
        Self {
            initial: Some(initial),
            inner: ResultBackendSelector::new(backend, pool, n),
        }
    }
}

#[async_trait]
impl Selector for InputSelector {
    async fn select(&mut self) -> StorageResult<Selection> {
        if let Some(mut initial) = self.initial.take() {
            initial.truncate(self.inner.n);
            return Ok(Selection {
                leader: None,
                candidates: initial,
            });
        }
        self.inner.select().await
    }
}
