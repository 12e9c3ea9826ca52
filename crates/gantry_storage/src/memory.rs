//! In-memory result backend.

use crate::backend::{ResultBackend, RunUpdate, StorageResult, Transition};
use crate::run::TaskRun;
use async_trait::async_trait;
use gantry_core::{PoolName, TaskId, TaskStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Runs {
    by_id: HashMap<TaskId, TaskRun>,
    next_arrival: u64,
}

/// Task runs held in process memory
#[derive(Debug, Default)]
pub struct MemoryResultBackend {
    runs: RwLock<Runs>,
}

impl MemoryResultBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultBackend for MemoryResultBackend {
    async fn store(&self, mut run: TaskRun) -> StorageResult<TaskRun> {
        let mut runs = self.runs.write().await;
        let existing = runs.by_id.get(&run.task_id).map(|r| r.arrival);
        run.arrival = match existing {
            Some(arrival) => arrival,
            None => {
                runs.next_arrival += 1;
                runs.next_arrival
            }
        };
        runs.by_id.insert(run.task_id.clone(), run.clone());
        Ok(run)
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        from: &[TaskStatus],
        update: RunUpdate,
    ) -> StorageResult<Transition> {
        let mut runs = self.runs.write().await;
        let Some(current) = runs.by_id.get(task_id) else {
            return Ok(Transition::Missing);
        };
        if !from.contains(&current.status) {
            return Ok(Transition::Refused(current.clone()));
        }
        let previous = current.clone();
        let mut run = update(previous.clone());
        run.task_id = previous.task_id.clone();
        run.arrival = previous.arrival;
        runs.by_id.insert(task_id.clone(), run.clone());
        Ok(Transition::Applied { previous, run })
    }

    async fn get(&self, task_id: &TaskId) -> StorageResult<Option<TaskRun>> {
        Ok(self.runs.read().await.by_id.get(task_id).cloned())
    }

    async fn list(
        &self,
        pool: Option<&PoolName>,
        status: Option<TaskStatus>,
    ) -> StorageResult<Vec<TaskRun>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<TaskRun> = runs
            .by_id
            .values()
            .filter(|run| run.matches(pool, status))
            .cloned()
            .collect();
        matching.sort_by_key(|run| run.arrival);
        Ok(matching)
    }
}
