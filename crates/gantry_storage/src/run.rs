//! Task run records.

use gantry_core::{Digest, PoolName, Task, TaskId, TaskStatus, Timestamp, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// The result backend's view of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    /// Task id
    pub task_id: TaskId,
    /// Pool the task runs in
    pub pool: PoolName,
    /// Current status
    pub status: TaskStatus,
    /// The task payload
    pub payload: Map<String, Value>,
    /// Result reported by the worker
    #[serde(default)]
    pub result: Option<Value>,
    /// Error text for failed runs
    #[serde(default)]
    pub error: Option<String>,
    /// Worker the task was dispatched to
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    /// Number of orphan reclaims so far
    #[serde(default)]
    pub attempts: u32,
    /// Backend-assigned insertion sequence, 0 until first stored
    #[serde(default)]
    pub arrival: u64,
    /// Last update time
    pub updated_at: Timestamp,
    /// Task creation time
    pub created_at: Timestamp,
    /// Task labels
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Revision the task derives from
    #[serde(default)]
    pub parent_rev: Option<Digest>,
}

impl TaskRun {
    /// Record for a freshly submitted task
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            pool: task.pool.clone(),
            status: task.status,
            payload: task.payload.clone(),
            result: None,
            error: None,
            worker_id: None,
            attempts: 0,
            arrival: 0,
            updated_at: Timestamp::now(),
            created_at: task.created_at,
            labels: task.labels.clone(),
            parent_rev: task.parent_rev,
        }
    }

    /// A run that only exists to seed a selector
    #[must_use]
    pub fn seed(pool: PoolName, payload: Map<String, Value>) -> Self {
        Self::from_task(&Task::new(pool, payload))
    }

    /// Rebuild the task this run tracks
    #[must_use]
    pub fn to_task(&self) -> Task {
        Task {
            id: self.task_id.clone(),
            pool: self.pool.clone(),
            payload: self.payload.clone(),
            status: self.status,
            created_at: self.created_at,
            labels: self.labels.clone(),
            parent_rev: self.parent_rev,
        }
    }

    /// Set status and touch `updated_at`
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self.updated_at = Timestamp::now();
        self
    }

    /// Set the worker
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker_id = Some(worker);
        self
    }

    /// Set the result
    #[must_use]
    pub fn with_result(mut self, result: Option<Value>) -> Self {
        self.result = result;
        self
    }

    /// Set the error text
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Replace the labels
    #[must_use]
    pub fn with_labels(mut self, labels: BTreeSet<String>) -> Self {
        self.labels = labels;
        self.updated_at = Timestamp::now();
        self
    }

    /// Replace the payload
    #[must_use]
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self.updated_at = Timestamp::now();
        self
    }

    /// Set the reclaim count
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Numeric `result.score`, if any
    #[must_use]
    pub fn score(&self) -> Option<f64> {
        self.result
            .as_ref()
            .and_then(|r| r.get("score"))
            .and_then(Value::as_f64)
    }

    /// Whether the run matches optional pool and status filters
    #[must_use]
    pub fn matches(&self, pool: Option<&PoolName>, status: Option<TaskStatus>) -> bool {
        pool.is_none_or(|p| *p == self.pool) && status.is_none_or(|s| s == self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool() -> PoolName {
        PoolName::parse("p").unwrap()
    }

    #[test]
    fn test_score_reads_numeric_result() {
        let run = TaskRun::seed(pool(), Map::new()).with_result(Some(json!({"score": 2.5})));
        assert_eq!(run.score(), Some(2.5));
        let run = run.with_result(Some(json!({"score": "high"})));
        assert_eq!(run.score(), None);
        let run = run.with_result(None);
        assert_eq!(run.score(), None);
    }

    #[test]
    fn test_task_round_trip() {
        let task = Task::new(pool(), Map::new())
            .with_label("team-search")
            .with_parent_rev(Digest::compute(b"p"));
        let run = TaskRun::from_task(&task);
        assert_eq!(run.to_task(), task);
    }

    #[test]
    fn test_matches_filters() {
        let run = TaskRun::seed(pool(), Map::new()).with_status(TaskStatus::Running);
        assert!(run.matches(None, None));
        assert!(run.matches(Some(&pool()), Some(TaskStatus::Running)));
        assert!(!run.matches(None, Some(TaskStatus::Success)));
        assert!(!run.matches(Some(&PoolName::parse("q").unwrap()), None));
    }
}
