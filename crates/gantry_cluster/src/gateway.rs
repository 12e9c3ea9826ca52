//! Gateway API.
//!
//! The typed surface that submitters and workers talk to. Each method
//! takes a parameter struct that deserializes from the named JSON-RPC
//! params of the method of the same name (`Task.submit`, `Worker.register`
//! and so on) and returns a serializable reply.

use crate::events::TaskEvent;
use crate::labels::{LabelError, LabelMeta, LabelUpdate};
use crate::scheduler::{Scheduler, SchedulerError, TaskPatch};
use crate::supervisor::Supervisor;
use gantry_core::{Digest, PoolName, Task, TaskId, TaskStatus, WorkerId};
use gantry_queue::{QueueError, Worker};
use gantry_storage::{StorageError, TaskRun};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Gateway errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Scheduler failure, including provenance violations
    #[error("{0}")]
    Scheduler(#[from] SchedulerError),

    /// Queue or registry failure
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Result backend failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A parameter failed validation
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// No such task
    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

impl From<LabelError> for GatewayError {
    fn from(err: LabelError) -> Self {
        Self::InvalidParams(err.to_string())
    }
}

/// Gateway result type
pub type GatewayResult<T> = Result<T, GatewayError>;

/// `Task.submit` params
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTask {
    /// Target pool
    pub pool: String,
    /// Task payload
    pub payload: Map<String, Value>,
    /// Requested id
    #[serde(default)]
    pub task_id: Option<String>,
    /// Labels, as a list of names
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Revision the task derives from
    #[serde(default)]
    pub parent_rev: Option<Digest>,
}

/// `Task.submit` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submitted {
    /// Id the task was stored under
    pub task_id: TaskId,
}

/// Params naming a single task (`Task.get`, `Work.cancel`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    /// Task id
    pub task_id: String,
}

/// Fields `Task.patch` may change; other keys are ignored
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskChanges {
    /// Replacement labels
    #[serde(default)]
    pub labels: Option<BTreeSet<String>>,
    /// Replacement payload
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
}

/// `Task.patch` params
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTask {
    /// Task id
    pub task_id: String,
    /// Changes to apply
    #[serde(default)]
    pub changes: TaskChanges,
}

/// `Pool.create` params and reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRef {
    /// Pool name
    pub name: String,
}

/// `Pool.listTasks` params
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPoolTasks {
    /// Pool name
    pub pool_name: String,
    /// Status to list; queued when absent
    #[serde(default)]
    pub status: Option<String>,
}

/// `Label.update` params
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabelParams {
    /// Label name
    pub label: String,
    /// Settings to merge
    #[serde(default)]
    pub meta: LabelUpdate,
}

/// Params naming a single label (`Label.pause`, `Label.resume`,
/// `Label.cancel`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LabelRef {
    /// Label name
    pub label: String,
}

/// `Label.update` reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelState {
    /// Label name
    pub label: String,
    /// Settings after the update
    pub meta: LabelMeta,
}

/// `Label.pause` and `Label.resume` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelPaused {
    /// Label name
    pub label: String,
    /// Whether it is now paused
    pub paused: bool,
}

/// `Label.cancel` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cancelled {
    /// Tasks canceled
    pub cancelled: usize,
}

/// `Worker.register` params
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWorker {
    /// Worker id
    pub worker_id: String,
    /// Pool it serves
    pub pool: String,
    /// RPC endpoint
    pub url: String,
    /// Capabilities
    #[serde(default)]
    pub advertises: Map<String, Value>,
    /// Actions it can run
    #[serde(default)]
    pub handlers: Option<Vec<String>>,
}

/// `Worker.heartbeat` params
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Worker id
    pub worker_id: String,
    /// Current metrics
    #[serde(default)]
    pub metrics: Map<String, Value>,
    /// Pool, needed if the gateway forgot the worker
    #[serde(default)]
    pub pool: Option<String>,
    /// URL, needed if the gateway forgot the worker
    #[serde(default)]
    pub url: Option<String>,
}

/// `Worker.list` params
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListWorkers {
    /// Restrict to one pool
    #[serde(default)]
    pub pool: Option<String>,
}

/// `Worker.list` reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerList {
    /// Live workers
    pub workers: Vec<Worker>,
}

/// `Work.finished` params
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkFinished {
    /// Task id
    pub task_id: String,
    /// Reported status
    pub status: String,
    /// Worker result
    #[serde(default)]
    pub result: Option<Value>,
}

/// `{ok}` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// Whether the call took effect
    pub ok: bool,
}

impl Ack {
    const fn new(ok: bool) -> Self {
        Self { ok }
    }
}

fn invalid(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::InvalidParams(err.to_string())
}

/// The gateway
#[derive(Debug, Clone)]
pub struct Gateway {
    scheduler: Arc<Scheduler>,
    supervisor: Option<Arc<Supervisor>>,
}

impl Gateway {
    /// Create a gateway that only enqueues; no pool loops are started
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            supervisor: None,
        }
    }

    /// Start pool loops through `supervisor` as pools are first submitted to
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// The scheduler behind the gateway
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Task update events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.scheduler.subscribe()
    }

    /// `Task.submit`: store and enqueue a task
    ///
    /// A requested id that is already taken is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a bad pool or id; backend errors otherwise
    pub async fn task_submit(&self, params: SubmitTask) -> GatewayResult<Submitted> {
        let pool = PoolName::parse(params.pool).map_err(invalid)?;
        let mut task_id = match params.task_id {
            Some(raw) => TaskId::parse(raw).map_err(invalid)?,
            None => TaskId::generate(),
        };
        if self.scheduler.results().get(&task_id).await?.is_some() {
            let fresh = TaskId::generate();
            tracing::warn!(requested = %task_id, assigned = %fresh, "Task id collision");
            task_id = fresh;
        }

        let mut task = Task::new(pool.clone(), params.payload).with_id(task_id.clone());
        task.labels = params.labels;
        task.parent_rev = params.parent_rev;
        task.status = TaskStatus::Queued;

        let run = self.scheduler.results().store(TaskRun::from_task(&task)).await?;
        self.scheduler.queue().enqueue(&pool, task).await?;
        self.scheduler.publish(&run);
        if let Some(supervisor) = &self.supervisor {
            supervisor.ensure(&pool).await;
        }
        tracing::info!(pool = %pool, task_id = %task_id, "Task queued");
        Ok(Submitted { task_id })
    }

    /// `Task.get`
    ///
    /// # Errors
    ///
    /// `TaskNotFound` if no run exists
    pub async fn task_get(&self, params: TaskRef) -> GatewayResult<TaskRun> {
        let task_id = TaskId::parse(params.task_id.as_str()).map_err(invalid)?;
        self.scheduler
            .results()
            .get(&task_id)
            .await?
            .ok_or(GatewayError::TaskNotFound(params.task_id))
    }

    /// `Task.patch`: change a task's labels or, before dispatch, its payload
    ///
    /// # Errors
    ///
    /// `TaskNotFound` if no run exists; `Scheduler(PayloadLocked)` for a
    /// payload change after dispatch
    pub async fn task_patch(&self, params: PatchTask) -> GatewayResult<TaskRun> {
        let task_id = TaskId::parse(params.task_id.as_str()).map_err(invalid)?;
        let patch = TaskPatch {
            labels: params.changes.labels,
            payload: params.changes.payload,
        };
        match self.scheduler.patch(&task_id, patch).await {
            Ok(run) => Ok(run),
            Err(SchedulerError::UnknownTask(_)) => Err(GatewayError::TaskNotFound(params.task_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// `Pool.create`: start a pool's loop ahead of its first task
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a bad name
    pub async fn pool_create(&self, params: PoolRef) -> GatewayResult<PoolRef> {
        let pool = PoolName::parse(params.name).map_err(invalid)?;
        if let Some(supervisor) = &self.supervisor {
            supervisor.ensure(&pool).await;
        }
        tracing::info!(pool = %pool, "Pool created");
        Ok(PoolRef {
            name: pool.to_string(),
        })
    }

    /// `Pool.listTasks`: a pool's tasks with one status, in arrival order
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a bad pool or status; backend errors otherwise
    pub async fn pool_list_tasks(&self, params: ListPoolTasks) -> GatewayResult<Vec<TaskRun>> {
        let pool = PoolName::parse(params.pool_name).map_err(invalid)?;
        let status = match params.status {
            Some(raw) => raw.parse().map_err(invalid)?,
            None => TaskStatus::Queued,
        };
        Ok(self.scheduler.results().list(Some(&pool), Some(status)).await?)
    }

    /// `Label.update`: merge settings into a label
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a blank label or bad rate
    pub async fn label_update(&self, params: LabelParams) -> GatewayResult<LabelState> {
        let meta = self.scheduler.labels().update(&params.label, params.meta).await?;
        Ok(LabelState {
            label: params.label,
            meta,
        })
    }

    /// `Label.pause`
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a blank label
    pub async fn label_pause(&self, params: LabelRef) -> GatewayResult<LabelPaused> {
        self.set_paused(params.label, true).await
    }

    /// `Label.resume`
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a blank label
    pub async fn label_resume(&self, params: LabelRef) -> GatewayResult<LabelPaused> {
        self.set_paused(params.label, false).await
    }

    async fn set_paused(&self, label: String, paused: bool) -> GatewayResult<LabelPaused> {
        let meta = self.scheduler.labels().set_paused(&label, paused).await?;
        Ok(LabelPaused {
            label,
            paused: meta.paused,
        })
    }

    /// `Label.cancel`: cancel every queued task carrying the label
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a blank label; backend errors otherwise
    pub async fn label_cancel(&self, params: LabelRef) -> GatewayResult<Cancelled> {
        if params.label.trim().is_empty() {
            return Err(LabelError::EmptyName.into());
        }
        let cancelled = self.scheduler.cancel_label(&params.label).await?;
        Ok(Cancelled { cancelled })
    }

    /// `Worker.register`
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a bad id or pool; backend errors otherwise
    pub async fn worker_register(&self, params: RegisterWorker) -> GatewayResult<Ack> {
        let worker = Worker::new(
            WorkerId::parse(params.worker_id).map_err(invalid)?,
            PoolName::parse(params.pool).map_err(invalid)?,
            params.url,
        )
        .with_advertises(params.advertises)
        .with_handlers(params.handlers.unwrap_or_default());
        let pool = worker.pool.clone();
        self.scheduler.registry().register(worker).await?;
        if let Some(supervisor) = &self.supervisor {
            supervisor.ensure(&pool).await;
        }
        Ok(Ack::new(true))
    }

    /// `Worker.heartbeat`
    ///
    /// `ok` is `false` when the worker is unknown and did not send both its
    /// pool and URL.
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a bad id or pool; backend errors otherwise
    pub async fn worker_heartbeat(&self, params: Heartbeat) -> GatewayResult<Ack> {
        let worker_id = WorkerId::parse(params.worker_id).map_err(invalid)?;
        let pool = params
            .pool
            .map(PoolName::parse)
            .transpose()
            .map_err(invalid)?;
        let known = self
            .scheduler
            .registry()
            .heartbeat(&worker_id, params.metrics, pool, params.url)
            .await?;
        if !known {
            tracing::warn!(worker_id = %worker_id, "Heartbeat ignored: send pool and url or re-register");
        }
        Ok(Ack::new(known))
    }

    /// `Worker.list`
    ///
    /// # Errors
    ///
    /// `InvalidParams` for a bad pool; backend errors otherwise
    pub async fn worker_list(&self, params: ListWorkers) -> GatewayResult<WorkerList> {
        let pool = params
            .pool
            .map(PoolName::parse)
            .transpose()
            .map_err(invalid)?;
        let workers = self.scheduler.registry().list(pool.as_ref()).await?;
        Ok(WorkerList { workers })
    }

    /// `Work.finished`: a worker reports a task's outcome
    ///
    /// `ok` is `false` for an unknown task and for a task that already
    /// settled; a late or repeated report changes nothing.
    ///
    /// # Errors
    ///
    /// `InvalidParams` for an unknown status. A provenance violation is
    /// returned after the task has been marked failed.
    pub async fn work_finished(&self, params: WorkFinished) -> GatewayResult<Ack> {
        let task_id = TaskId::parse(params.task_id).map_err(invalid)?;
        let status: TaskStatus = params.status.parse().map_err(invalid)?;
        match self.scheduler.complete(&task_id, status, params.result).await {
            Ok(done) => {
                tracing::info!(task_id = %task_id, status = %status, rev_hash = %done.rev_hash.short(), "Work finished");
                Ok(Ack::new(true))
            }
            Err(SchedulerError::UnknownTask(_)) => {
                tracing::warn!(task_id = %task_id, "Work.finished for unknown task");
                Ok(Ack::new(false))
            }
            Err(SchedulerError::AlreadySettled { status: settled, .. }) => {
                tracing::warn!(task_id = %task_id, reported = %status, settled = %settled, "Work.finished for settled task");
                Ok(Ack::new(false))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// `Work.cancel`
    ///
    /// `ok` is `false` if the task is unknown or already settled.
    ///
    /// # Errors
    ///
    /// Backend errors
    pub async fn work_cancel(&self, params: TaskRef) -> GatewayResult<Ack> {
        let task_id = TaskId::parse(params.task_id).map_err(invalid)?;
        Ok(Ack::new(self.scheduler.cancel(&task_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::*;
    use gantry_provenance::ProvenanceError;
    use serde_json::json;

    fn gateway() -> (Arc<FakeDispatcher>, Gateway) {
        let fake = Arc::new(FakeDispatcher::default());
        let gateway = Gateway::new(Arc::new(scheduler(Arc::clone(&fake))));
        (fake, gateway)
    }

    fn submit_params(value: Value) -> SubmitTask {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_submit_register_dispatch_finish() {
        let (_, gateway) = gateway();
        let submitted = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {"action": "eval"}})))
            .await
            .unwrap();
        gateway
            .worker_register(
                serde_json::from_value(json!({
                    "workerId": "w1", "pool": "p", "url": "http://w1/rpc", "advertises": {}
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        gateway.scheduler().step(&pool()).await.unwrap();

        let ack = gateway
            .work_finished(WorkFinished {
                task_id: submitted.task_id.to_string(),
                status: "success".into(),
                result: Some(json!({"score": 1})),
            })
            .await
            .unwrap();
        assert!(ack.ok);

        let run = gateway
            .task_get(TaskRef {
                task_id: submitted.task_id.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(run.status, TaskStatus::Success);
        assert_eq!(run.score(), Some(1.0));
        assert_eq!(gateway.scheduler().queue().pending(&pool()).await.unwrap(), 0);
        assert_eq!(
            gateway
                .scheduler()
                .provenance()
                .revisions_for_task(&submitted.task_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_submit_id_collision_gets_fresh_id() {
        let (_, gateway) = gateway();
        let first = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {}, "taskId": "t-1"})))
            .await
            .unwrap();
        assert_eq!(first.task_id.as_str(), "t-1");
        let second = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {}, "taskId": "t-1"})))
            .await
            .unwrap();
        assert_ne!(second.task_id, first.task_id);
        assert_eq!(gateway.scheduler().queue().pending(&pool()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_submit_records_labels_and_parent() {
        let (_, gateway) = gateway();
        let parent = gantry_core::chain::payload_hash(&json!({"seed": 0})).unwrap();
        let submitted = gateway
            .task_submit(submit_params(json!({
                "pool": "p",
                "payload": {"action": "eval"},
                "labels": ["exp-a", "seed-0"],
                "parentRev": parent.to_hex(),
            })))
            .await
            .unwrap();
        let run = gateway
            .task_get(TaskRef {
                task_id: submitted.task_id.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(run.status, TaskStatus::Queued);
        assert!(run.labels.contains("exp-a"));
        assert_eq!(run.labels.len(), 2);
        assert_eq!(run.parent_rev, Some(parent));
    }

    #[tokio::test]
    async fn test_invalid_submit_params() {
        let (_, gateway) = gateway();
        let err = gateway
            .task_submit(submit_params(json!({"pool": " ", "payload": {}})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_from_stranger_refused() {
        let (_, gateway) = gateway();
        let refused = gateway
            .worker_heartbeat(serde_json::from_value(json!({"workerId": "w9", "metrics": {}})).unwrap())
            .await
            .unwrap();
        assert!(!refused.ok);

        let accepted = gateway
            .worker_heartbeat(
                serde_json::from_value(json!({
                    "workerId": "w9", "metrics": {}, "pool": "p", "url": "http://w9/rpc"
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        assert!(accepted.ok);
        let listed = gateway
            .worker_list(ListWorkers {
                pool: Some("p".into()),
            })
            .await
            .unwrap();
        assert_eq!(listed.workers.len(), 1);
        assert_eq!(listed.workers[0].url, "http://w9/rpc");
    }

    #[tokio::test]
    async fn test_finished_for_unknown_task() {
        let (_, gateway) = gateway();
        let ack = gateway
            .work_finished(WorkFinished {
                task_id: "nope".into(),
                status: "success".into(),
                result: None,
            })
            .await
            .unwrap();
        assert!(!ack.ok);
    }

    #[tokio::test]
    async fn test_finished_with_bad_status() {
        let (_, gateway) = gateway();
        let err = gateway
            .work_finished(WorkFinished {
                task_id: "t".into(),
                status: "exploded".into(),
                result: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_finished_with_missing_parent_is_error() {
        let (_, gateway) = gateway();
        let parent = gantry_core::chain::payload_hash(&json!({"ghost": true})).unwrap();
        let submitted = gateway
            .task_submit(submit_params(json!({
                "pool": "p", "payload": {}, "parentRev": parent.to_hex()
            })))
            .await
            .unwrap();
        let err = gateway
            .work_finished(WorkFinished {
                task_id: submitted.task_id.to_string(),
                status: "success".into(),
                result: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Scheduler(SchedulerError::Provenance(ProvenanceError::HashMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_known() {
        let (_, gateway) = gateway();
        assert!(
            !gateway
                .work_cancel(TaskRef {
                    task_id: "missing".into()
                })
                .await
                .unwrap()
                .ok
        );
        let submitted = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {}})))
            .await
            .unwrap();
        assert!(
            gateway
                .work_cancel(TaskRef {
                    task_id: submitted.task_id.to_string()
                })
                .await
                .unwrap()
                .ok
        );
    }

    #[tokio::test]
    async fn test_submit_starts_pool_loop() {
        let (fake, gateway) = gateway();
        let supervisor = Arc::new(Supervisor::new(Arc::clone(gateway.scheduler())));
        let gateway = gateway.with_supervisor(Arc::clone(&supervisor));
        register(gateway.scheduler(), "w1").await;
        gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {"action": "eval"}})))
            .await
            .unwrap();
        assert_eq!(supervisor.pools().await, vec![pool()]);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while fake.started.lock().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "task never dispatched");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        supervisor.shutdown().await;
    }

    async fn dispatched(gateway: &Gateway) -> TaskId {
        let submitted = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {"action": "eval"}})))
            .await
            .unwrap();
        register(gateway.scheduler(), "w1").await;
        gateway.scheduler().step(&pool()).await.unwrap();
        submitted.task_id
    }

    fn finished(task_id: &TaskId, status: &str) -> WorkFinished {
        WorkFinished {
            task_id: task_id.to_string(),
            status: status.into(),
            result: Some(json!({"score": 1})),
        }
    }

    #[tokio::test]
    async fn test_finished_after_cancel_is_refused() {
        let (_, gateway) = gateway();
        let task_id = dispatched(&gateway).await;
        assert!(
            gateway
                .work_cancel(TaskRef {
                    task_id: task_id.to_string()
                })
                .await
                .unwrap()
                .ok
        );

        let ack = gateway.work_finished(finished(&task_id, "success")).await.unwrap();
        assert!(!ack.ok);
        let run = gateway.scheduler().results().get(&task_id).await.unwrap().unwrap();
        assert_eq!(run.status, TaskStatus::Canceled);
        let revisions = gateway.scheduler().provenance().revisions_for_task(&task_id).await.unwrap();
        let history = gateway
            .scheduler()
            .provenance()
            .status_history(&revisions[0].rev_hash)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_finished_is_refused() {
        let (_, gateway) = gateway();
        let task_id = dispatched(&gateway).await;
        assert!(gateway.work_finished(finished(&task_id, "success")).await.unwrap().ok);
        assert!(!gateway.work_finished(finished(&task_id, "success")).await.unwrap().ok);
        assert!(!gateway.work_finished(finished(&task_id, "failed")).await.unwrap().ok);
        let run = gateway.scheduler().results().get(&task_id).await.unwrap().unwrap();
        assert_eq!(run.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_patch_task() {
        let (_, gateway) = gateway();
        let submitted = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {"n": 1}, "labels": ["a"]})))
            .await
            .unwrap();
        let params: PatchTask = serde_json::from_value(json!({
            "taskId": submitted.task_id.to_string(),
            "changes": {"labels": ["b"], "payload": {"n": 2}, "priority": 9},
        }))
        .unwrap();
        let run = gateway.task_patch(params).await.unwrap();
        assert_eq!(run.labels, BTreeSet::from(["b".to_string()]));
        assert_eq!(run.payload.get("n"), Some(&json!(2)));

        let err = gateway
            .task_patch(PatchTask {
                task_id: "ghost".into(),
                changes: TaskChanges::default(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::TaskNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn test_pool_create_starts_loop() {
        let (_, gateway) = gateway();
        let supervisor = Arc::new(Supervisor::new(Arc::clone(gateway.scheduler())));
        let gateway = gateway.with_supervisor(Arc::clone(&supervisor));
        let created = gateway
            .pool_create(PoolRef {
                name: "fresh".into(),
            })
            .await
            .unwrap();
        assert_eq!(created.name, "fresh");
        assert_eq!(supervisor.pools().await, vec![PoolName::parse("fresh").unwrap()]);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_list_tasks_in_arrival_order() {
        let (_, gateway) = gateway();
        let first = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {}})))
            .await
            .unwrap();
        let second = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {}})))
            .await
            .unwrap();
        let listed = gateway
            .pool_list_tasks(ListPoolTasks {
                pool_name: "p".into(),
                status: None,
            })
            .await
            .unwrap();
        let ids: Vec<_> = listed.into_iter().map(|run| run.task_id).collect();
        assert_eq!(ids, vec![first.task_id, second.task_id]);

        let err = gateway
            .pool_list_tasks(ListPoolTasks {
                pool_name: "p".into(),
                status: Some("exploded".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_label_controls() {
        let (_, gateway) = gateway();
        let paused = gateway
            .label_pause(LabelRef {
                label: "nightly".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            paused,
            LabelPaused {
                label: "nightly".into(),
                paused: true
            }
        );
        let resumed = gateway
            .label_resume(LabelRef {
                label: "nightly".into(),
            })
            .await
            .unwrap();
        assert!(!resumed.paused);

        let updated = gateway
            .label_update(serde_json::from_value(json!({"label": "nightly", "meta": {"rate": 4.0}})).unwrap())
            .await
            .unwrap();
        assert_eq!(updated.meta.rate, Some(4.0));
        let err = gateway
            .label_update(serde_json::from_value(json!({"label": "nightly", "meta": {"rate": 0.0}})).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));

        gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {}, "labels": ["nightly"]})))
            .await
            .unwrap();
        gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {}})))
            .await
            .unwrap();
        let cancelled = gateway
            .label_cancel(LabelRef {
                label: "nightly".into(),
            })
            .await
            .unwrap();
        assert_eq!(cancelled.cancelled, 1);
    }

    #[tokio::test]
    async fn test_submit_publishes_event() {
        let (_, gateway) = gateway();
        let mut events = gateway.subscribe();
        let submitted = gateway
            .task_submit(submit_params(json!({"pool": "p", "payload": {}})))
            .await
            .unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.data.task_id, submitted.task_id);
        assert_eq!(event.data.status, TaskStatus::Queued);
        assert_eq!(event.source, "pool/p");
    }
}
