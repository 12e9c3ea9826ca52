//! Per-pool scheduling.
//!
//! A pool loop dequeues one task at a time, picks a live worker that can
//! run it and dispatches it. The task stays in flight until the worker
//! reports back through [`Scheduler::complete`]; if the worker never does,
//! the sweeper reclaims it as an orphan and it is dispatched again, up to
//! `max_retries` times.
//!
//! Every status change goes through [`ResultBackend::transition`], so a
//! run that reached a terminal status is never rewritten by a late report,
//! a sweep or a failed dispatch.

use crate::events::{EVENT_CAPACITY, TaskEvent};
use crate::labels::{Admission, LabelBook};
use crate::remote::Dispatcher;
use gantry_core::{Digest, PoolName, TaskId, TaskStatus, Timestamp, WorkerId};
use gantry_provenance::{CompletionBatch, ProvenanceError, ProvenanceStore};
use gantry_queue::{AckOutcome, Delivery, Queue, QueueError, Reclaimed, WorkerRegistry};
use gantry_storage::{ResultBackend, RunUpdate, StorageError, TaskRun, Transition};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long one dequeue waits before the loop checks for shutdown
    pub dequeue_timeout: Duration,
    /// Pause after a task found no worker
    pub no_worker_backoff: Duration,
    /// Pause after a label held a task back
    pub hold_backoff: Duration,
    /// Dispatch request timeout
    pub dispatch_timeout: Duration,
    /// In-flight age after which a task counts as orphaned
    pub orphan_idle: Duration,
    /// Period of the orphan and stale-worker sweep
    pub sweep_interval: Duration,
    /// Reclaims tolerated before a task is dead-lettered
    pub max_retries: u32,
    /// Heartbeat age after which a worker is pruned
    pub worker_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_millis(500),
            no_worker_backoff: Duration::from_secs(5),
            hold_backoff: Duration::from_millis(100),
            dispatch_timeout: Duration::from_secs(10),
            orphan_idle: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            max_retries: 3,
            worker_ttl: gantry_queue::DEFAULT_WORKER_TTL,
        }
    }
}

impl SchedulerConfig {
    /// Set the dequeue timeout
    #[must_use]
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Set the no-worker backoff
    #[must_use]
    pub fn with_no_worker_backoff(mut self, backoff: Duration) -> Self {
        self.no_worker_backoff = backoff;
        self
    }

    /// Set the label hold backoff
    #[must_use]
    pub fn with_hold_backoff(mut self, backoff: Duration) -> Self {
        self.hold_backoff = backoff;
        self
    }

    /// Set the dispatch timeout
    #[must_use]
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Set the orphan idle threshold
    #[must_use]
    pub fn with_orphan_idle(mut self, idle: Duration) -> Self {
        self.orphan_idle = idle;
        self
    }

    /// Set the sweep interval
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the retry limit
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the worker TTL
    #[must_use]
    pub fn with_worker_ttl(mut self, ttl: Duration) -> Self {
        self.worker_ttl = ttl;
        self
    }
}

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    /// Queue or registry failure
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Result backend failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Provenance failure
    #[error("Provenance error: {0}")]
    Provenance(#[from] ProvenanceError),

    /// No run is recorded for the task
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// The run already reached a terminal status
    #[error("Task {task_id} already settled as {status}")]
    AlreadySettled {
        /// Task
        task_id: TaskId,
        /// Status it settled with
        status: TaskStatus,
    },

    /// The payload cannot change once the task has been dispatched
    #[error("Task {task_id} is {status}; its payload can no longer change")]
    PayloadLocked {
        /// Task
        task_id: TaskId,
        /// Current status
        status: TaskStatus,
    },
}

/// Scheduler result type
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Where a pool loop is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting on the queue
    Idle,
    /// Choosing a worker and posting the task
    Dispatching,
    /// The worker accepted; waiting for `Work.finished`
    AwaitingResult,
    /// The post failed; the task waits for orphan recovery
    DispatchFailed,
}

/// What one loop iteration did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing arrived before the dequeue timeout
    Idle,
    /// The task already reached a terminal status and was acked
    Skipped(TaskId),
    /// Too many reclaims
    DeadLettered(TaskId),
    /// No live worker can run the task; it went back to the ready list
    NoWorker(TaskId),
    /// A paused or rate-limited label held the task; it went back to the
    /// ready list
    Held {
        /// Task
        task_id: TaskId,
        /// Label that objected
        label: String,
    },
    /// A label's deadline passed and the task was canceled
    Expired {
        /// Task
        task_id: TaskId,
        /// Label whose deadline passed
        label: String,
    },
    /// The worker accepted the task
    Dispatched {
        /// Task
        task_id: TaskId,
        /// Worker
        worker_id: WorkerId,
    },
    /// The worker could not be reached and was evicted
    DispatchFailed {
        /// Task
        task_id: TaskId,
        /// Evicted worker
        worker_id: WorkerId,
    },
}

impl StepOutcome {
    /// Loop state after this step
    #[must_use]
    pub fn state(&self) -> LoopState {
        match self {
            Self::Idle
            | Self::Skipped(_)
            | Self::DeadLettered(_)
            | Self::NoWorker(_)
            | Self::Held { .. }
            | Self::Expired { .. } => LoopState::Idle,
            Self::Dispatched { .. } => LoopState::AwaitingResult,
            Self::DispatchFailed { .. } => LoopState::DispatchFailed,
        }
    }
}

/// A task that reached a status and was recorded
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Stored run
    pub run: TaskRun,
    /// Revision the status was logged against
    pub rev_hash: Digest,
    /// Fan-out root when the result carried children
    pub fanout_root: Option<Digest>,
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orphans put back on their ready lists
    pub reclaimed: Vec<Reclaimed>,
    /// Workers dropped for missing heartbeats
    pub pruned: Vec<WorkerId>,
}

/// Changes `Task.patch` may make
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    /// Replacement labels
    pub labels: Option<BTreeSet<String>>,
    /// Replacement payload; only before dispatch
    pub payload: Option<Map<String, Value>>,
}

/// Moves tasks from queues to workers and records how they end
pub struct Scheduler {
    queue: Arc<dyn Queue>,
    registry: Arc<dyn WorkerRegistry>,
    results: Arc<dyn ResultBackend>,
    provenance: Arc<dyn ProvenanceStore>,
    dispatcher: Arc<dyn Dispatcher>,
    labels: LabelBook,
    events: broadcast::Sender<TaskEvent>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler over the given backends
    #[must_use]
    pub fn new(
        queue: Arc<dyn Queue>,
        registry: Arc<dyn WorkerRegistry>,
        results: Arc<dyn ResultBackend>,
        provenance: Arc<dyn ProvenanceStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            queue,
            registry,
            results,
            provenance,
            dispatcher,
            labels: LabelBook::new(),
            events: broadcast::channel(EVENT_CAPACITY).0,
            config: SchedulerConfig::default(),
        }
    }

    /// Replace the configuration
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Task queue
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// Worker registry
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn WorkerRegistry> {
        &self.registry
    }

    /// Result backend
    #[must_use]
    pub fn results(&self) -> &Arc<dyn ResultBackend> {
        &self.results
    }

    /// Provenance store
    #[must_use]
    pub fn provenance(&self) -> &Arc<dyn ProvenanceStore> {
        &self.provenance
    }

    /// Label settings
    #[must_use]
    pub fn labels(&self) -> &LabelBook {
        &self.labels
    }

    /// Receive an event for every run change from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Announce the current state of `run`
    pub fn publish(&self, run: &TaskRun) {
        // No subscribers is not an error.
        let _ = self.events.send(TaskEvent::update(run));
    }

    /// Run one iteration for `pool`
    ///
    /// # Errors
    ///
    /// Returns error if a backend fails
    pub async fn step(&self, pool: &PoolName) -> SchedulerResult<StepOutcome> {
        match self.queue.dequeue(pool, self.config.dequeue_timeout).await? {
            Some(delivery) => self.dispatch(pool, delivery).await,
            None => Ok(StepOutcome::Idle),
        }
    }

    /// Loop over `pool` until `cancel` fires
    ///
    /// Cancellation is only observed while waiting on the queue or backing
    /// off; a dispatch in progress always finishes.
    pub async fn run_pool(&self, pool: PoolName, cancel: CancellationToken) {
        tracing::info!(pool = %pool, "Pool loop started");
        loop {
            let dequeued = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                dequeued = self.queue.dequeue(&pool, self.config.dequeue_timeout) => dequeued,
            };
            let backoff = match dequeued {
                Ok(None) => continue,
                Ok(Some(delivery)) => match self.dispatch(&pool, delivery).await {
                    Ok(outcome) => {
                        tracing::trace!(pool = %pool, state = ?outcome.state(), "Step");
                        match outcome {
                            StepOutcome::NoWorker(_) => Some(self.config.no_worker_backoff),
                            StepOutcome::Held { .. } => Some(self.config.hold_backoff),
                            _ => None,
                        }
                    }
                    Err(err) => {
                        tracing::error!(pool = %pool, error = %err, "Dispatch iteration failed");
                        None
                    }
                },
                Err(err) => {
                    tracing::error!(pool = %pool, error = %err, "Dequeue failed");
                    Some(self.config.dequeue_timeout)
                }
            };
            if let Some(pause) = backoff {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(pause) => {}
                }
            }
        }
        tracing::info!(pool = %pool, "Pool loop stopped");
    }

    /// Hand a delivered task to a worker
    ///
    /// The task is rebuilt from its stored run, so labels and payload
    /// patched after submission take effect.
    ///
    /// # Errors
    ///
    /// Returns error if a backend fails
    pub async fn dispatch(&self, pool: &PoolName, delivery: Delivery) -> SchedulerResult<StepOutcome> {
        let Delivery { task, attempts, .. } = delivery;
        tracing::trace!(pool = %pool, task_id = %task.id, attempts, state = ?LoopState::Dispatching, "Step");
        let run = match self.results.get(&task.id).await? {
            Some(run) => run,
            None => self.results.store(TaskRun::from_task(&task)).await?,
        };

        if run.status.is_terminal() {
            tracing::debug!(pool = %pool, task_id = %task.id, status = %run.status, "Skipping settled task");
            self.ack(pool, &task.id).await?;
            return Ok(StepOutcome::Skipped(task.id));
        }
        let task = run.to_task();

        if attempts > self.config.max_retries {
            tracing::error!(pool = %pool, task_id = %task.id, attempts, "Task dead-lettered");
            let error = format!("gave up after {} reclaims", attempts);
            let settled = self
                .finish(
                    &task.id,
                    TaskStatus::DeadLetter,
                    Box::new(move |run| run.with_attempts(attempts).with_error(error)),
                )
                .await;
            return settled_as(settled, StepOutcome::DeadLettered(task.id.clone()), task.id);
        }

        match self.labels.admit(&task.labels, Timestamp::now()).await {
            Admission::Admit => {}
            Admission::Hold(label) => {
                tracing::debug!(pool = %pool, task_id = %task.id, label = %label, "Held by label");
                self.queue.release(pool, &task.id).await?;
                return Ok(StepOutcome::Held {
                    task_id: task.id,
                    label,
                });
            }
            Admission::Expire(label) => {
                tracing::info!(pool = %pool, task_id = %task.id, label = %label, "Label deadline passed, canceling task");
                let error = format!("label {} passed its deadline", label);
                let settled = self
                    .finish(
                        &task.id,
                        TaskStatus::Canceled,
                        Box::new(move |run| run.with_error(error)),
                    )
                    .await;
                let expired = StepOutcome::Expired {
                    task_id: task.id.clone(),
                    label,
                };
                return settled_as(settled, expired, task.id);
            }
        }

        let action = task.required_handler();
        let worker = self
            .registry
            .list(Some(pool))
            .await?
            .into_iter()
            .find(|w| w.handles(action));
        let Some(worker) = worker else {
            tracing::info!(pool = %pool, task_id = %task.id, action = ?action, "No live worker, releasing task");
            self.queue.release(pool, &task.id).await?;
            return Ok(StepOutcome::NoWorker(task.id));
        };

        let worker_id = worker.worker_id.clone();
        let assigned = worker_id.clone();
        let claimed = self
            .results
            .transition(
                &task.id,
                &TaskStatus::ACTIVE,
                Box::new(move |run| {
                    run.with_attempts(attempts)
                        .with_worker(assigned)
                        .with_status(TaskStatus::Running)
                }),
            )
            .await?;
        match claimed {
            Transition::Applied { run, .. } => self.publish(&run),
            Transition::Refused(run) => {
                tracing::debug!(pool = %pool, task_id = %task.id, status = %run.status, "Settled before dispatch");
                self.ack(pool, &task.id).await?;
                return Ok(StepOutcome::Skipped(task.id));
            }
            Transition::Missing => return Err(SchedulerError::UnknownTask(task.id)),
        }

        match self.dispatcher.start(&worker, &task).await {
            Ok(()) => {
                self.labels.record_dispatch(&task.labels, Timestamp::now()).await;
                tracing::info!(pool = %pool, task_id = %task.id, worker_id = %worker_id, url = %worker.url, "Dispatched");
                Ok(StepOutcome::Dispatched {
                    task_id: task.id,
                    worker_id,
                })
            }
            Err(err) => {
                tracing::warn!(pool = %pool, task_id = %task.id, worker_id = %worker_id, error = %err, "Dispatch failed, evicting worker");
                self.registry.remove(&worker_id).await?;
                let evicted = worker_id.clone();
                let reverted = self
                    .results
                    .transition(
                        &task.id,
                        &[TaskStatus::Running],
                        Box::new(move |run| {
                            if run.worker_id.as_ref() == Some(&evicted) {
                                run.with_status(TaskStatus::Queued)
                            } else {
                                run
                            }
                        }),
                    )
                    .await?;
                if let Transition::Applied { run, .. } = reverted {
                    if run.status == TaskStatus::Queued {
                        self.publish(&run);
                    }
                }
                Ok(StepOutcome::DispatchFailed {
                    task_id: task.id,
                    worker_id,
                })
            }
        }
    }

    /// Record a status reported by a worker
    ///
    /// A terminal status is claimed on the run first, then the task's
    /// provenance rows are committed and the queue entry is acked. A report
    /// for a run that is already terminal only acks the entry.
    ///
    /// # Errors
    ///
    /// `UnknownTask` if no run exists, `AlreadySettled` if the run is
    /// terminal. A provenance violation marks the run failed, acks it and
    /// is returned as `Provenance`.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        result: Option<Value>,
    ) -> SchedulerResult<Completion> {
        self.finish(task_id, status, Box::new(move |run| run.with_result(result)))
            .await
    }

    /// Cancel a task
    ///
    /// Returns `false` if the task is unknown or already settled. The worker
    /// running it, if any, is told to stop on a best-effort basis.
    ///
    /// # Errors
    ///
    /// Returns error if a backend fails
    pub async fn cancel(&self, task_id: &TaskId) -> SchedulerResult<bool> {
        let done = match self.finish(task_id, TaskStatus::Canceled, Box::new(|run| run)).await {
            Ok(done) => done,
            Err(SchedulerError::UnknownTask(_) | SchedulerError::AlreadySettled { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };

        if let Some(worker_id) = &done.run.worker_id {
            if let Some(worker) = self.registry.get(worker_id).await? {
                if let Err(err) = self.dispatcher.cancel(&worker, task_id).await {
                    tracing::warn!(task_id = %task_id, worker_id = %worker_id, error = %err, "Cancel not delivered");
                }
            }
        }
        tracing::info!(task_id = %task_id, "Task canceled");
        Ok(true)
    }

    /// Cancel every undispatched task carrying `label`
    ///
    /// Returns how many were canceled.
    ///
    /// # Errors
    ///
    /// Returns error if a backend fails
    pub async fn cancel_label(&self, label: &str) -> SchedulerResult<usize> {
        let mut canceled = 0;
        for status in [TaskStatus::Waiting, TaskStatus::Queued] {
            for run in self.results.list(None, Some(status)).await? {
                if run.labels.contains(label) && self.cancel(&run.task_id).await? {
                    canceled += 1;
                }
            }
        }
        tracing::info!(label = %label, canceled, "Label canceled");
        Ok(canceled)
    }

    /// Change a task's labels or, before dispatch, its payload
    ///
    /// # Errors
    ///
    /// `UnknownTask` if no run exists, `PayloadLocked` for a payload change
    /// once the task left the queue
    pub async fn patch(&self, task_id: &TaskId, patch: TaskPatch) -> SchedulerResult<TaskRun> {
        let TaskPatch { labels, payload } = patch;
        let from: &[TaskStatus] = if payload.is_some() {
            &[TaskStatus::Waiting, TaskStatus::Queued]
        } else {
            &TaskStatus::ALL
        };
        let outcome = self
            .results
            .transition(
                task_id,
                from,
                Box::new(move |mut run| {
                    if let Some(labels) = labels {
                        run = run.with_labels(labels);
                    }
                    if let Some(payload) = payload {
                        run = run.with_payload(payload);
                    }
                    run
                }),
            )
            .await?;
        match outcome {
            Transition::Applied { run, .. } => {
                self.publish(&run);
                tracing::info!(task_id = %task_id, "Task patched");
                Ok(run)
            }
            Transition::Refused(run) => Err(SchedulerError::PayloadLocked {
                task_id: task_id.clone(),
                status: run.status,
            }),
            Transition::Missing => Err(SchedulerError::UnknownTask(task_id.clone())),
        }
    }

    /// Requeue orphans and prune stale workers once
    ///
    /// # Errors
    ///
    /// Returns error if a backend fails
    pub async fn sweep(&self) -> SchedulerResult<SweepReport> {
        let reclaimed = self.queue.requeue_orphans(self.config.orphan_idle).await?;
        self.requeue_runs(&reclaimed).await?;
        let pruned = self.registry.prune_stale(self.config.worker_ttl).await?;
        if !reclaimed.is_empty() || !pruned.is_empty() {
            tracing::info!(reclaimed = reclaimed.len(), pruned = pruned.len(), "Sweep");
        }
        Ok(SweepReport { reclaimed, pruned })
    }

    async fn requeue_runs(&self, reclaimed: &[Reclaimed]) -> SchedulerResult<()> {
        for orphan in reclaimed {
            let attempts = orphan.attempts;
            let outcome = self
                .results
                .transition(
                    &orphan.task_id,
                    &TaskStatus::ACTIVE,
                    Box::new(move |run| run.with_attempts(attempts).with_status(TaskStatus::Queued)),
                )
                .await?;
            match outcome {
                Transition::Applied { run, .. } => self.publish(&run),
                Transition::Refused(run) => {
                    tracing::debug!(task_id = %orphan.task_id, status = %run.status, "Reclaimed entry already settled");
                }
                Transition::Missing => {}
            }
        }
        Ok(())
    }

    /// Sweep every `sweep_interval` until `cancel` fires
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(error = %err, "Sweep failed");
                    }
                }
            }
        }
    }

    async fn ack(&self, pool: &PoolName, task_id: &TaskId) -> SchedulerResult<()> {
        if self.queue.ack(pool, task_id).await? == AckOutcome::AlreadySettled {
            tracing::debug!(pool = %pool, task_id = %task_id, "Entry already settled");
        }
        Ok(())
    }

    async fn finish(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        update: RunUpdate,
    ) -> SchedulerResult<Completion> {
        let claimed = self
            .results
            .transition(
                task_id,
                &TaskStatus::ACTIVE,
                Box::new(move |run| update(run).with_status(status)),
            )
            .await?;
        let (previous, run) = match claimed {
            Transition::Applied { previous, run } => (previous, run),
            Transition::Refused(run) => {
                tracing::warn!(task_id = %task_id, settled = %run.status, reported = %status, "Task already settled");
                self.ack(&run.pool, task_id).await?;
                return Err(SchedulerError::AlreadySettled {
                    task_id: task_id.clone(),
                    status: run.status,
                });
            }
            Transition::Missing => return Err(SchedulerError::UnknownTask(task_id.clone())),
        };
        let task = run.to_task();

        if !status.is_terminal() {
            self.publish(&run);
            let rev_hash = CompletionBatch::build(&task, status, Timestamp::now(), None)?.rev_hash;
            return Ok(Completion {
                run,
                rev_hash,
                fanout_root: None,
            });
        }

        let recorded = match CompletionBatch::build(&task, status, Timestamp::now(), run.result.as_ref()) {
            Ok(done) => {
                let committed = self.provenance.commit(&done.batch).await;
                committed.map(|_| done)
            }
            Err(err) => Err(err),
        };

        match recorded {
            Ok(done) => {
                self.ack(&task.pool, &task.id).await?;
                self.publish(&run);
                tracing::info!(pool = %task.pool, task_id = %task.id, status = %status, rev_hash = %done.rev_hash.short(), "Task settled");
                Ok(Completion {
                    run,
                    rev_hash: done.rev_hash,
                    fanout_root: done.fanout_root,
                })
            }
            Err(err @ ProvenanceError::Storage(_)) => {
                // Undo the claim so a redelivery can settle the task again.
                self.results
                    .transition(task_id, &[status], Box::new(move |_| previous))
                    .await?;
                Err(err.into())
            }
            Err(err) => {
                tracing::error!(pool = %task.pool, task_id = %task.id, error = %err, "Provenance rejected, failing task");
                let message = err.to_string();
                let failed = self
                    .results
                    .transition(
                        task_id,
                        &[status],
                        Box::new(move |run| run.with_status(TaskStatus::Failed).with_error(message)),
                    )
                    .await?;
                if let Transition::Applied { run, .. } = failed {
                    self.publish(&run);
                }
                self.ack(&task.pool, &task.id).await?;
                Err(err.into())
            }
        }
    }
}

// A dead-letter or expiry that lost the race to another settlement is a skip.
fn settled_as(
    settled: SchedulerResult<Completion>,
    outcome: StepOutcome,
    task_id: TaskId,
) -> SchedulerResult<StepOutcome> {
    match settled {
        Ok(_) => Ok(outcome),
        Err(SchedulerError::AlreadySettled { .. }) => Ok(StepOutcome::Skipped(task_id)),
        Err(err) => Err(err),
    }
}
