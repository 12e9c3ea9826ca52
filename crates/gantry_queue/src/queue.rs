//! The queue contract.
//!
//! Each pool has a FIFO of ready tasks and an in-flight set (the PEL).
//! Delivery is at-least-once: a dequeued task stays in flight until it is
//! acked, released, or reclaimed as an orphan.

use crate::error::QueueResult;
use async_trait::async_trait;
use gantry_core::{PoolName, Task, TaskId, Timestamp};
use std::time::Duration;

/// A task handed to a dequeuer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The task
    pub task: Task,
    /// Orphan reclaims before this delivery
    pub attempts: u32,
    /// When it was dequeued
    pub delivered_at: Timestamp,
}

/// Result of an ack or release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The entry was in flight and has been settled
    Acked,
    /// The entry was not in flight; someone else settled it first
    AlreadySettled,
}

/// An orphan moved back to the ready list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    /// Pool of the task
    pub pool: PoolName,
    /// The task
    pub task_id: TaskId,
    /// Reclaim count after this reclaim
    pub attempts: u32,
}

/// Per-pool task queue with explicit acknowledgement
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a task to the pool's ready list
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be written
    async fn enqueue(&self, pool: &PoolName, task: Task) -> QueueResult<()>;

    /// Wait up to `timeout` for a ready task and move it in flight
    ///
    /// Returns `None` on timeout. Dropping the future before it resolves
    /// never loses a task.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or an entry cannot be decoded
    async fn dequeue(&self, pool: &PoolName, timeout: Duration) -> QueueResult<Option<Delivery>>;

    /// Remove an in-flight task for good
    async fn ack(&self, pool: &PoolName, task_id: &TaskId) -> QueueResult<AckOutcome>;

    /// Put an in-flight task back on the ready list without counting a reclaim
    async fn release(&self, pool: &PoolName, task_id: &TaskId) -> QueueResult<AckOutcome>;

    /// Move every task in flight for at least `idle` back to ready, counting
    /// one more attempt
    async fn requeue_orphans(&self, idle: Duration) -> QueueResult<Vec<Reclaimed>>;

    /// Ready plus in-flight tasks in a pool
    async fn pending(&self, pool: &PoolName) -> QueueResult<usize>;

    /// Every pool that has seen an enqueue, sorted
    async fn pools(&self) -> QueueResult<Vec<PoolName>>;
}
