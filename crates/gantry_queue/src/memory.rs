//! In-process queue.
//!
//! Every pool is a separate lane with its own lock, so unrelated pools never
//! contend. Waiting dequeuers park on the lane's `Notify`.

use crate::entry::QueueEntry;
use crate::error::QueueResult;
use crate::queue::{AckOutcome, Delivery, Queue, Reclaimed};
use async_trait::async_trait;
use gantry_core::{PoolName, Task, TaskId, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

#[derive(Debug)]
struct InFlight {
    entry: QueueEntry,
    since: Instant,
}

#[derive(Debug, Default)]
struct LaneState {
    ready: VecDeque<QueueEntry>,
    in_flight: HashMap<TaskId, InFlight>,
}

#[derive(Debug, Default)]
struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

impl Lane {
    async fn push(&self, entry: QueueEntry) {
        self.state.lock().await.ready.push_back(entry);
        self.notify.notify_waiters();
    }

    async fn try_pop(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        let entry = state.ready.pop_front()?;
        let delivery = Delivery {
            task: entry.task.clone(),
            attempts: entry.attempts,
            delivered_at: Timestamp::now(),
        };
        state.in_flight.insert(
            entry.task_id().clone(),
            InFlight {
                entry,
                since: Instant::now(),
            },
        );
        Some(delivery)
    }
}

/// Queue held in process memory
#[derive(Debug, Default)]
pub struct MemoryQueue {
    lanes: RwLock<HashMap<PoolName, Arc<Lane>>>,
}

impl MemoryQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn lane(&self, pool: &PoolName) -> Arc<Lane> {
        if let Some(lane) = self.lanes.read().await.get(pool) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write().await;
        Arc::clone(lanes.entry(pool.clone()).or_default())
    }

    async fn all_lanes(&self) -> Vec<(PoolName, Arc<Lane>)> {
        self.lanes
            .read()
            .await
            .iter()
            .map(|(pool, lane)| (pool.clone(), Arc::clone(lane)))
            .collect()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, pool: &PoolName, task: Task) -> QueueResult<()> {
        tracing::debug!(pool = %pool, task_id = %task.id, "Enqueue");
        self.lane(pool).await.push(QueueEntry::new(task)).await;
        Ok(())
    }

    async fn dequeue(&self, pool: &PoolName, timeout: Duration) -> QueueResult<Option<Delivery>> {
        let lane = self.lane(pool).await;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = lane.try_pop().await {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, pool: &PoolName, task_id: &TaskId) -> QueueResult<AckOutcome> {
        let lane = self.lane(pool).await;
        let removed = lane.state.lock().await.in_flight.remove(task_id);
        Ok(match removed {
            Some(_) => AckOutcome::Acked,
            None => AckOutcome::AlreadySettled,
        })
    }

    async fn release(&self, pool: &PoolName, task_id: &TaskId) -> QueueResult<AckOutcome> {
        let lane = self.lane(pool).await;
        let removed = lane.state.lock().await.in_flight.remove(task_id);
        match removed {
            Some(flight) => {
                lane.push(flight.entry).await;
                Ok(AckOutcome::Acked)
            }
            None => Ok(AckOutcome::AlreadySettled),
        }
    }

    async fn requeue_orphans(&self, idle: Duration) -> QueueResult<Vec<Reclaimed>> {
        let mut reclaimed = Vec::new();
        for (pool, lane) in self.all_lanes().await {
            let mut orphans = Vec::new();
            {
                let mut state = lane.state.lock().await;
                let stale: Vec<TaskId> = state
                    .in_flight
                    .iter()
                    .filter(|(_, flight)| flight.since.elapsed() >= idle)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in stale {
                    if let Some(flight) = state.in_flight.remove(&id) {
                        let mut entry = flight.entry;
                        entry.attempts += 1;
                        entry.enqueued_at = Timestamp::now();
                        reclaimed.push(Reclaimed {
                            pool: pool.clone(),
                            task_id: id,
                            attempts: entry.attempts,
                        });
                        orphans.push(entry);
                    }
                }
            }
            for entry in orphans {
                lane.push(entry).await;
            }
        }
        Ok(reclaimed)
    }

    async fn pending(&self, pool: &PoolName) -> QueueResult<usize> {
        let Some(lane) = self.lanes.read().await.get(pool).cloned() else {
            return Ok(0);
        };
        let state = lane.state.lock().await;
        Ok(state.ready.len() + state.in_flight.len())
    }

    async fn pools(&self) -> QueueResult<Vec<PoolName>> {
        let mut pools: Vec<PoolName> = self.lanes.read().await.keys().cloned().collect();
        pools.sort();
        Ok(pools)
    }
}
