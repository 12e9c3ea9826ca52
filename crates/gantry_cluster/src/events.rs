//! Task update events.
//!
//! Every change the gateway or scheduler makes to a run is announced as a
//! CloudEvents-shaped record on a broadcast channel. Slow subscribers lose
//! the oldest events rather than holding up the scheduler.

use gantry_core::Timestamp;
use gantry_storage::TaskRun;
use serde::Serialize;

/// `type` of every task update
pub const TASK_UPDATE: &str = "gantry.task.update";

/// Events buffered per subscriber before the oldest are dropped
pub const EVENT_CAPACITY: usize = 1024;

/// A run changed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    /// CloudEvents version
    pub specversion: &'static str,
    /// Event type
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// `pool/<name>`
    pub source: String,
    /// `task/<id>`
    pub subject: String,
    /// When the event was raised
    pub time: Timestamp,
    /// The run after the change
    pub data: TaskRun,
}

impl TaskEvent {
    /// Event announcing the current state of `run`
    #[must_use]
    pub fn update(run: &TaskRun) -> Self {
        Self {
            specversion: "1.0",
            kind: TASK_UPDATE,
            source: format!("pool/{}", run.pool),
            subject: format!("task/{}", run.task_id),
            time: Timestamp::now(),
            data: run.clone(),
        }
    }
}
