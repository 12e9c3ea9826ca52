//! The task model shared by the gateway, queue and workers.

use crate::error::CoreError;
use crate::hash::Digest;
use crate::id::{PoolName, TaskId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Payload key naming the worker handler a task needs
pub const ACTION_KEY: &str = "action";

/// Payload key carrying a task's fan-out children in its result
pub const CHILDREN_KEY: &str = "children";

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet handed to the queue
    Waiting,
    /// In the pool's ready list or in flight without a worker
    Queued,
    /// Dispatched to a worker
    Running,
    /// Worker reported success
    Success,
    /// Worker reported failure, or provenance rejected the result
    Failed,
    /// Canceled by a client
    Canceled,
    /// Reclaimed more often than the retry budget allows
    DeadLetter,
}

impl TaskStatus {
    /// All statuses in lifecycle order
    pub const ALL: [TaskStatus; 7] = [
        Self::Waiting,
        Self::Queued,
        Self::Running,
        Self::Success,
        Self::Failed,
        Self::Canceled,
        Self::DeadLetter,
    ];

    /// Statuses a task can still leave
    pub const ACTIVE: [TaskStatus; 3] = [Self::Waiting, Self::Queued, Self::Running];

    /// Wire name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::DeadLetter
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::InvalidStatus {
                status: s.to_string(),
            })
    }
}

/// A unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task id
    pub id: TaskId,
    /// Pool the task is routed to
    pub pool: PoolName,
    /// Opaque payload mapping
    pub payload: Map<String, Value>,
    /// Current status
    pub status: TaskStatus,
    /// Creation time
    pub created_at: Timestamp,
    /// Labels that group tasks for pausing, deadlines and rate limits
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Revision this task derives from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_rev: Option<Digest>,
}

impl Task {
    /// Create a waiting task with a fresh id
    #[must_use]
    pub fn new(pool: PoolName, payload: Map<String, Value>) -> Self {
        Self {
            id: TaskId::generate(),
            pool,
            payload,
            status: TaskStatus::Waiting,
            created_at: Timestamp::now(),
            labels: BTreeSet::new(),
            parent_rev: None,
        }
    }

    /// Set the task id
    #[must_use]
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Set the parent revision
    #[must_use]
    pub fn with_parent_rev(mut self, parent: Digest) -> Self {
        self.parent_rev = Some(parent);
        self
    }

    /// Add a label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Set the creation time
    #[must_use]
    pub fn with_created_at(mut self, at: Timestamp) -> Self {
        self.created_at = at;
        self
    }

    /// Handler a worker must advertise to run this task
    ///
    /// `None` means any worker in the pool can take it.
    #[must_use]
    pub fn required_handler(&self) -> Option<&str> {
        self.payload.get(ACTION_KEY).and_then(Value::as_str)
    }
}
