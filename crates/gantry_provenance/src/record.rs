//! Provenance rows.
//!
//! Every row carries its own digest; constructors compute it through
//! `gantry_core::chain` and `verify` recomputes it.

use gantry_core::chain;
use gantry_core::{Digest, TaskId, TaskStatus, Timestamp};
use serde::{Deserialize, Serialize};

/// One revision of a task's payload, chained onto its parent revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRevision {
    /// `revision_hash(parent_hash, payload_hash)`
    pub rev_hash: Digest,
    /// Task that produced the revision
    pub task_id: TaskId,
    /// Parent revision, `None` for roots
    pub parent_hash: Option<Digest>,
    /// Canonical payload digest
    pub payload_hash: Digest,
}

impl TaskRevision {
    /// Create a revision
    #[must_use]
    pub fn new(task_id: TaskId, parent_hash: Option<Digest>, payload_hash: Digest) -> Self {
        Self {
            rev_hash: chain::revision_hash(parent_hash.as_ref(), &payload_hash),
            task_id,
            parent_hash,
            payload_hash,
        }
    }

    /// Whether `rev_hash` matches the other columns
    #[must_use]
    pub fn verify(&self) -> bool {
        self.rev_hash == chain::revision_hash(self.parent_hash.as_ref(), &self.payload_hash)
    }
}

/// A derivation edge between a parent revision and a child payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtefactLineage {
    /// Edge digest
    pub edge_hash: Digest,
    /// Parent revision
    pub parent_hash: Digest,
    /// Child payload digest
    pub child_hash: Digest,
    /// Operator that derived the child
    pub operator_id: String,
    /// Optional branch label
    pub branch_tag: Option<String>,
}

impl ArtefactLineage {
    /// Create an edge
    #[must_use]
    pub fn new(
        parent_hash: Digest,
        child_hash: Digest,
        operator_id: impl Into<String>,
        branch_tag: Option<String>,
    ) -> Self {
        let operator_id = operator_id.into();
        Self {
            edge_hash: chain::edge_hash(
                &parent_hash,
                &child_hash,
                &operator_id,
                branch_tag.as_deref(),
            ),
            parent_hash,
            child_hash,
            operator_id,
            branch_tag,
        }
    }

    /// Whether `edge_hash` matches the other columns
    #[must_use]
    pub fn verify(&self) -> bool {
        self.edge_hash
            == chain::edge_hash(
                &self.parent_hash,
                &self.child_hash,
                &self.operator_id,
                self.branch_tag.as_deref(),
            )
    }
}

/// Membership of a child in a revision's fan-out
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FanoutRow {
    /// Parent revision
    pub rev_hash: Digest,
    /// Child payload digest
    pub child_hash: Digest,
}

/// A status transition of a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLogEntry {
    /// Revision the status applies to
    pub rev_hash: Digest,
    /// New status
    pub status: TaskStatus,
    /// When the transition happened
    pub timestamp: Timestamp,
    /// `status_hash(rev_hash, status, timestamp)`
    pub status_hash: Digest,
}

impl StatusLogEntry {
    /// Create a status row
    #[must_use]
    pub fn new(rev_hash: Digest, status: TaskStatus, timestamp: Timestamp) -> Self {
        Self {
            status_hash: chain::status_hash(&rev_hash, status.as_str(), &timestamp),
            rev_hash,
            status,
            timestamp,
        }
    }

    /// Whether `status_hash` matches the other columns
    #[must_use]
    pub fn verify(&self) -> bool {
        self.status_hash == chain::status_hash(&self.rev_hash, self.status.as_str(), &self.timestamp)
    }
}
