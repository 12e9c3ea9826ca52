//! Atomic provenance batches.
//!
//! A batch is everything one task completion adds to the DAG. Stores commit
//! a batch in a single transaction: either every row lands or none does.

use crate::error::{ProvenanceError, ProvenanceResult};
use crate::record::{ArtefactLineage, FanoutRow, StatusLogEntry, TaskRevision};
use gantry_core::chain;
use gantry_core::task::CHILDREN_KEY;
use gantry_core::{Digest, Task, TaskStatus, Timestamp};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Rows to commit together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvenanceBatch {
    /// Revisions, parents before children
    pub revisions: Vec<TaskRevision>,
    /// Lineage edges
    pub edges: Vec<ArtefactLineage>,
    /// Fan-out membership rows
    pub fanout: Vec<FanoutRow>,
    /// Status transitions
    pub statuses: Vec<StatusLogEntry>,
}

impl ProvenanceBatch {
    /// Create an empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a revision
    #[must_use]
    pub fn with_revision(mut self, revision: TaskRevision) -> Self {
        self.revisions.push(revision);
        self
    }

    /// Add an edge
    #[must_use]
    pub fn with_edge(mut self, edge: ArtefactLineage) -> Self {
        self.edges.push(edge);
        self
    }

    /// Add a fan-out row
    #[must_use]
    pub fn with_fanout(mut self, row: FanoutRow) -> Self {
        self.fanout.push(row);
        self
    }

    /// Add a status row
    #[must_use]
    pub fn with_status(mut self, entry: StatusLogEntry) -> Self {
        self.statuses.push(entry);
        self
    }

    /// Total number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.revisions.len() + self.edges.len() + self.fanout.len() + self.statuses.len()
    }

    /// Whether the batch has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check every row against its digest and its parents
    ///
    /// `committed` answers whether a revision already exists in the store.
    /// Revisions may reference parents committed earlier or appearing
    /// earlier in this batch; the other rows may reference any revision.
    ///
    /// # Errors
    ///
    /// `Corrupt` for a digest that does not match its row, `HashMismatch`
    /// for a reference to an unknown revision, or whatever `committed`
    /// returns
    pub fn validate<F>(&self, mut committed: F) -> ProvenanceResult<()>
    where
        F: FnMut(&Digest) -> ProvenanceResult<bool>,
    {
        let mut known: HashSet<Digest> = HashSet::with_capacity(self.revisions.len());
        let mut exists = |rev: &Digest, known: &HashSet<Digest>| -> ProvenanceResult<bool> {
            if known.contains(rev) {
                return Ok(true);
            }
            committed(rev)
        };

        for revision in &self.revisions {
            if !revision.verify() {
                return Err(ProvenanceError::Corrupt {
                    row: "task_revision",
                    stored: revision.rev_hash,
                });
            }
            if let Some(parent) = &revision.parent_hash {
                if !exists(parent, &known)? {
                    return Err(ProvenanceError::HashMismatch {
                        row: "task_revision",
                        rev_hash: revision.rev_hash,
                        missing: *parent,
                    });
                }
            }
            known.insert(revision.rev_hash);
        }

        for edge in &self.edges {
            if !edge.verify() {
                return Err(ProvenanceError::Corrupt {
                    row: "artefact_lineage",
                    stored: edge.edge_hash,
                });
            }
            if !exists(&edge.parent_hash, &known)? {
                return Err(ProvenanceError::HashMismatch {
                    row: "artefact_lineage",
                    rev_hash: edge.edge_hash,
                    missing: edge.parent_hash,
                });
            }
        }

        for row in &self.fanout {
            if !exists(&row.rev_hash, &known)? {
                return Err(ProvenanceError::HashMismatch {
                    row: "fanout_set",
                    rev_hash: row.rev_hash,
                    missing: row.rev_hash,
                });
            }
        }

        for entry in &self.statuses {
            if !entry.verify() {
                return Err(ProvenanceError::Corrupt {
                    row: "status_log",
                    stored: entry.status_hash,
                });
            }
            if !exists(&entry.rev_hash, &known)? {
                return Err(ProvenanceError::HashMismatch {
                    row: "status_log",
                    rev_hash: entry.status_hash,
                    missing: entry.rev_hash,
                });
            }
        }

        Ok(())
    }
}

/// A child a worker derived from its task, as reported in `result.children`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChildSpec {
    /// The child's payload
    pub payload: Map<String, Value>,
    /// Operator that produced it
    #[serde(default = "default_operator", alias = "operatorId")]
    pub operator: String,
    /// Optional branch label
    #[serde(default, alias = "branchTag")]
    pub branch_tag: Option<String>,
}

fn default_operator() -> String {
    "derive".to_string()
}

impl ChildSpec {
    /// Read the children listed in a task result
    ///
    /// A result without a `children` key has no children.
    ///
    /// # Errors
    ///
    /// `InvalidResult` if `children` is present but malformed
    pub fn from_result(result: Option<&Value>) -> ProvenanceResult<Vec<ChildSpec>> {
        let Some(children) = result.and_then(|r| r.get(CHILDREN_KEY)) else {
            return Ok(Vec::new());
        };
        Vec::<ChildSpec>::deserialize(children)
            .map_err(|e| ProvenanceError::InvalidResult(format!("children: {}", e)))
    }
}

/// The batch recording one task reaching a status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionBatch {
    /// Rows to commit
    pub batch: ProvenanceBatch,
    /// The task's revision
    pub rev_hash: Digest,
    /// Fan-out root when the result carried children
    pub fanout_root: Option<Digest>,
}

impl CompletionBatch {
    /// Build the rows for `task` reaching `status`
    ///
    /// Children in the result become lineage edges from the task's revision
    /// plus fan-out rows; their order does not affect the fan-out root.
    ///
    /// # Errors
    ///
    /// `InvalidResult` if the children are malformed
    pub fn build(
        task: &Task,
        status: TaskStatus,
        at: Timestamp,
        result: Option<&Value>,
    ) -> ProvenanceResult<Self> {
        let payload_hash = chain::payload_map_hash(&task.payload)?;
        let revision = TaskRevision::new(task.id.clone(), task.parent_rev, payload_hash);
        let rev_hash = revision.rev_hash;

        let mut batch = ProvenanceBatch::new()
            .with_revision(revision)
            .with_status(StatusLogEntry::new(rev_hash, status, at));

        let children = ChildSpec::from_result(result)?;
        let mut fanout_root = None;
        if !children.is_empty() {
            let mut edge_hashes = Vec::with_capacity(children.len());
            for child in children {
                let child_hash = chain::payload_map_hash(&child.payload)?;
                let edge = ArtefactLineage::new(rev_hash, child_hash, child.operator, child.branch_tag);
                edge_hashes.push(edge.edge_hash);
                batch = batch.with_edge(edge).with_fanout(FanoutRow {
                    rev_hash,
                    child_hash,
                });
            }
            fanout_root = Some(chain::fanout_root_hash(&edge_hashes));
        }

        Ok(Self {
            batch,
            rev_hash,
            fanout_root,
        })
    }
}
