//! The provenance store contract.

use crate::batch::ProvenanceBatch;
use crate::error::ProvenanceResult;
use crate::record::{ArtefactLineage, FanoutRow, StatusLogEntry, TaskRevision};
use async_trait::async_trait;
use gantry_core::chain;
use gantry_core::{Digest, TaskId};
use std::collections::HashSet;

/// Rows written by one commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Rows that were new
    pub inserted: usize,
    /// Rows that already existed
    pub existing: usize,
}

impl CommitSummary {
    pub(crate) fn tally(&mut self, fresh: bool) {
        if fresh {
            self.inserted += 1;
        } else {
            self.existing += 1;
        }
    }
}

/// Append-only provenance tables
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
    /// Validate and write a batch atomically
    ///
    /// Rows already present are left untouched, so committing the same
    /// batch twice is a no-op.
    ///
    /// # Errors
    ///
    /// `HashMismatch` or `Corrupt` if validation fails, in which case
    /// nothing is written
    async fn commit(&self, batch: &ProvenanceBatch) -> ProvenanceResult<CommitSummary>;

    /// Look up a revision
    async fn revision(&self, rev_hash: &Digest) -> ProvenanceResult<Option<TaskRevision>>;

    /// Every revision a task produced
    async fn revisions_for_task(&self, task_id: &TaskId) -> ProvenanceResult<Vec<TaskRevision>>;

    /// Lineage edges leaving a revision, ordered by edge hash
    async fn children(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<ArtefactLineage>>;

    /// Fan-out rows of a revision, ordered by child hash
    async fn fanout(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<FanoutRow>>;

    /// Status transitions of a revision, oldest first
    async fn status_history(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<StatusLogEntry>>;

    /// The revision and its ancestors, ending at the root
    async fn lineage(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<TaskRevision>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(*rev_hash);
        while let Some(current) = cursor {
            if !seen.insert(current) {
                break;
            }
            let Some(revision) = self.revision(&current).await? else {
                break;
            };
            cursor = revision.parent_hash;
            chain.push(revision);
        }
        Ok(chain)
    }

    /// Fan-out root recomputed from the stored edges
    async fn fanout_root(&self, rev_hash: &Digest) -> ProvenanceResult<Option<Digest>> {
        let edges = self.children(rev_hash).await?;
        if edges.is_empty() {
            return Ok(None);
        }
        let hashes: Vec<Digest> = edges.iter().map(|e| e.edge_hash).collect();
        Ok(Some(chain::fanout_root_hash(&hashes)))
    }
}
