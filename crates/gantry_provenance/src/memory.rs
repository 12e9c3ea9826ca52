//! In-memory provenance store.

use crate::batch::ProvenanceBatch;
use crate::error::ProvenanceResult;
use crate::record::{ArtefactLineage, FanoutRow, StatusLogEntry, TaskRevision};
use crate::store::{CommitSummary, ProvenanceStore};
use async_trait::async_trait;
use gantry_core::{Digest, TaskId};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    revisions: BTreeMap<Digest, TaskRevision>,
    by_task: BTreeMap<TaskId, BTreeSet<Digest>>,
    edges: BTreeMap<Digest, ArtefactLineage>,
    edges_by_parent: BTreeMap<Digest, BTreeSet<Digest>>,
    fanout: BTreeSet<FanoutRow>,
    statuses: BTreeMap<Digest, BTreeMap<Digest, StatusLogEntry>>,
}

impl Tables {
    fn apply(&mut self, batch: &ProvenanceBatch) -> CommitSummary {
        let mut summary = CommitSummary::default();

        for revision in &batch.revisions {
            self.by_task
                .entry(revision.task_id.clone())
                .or_default()
                .insert(revision.rev_hash);
            let fresh = !self.revisions.contains_key(&revision.rev_hash);
            if fresh {
                self.revisions.insert(revision.rev_hash, revision.clone());
            }
            summary.tally(fresh);
        }
        for edge in &batch.edges {
            let fresh = !self.edges.contains_key(&edge.edge_hash);
            if fresh {
                self.edges.insert(edge.edge_hash, edge.clone());
                self.edges_by_parent
                    .entry(edge.parent_hash)
                    .or_default()
                    .insert(edge.edge_hash);
            }
            summary.tally(fresh);
        }
        for row in &batch.fanout {
            summary.tally(self.fanout.insert(row.clone()));
        }
        for entry in &batch.statuses {
            let per_rev = self.statuses.entry(entry.rev_hash).or_default();
            let fresh = !per_rev.contains_key(&entry.status_hash);
            if fresh {
                per_rev.insert(entry.status_hash, entry.clone());
            }
            summary.tally(fresh);
        }
        summary
    }
}

/// Provenance tables held in process memory
#[derive(Debug, Default)]
pub struct MemoryProvenanceStore {
    tables: RwLock<Tables>,
}

impl MemoryProvenanceStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProvenanceStore for MemoryProvenanceStore {
    async fn commit(&self, batch: &ProvenanceBatch) -> ProvenanceResult<CommitSummary> {
        let mut tables = self.tables.write().await;
        batch.validate(|rev| Ok(tables.revisions.contains_key(rev)))?;
        Ok(tables.apply(batch))
    }

    async fn revision(&self, rev_hash: &Digest) -> ProvenanceResult<Option<TaskRevision>> {
        Ok(self.tables.read().await.revisions.get(rev_hash).cloned())
    }

    async fn revisions_for_task(&self, task_id: &TaskId) -> ProvenanceResult<Vec<TaskRevision>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_task
            .get(task_id)
            .into_iter()
            .flatten()
            .filter_map(|rev| tables.revisions.get(rev).cloned())
            .collect())
    }

    async fn children(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<ArtefactLineage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .edges_by_parent
            .get(rev_hash)
            .into_iter()
            .flatten()
            .filter_map(|edge| tables.edges.get(edge).cloned())
            .collect())
    }

    async fn fanout(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<FanoutRow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .fanout
            .iter()
            .filter(|row| row.rev_hash == *rev_hash)
            .cloned()
            .collect())
    }

    async fn status_history(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<StatusLogEntry>> {
        let tables = self.tables.read().await;
        let mut history: Vec<StatusLogEntry> = tables
            .statuses
            .get(rev_hash)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        history.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.status_hash.cmp(&b.status_hash))
        });
        Ok(history)
    }
}
