//! redb-backed provenance store.
//!
//! Rows are JSON values in `&str`-keyed tables. Secondary indexes use
//! composite keys `"<prefix> <suffix>"`; ids and hex digests never contain
//! spaces, so a prefix scan is the range `"<prefix> ".."<prefix>!"`.

use crate::batch::ProvenanceBatch;
use crate::error::{ProvenanceError, ProvenanceResult};
use crate::record::{ArtefactLineage, FanoutRow, StatusLogEntry, TaskRevision};
use crate::store::{CommitSummary, ProvenanceStore};
use async_trait::async_trait;
use gantry_core::{Digest, TaskId};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;

const TASK_REVISION: RowTable = TableDefinition::new("task_revision");
const REVISION_BY_TASK: RowTable = TableDefinition::new("task_revision_by_task");
const ARTEFACT_LINEAGE: RowTable = TableDefinition::new("artefact_lineage");
const LINEAGE_BY_PARENT: RowTable =
    TableDefinition::new("artefact_lineage_by_parent");
const FANOUT_SET: RowTable = TableDefinition::new("fanout_set");
const STATUS_LOG: RowTable = TableDefinition::new("status_log");

const EMPTY: &[u8] = &[];

fn storage<E: std::fmt::Display>(err: E) -> ProvenanceError {
    ProvenanceError::Storage(err.to_string())
}

fn encode<T: Serialize>(row: &T) -> ProvenanceResult<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProvenanceResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn composite(prefix: &str, suffix: &str) -> String {
    format!("{} {}", prefix, suffix)
}

fn prefix_bounds(prefix: &str) -> (String, String) {
    (format!("{} ", prefix), format!("{}!", prefix))
}

/// Provenance tables in a redb file
#[derive(Clone)]
pub struct RedbProvenanceStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbProvenanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbProvenanceStore").finish_non_exhaustive()
    }
}

impl RedbProvenanceStore {
    /// Open or create the database at `path` and make sure every table exists
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be opened
    pub fn open(path: impl AsRef<Path>) -> ProvenanceResult<Self> {
        let db = Database::create(path.as_ref()).map_err(storage)?;
        let txn = db.begin_write().map_err(storage)?;
        for table in [
            TASK_REVISION,
            REVISION_BY_TASK,
            ARTEFACT_LINEAGE,
            LINEAGE_BY_PARENT,
            FANOUT_SET,
            STATUS_LOG,
        ] {
            txn.open_table(table).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> ProvenanceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> ProvenanceResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(storage)?
    }

    fn commit_sync(db: &Database, batch: &ProvenanceBatch) -> ProvenanceResult<CommitSummary> {
        let txn = db.begin_write().map_err(storage)?;
        let mut summary = CommitSummary::default();
        {
            let mut revisions = txn.open_table(TASK_REVISION).map_err(storage)?;
            batch.validate(|rev| {
                Ok(revisions
                    .get(rev.to_hex().as_str())
                    .map_err(storage)?
                    .is_some())
            })?;

            let mut by_task = txn.open_table(REVISION_BY_TASK).map_err(storage)?;
            for revision in &batch.revisions {
                let key = revision.rev_hash.to_hex();
                let fresh = revisions.get(key.as_str()).map_err(storage)?.is_none();
                if fresh {
                    revisions
                        .insert(key.as_str(), encode(revision)?.as_slice())
                        .map_err(storage)?;
                }
                let index = composite(revision.task_id.as_str(), &key);
                by_task
                    .insert(index.as_str(), EMPTY)
                    .map_err(storage)?;
                summary.tally(fresh);
            }
        }
        {
            let mut edges = txn.open_table(ARTEFACT_LINEAGE).map_err(storage)?;
            let mut by_parent = txn.open_table(LINEAGE_BY_PARENT).map_err(storage)?;
            for edge in &batch.edges {
                let key = edge.edge_hash.to_hex();
                let fresh = edges.get(key.as_str()).map_err(storage)?.is_none();
                if fresh {
                    edges
                        .insert(key.as_str(), encode(edge)?.as_slice())
                        .map_err(storage)?;
                    let index = composite(&edge.parent_hash.to_hex(), &key);
                    by_parent
                        .insert(index.as_str(), EMPTY)
                        .map_err(storage)?;
                }
                summary.tally(fresh);
            }
        }
        {
            let mut fanout = txn.open_table(FANOUT_SET).map_err(storage)?;
            for row in &batch.fanout {
                let key = composite(&row.rev_hash.to_hex(), &row.child_hash.to_hex());
                let fresh = fanout.get(key.as_str()).map_err(storage)?.is_none();
                if fresh {
                    fanout
                        .insert(key.as_str(), encode(row)?.as_slice())
                        .map_err(storage)?;
                }
                summary.tally(fresh);
            }
        }
        {
            let mut statuses = txn.open_table(STATUS_LOG).map_err(storage)?;
            for entry in &batch.statuses {
                let key = composite(&entry.rev_hash.to_hex(), &entry.status_hash.to_hex());
                let fresh = statuses.get(key.as_str()).map_err(storage)?.is_none();
                if fresh {
                    statuses
                        .insert(key.as_str(), encode(entry)?.as_slice())
                        .map_err(storage)?;
                }
                summary.tally(fresh);
            }
        }
        txn.commit().map_err(storage)?;
        Ok(summary)
    }

    fn scan_values<T: DeserializeOwned>(
        db: &Database,
        table: RowTable,
        prefix: &str,
    ) -> ProvenanceResult<Vec<T>> {
        let txn = db.begin_read().map_err(storage)?;
        let table = txn.open_table(table).map_err(storage)?;
        let (start, end) = prefix_bounds(prefix);
        let mut rows = Vec::new();
        for item in table.range(start.as_str()..end.as_str()).map_err(storage)? {
            let (_, value) = item.map_err(storage)?;
            rows.push(decode(value.value())?);
        }
        Ok(rows)
    }

    fn scan_suffixes(
        db: &Database,
        table: RowTable,
        prefix: &str,
    ) -> ProvenanceResult<Vec<String>> {
        let txn = db.begin_read().map_err(storage)?;
        let table = txn.open_table(table).map_err(storage)?;
        let (start, end) = prefix_bounds(prefix);
        let mut suffixes = Vec::new();
        for item in table.range(start.as_str()..end.as_str()).map_err(storage)? {
            let (key, _) = item.map_err(storage)?;
            if let Some(suffix) = key.value().strip_prefix(start.as_str()) {
                suffixes.push(suffix.to_string());
            }
        }
        Ok(suffixes)
    }

    fn get_many<T: DeserializeOwned>(
        db: &Database,
        table: RowTable,
        keys: &[String],
    ) -> ProvenanceResult<Vec<T>> {
        let txn = db.begin_read().map_err(storage)?;
        let table = txn.open_table(table).map_err(storage)?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = table.get(key.as_str()).map_err(storage)? {
                rows.push(decode(value.value())?);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl ProvenanceStore for RedbProvenanceStore {
    async fn commit(&self, batch: &ProvenanceBatch) -> ProvenanceResult<CommitSummary> {
        let batch = batch.clone();
        self.blocking(move |db| Self::commit_sync(db, &batch)).await
    }

    async fn revision(&self, rev_hash: &Digest) -> ProvenanceResult<Option<TaskRevision>> {
        let key = vec![rev_hash.to_hex()];
        let mut rows: Vec<TaskRevision> = self
            .blocking(move |db| Self::get_many(db, TASK_REVISION, &key))
            .await?;
        Ok(rows.pop())
    }

    async fn revisions_for_task(&self, task_id: &TaskId) -> ProvenanceResult<Vec<TaskRevision>> {
        let task = task_id.as_str().to_string();
        self.blocking(move |db| {
            let revs = Self::scan_suffixes(db, REVISION_BY_TASK, &task)?;
            Self::get_many(db, TASK_REVISION, &revs)
        })
        .await
    }

    async fn children(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<ArtefactLineage>> {
        let parent = rev_hash.to_hex();
        self.blocking(move |db| {
            let edges = Self::scan_suffixes(db, LINEAGE_BY_PARENT, &parent)?;
            Self::get_many(db, ARTEFACT_LINEAGE, &edges)
        })
        .await
    }

    async fn fanout(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<FanoutRow>> {
        let rev = rev_hash.to_hex();
        self.blocking(move |db| Self::scan_values(db, FANOUT_SET, &rev))
            .await
    }

    async fn status_history(&self, rev_hash: &Digest) -> ProvenanceResult<Vec<StatusLogEntry>> {
        let rev = rev_hash.to_hex();
        let mut history: Vec<StatusLogEntry> = self
            .blocking(move |db| Self::scan_values(db, STATUS_LOG, &rev))
            .await?;
        history.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.status_hash.cmp(&b.status_hash))
        });
        Ok(history)
    }
}
