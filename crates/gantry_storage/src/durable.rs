//! redb-backed result backend.

use crate::backend::{ResultBackend, RunUpdate, StorageError, StorageResult, Transition};
use crate::run::TaskRun;
use async_trait::async_trait;
use gantry_core::{PoolName, TaskId, TaskStatus};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const TASK_RUN: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("task_run");
const META: TableDefinition<'static, &'static str, u64> = TableDefinition::new("task_run_meta");
const NEXT_ARRIVAL: &str = "next_arrival";

fn backend<E: std::fmt::Display>(err: E) -> StorageError {
    StorageError::Backend(err.to_string())
}

/// Task runs in a redb file
#[derive(Clone)]
pub struct RedbResultBackend {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbResultBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbResultBackend").finish_non_exhaustive()
    }
}

impl RedbResultBackend {
    /// Open or create the database at `path`
    ///
    /// # Errors
    ///
    /// Returns a backend error if the file cannot be opened
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path.as_ref()).map_err(backend)?;
        let txn = db.begin_write().map_err(backend)?;
        txn.open_table(TASK_RUN).map_err(backend)?;
        txn.open_table(META).map_err(backend)?;
        txn.commit().map_err(backend)?;
        tracing::debug!(path = %path.as_ref().display(), "Opened result backend");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> StorageResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(backend)?
    }

    fn store_sync(db: &Database, mut run: TaskRun) -> StorageResult<TaskRun> {
        let txn = db.begin_write().map_err(backend)?;
        {
            let mut runs = txn.open_table(TASK_RUN).map_err(backend)?;
            let mut meta = txn.open_table(META).map_err(backend)?;
            let existing = match runs.get(run.task_id.as_str()).map_err(backend)? {
                Some(bytes) => Some(serde_json::from_slice::<TaskRun>(bytes.value())?.arrival),
                None => None,
            };
            run.arrival = match existing {
                Some(arrival) => arrival,
                None => {
                    let next = meta
                        .get(NEXT_ARRIVAL)
                        .map_err(backend)?
                        .map_or(0, |v| v.value())
                        + 1;
                    meta.insert(NEXT_ARRIVAL, next).map_err(backend)?;
                    next
                }
            };
            let bytes = serde_json::to_vec(&run)?;
            runs.insert(run.task_id.as_str(), bytes.as_slice())
                .map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(run)
    }

    fn transition_sync(
        db: &Database,
        task_id: &str,
        from: &[TaskStatus],
        update: RunUpdate,
    ) -> StorageResult<Transition> {
        let txn = db.begin_write().map_err(backend)?;
        let outcome = {
            let mut runs = txn.open_table(TASK_RUN).map_err(backend)?;
            let current: Option<TaskRun> = match runs.get(task_id).map_err(backend)? {
                Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
                None => None,
            };
            match current {
                None => Transition::Missing,
                Some(current) if !from.contains(&current.status) => Transition::Refused(current),
                Some(previous) => {
                    let mut run = update(previous.clone());
                    run.task_id = previous.task_id.clone();
                    run.arrival = previous.arrival;
                    let bytes = serde_json::to_vec(&run)?;
                    runs.insert(task_id, bytes.as_slice()).map_err(backend)?;
                    Transition::Applied { previous, run }
                }
            }
        };
        if matches!(outcome, Transition::Applied { .. }) {
            txn.commit().map_err(backend)?;
        } else {
            txn.abort().map_err(backend)?;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl ResultBackend for RedbResultBackend {
    async fn store(&self, run: TaskRun) -> StorageResult<TaskRun> {
        self.blocking(move |db| Self::store_sync(db, run)).await
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        from: &[TaskStatus],
        update: RunUpdate,
    ) -> StorageResult<Transition> {
        let key = task_id.as_str().to_string();
        let from = from.to_vec();
        self.blocking(move |db| Self::transition_sync(db, &key, &from, update))
            .await
    }

    async fn get(&self, task_id: &TaskId) -> StorageResult<Option<TaskRun>> {
        let key = task_id.as_str().to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let runs = txn.open_table(TASK_RUN).map_err(backend)?;
            match runs.get(key.as_str()).map_err(backend)? {
                Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list(
        &self,
        pool: Option<&PoolName>,
        status: Option<TaskStatus>,
    ) -> StorageResult<Vec<TaskRun>> {
        let pool = pool.cloned();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let runs = txn.open_table(TASK_RUN).map_err(backend)?;
            let mut matching = Vec::new();
            for item in runs.iter().map_err(backend)? {
                let (_, bytes) = item.map_err(backend)?;
                let run: TaskRun = serde_json::from_slice(bytes.value())?;
                if run.matches(pool.as_ref(), status) {
                    matching.push(run);
                }
            }
            matching.sort_by_key(|run| run.arrival);
            Ok(matching)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::contract;
    use serde_json::Map;

    fn open() -> (tempfile::TempDir, RedbResultBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = RedbResultBackend::open(dir.path().join("results.redb")).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_upsert_keeps_arrival() {
        let (_dir, backend) = open();
        contract::upsert_keeps_arrival(&backend).await;
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let (_dir, backend) = open();
        contract::list_filters_and_orders(&backend).await;
    }

    #[tokio::test]
    async fn test_transition_checks_status() {
        let (_dir, backend) = open();
        contract::transition_checks_status(&backend).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_transitions_apply_once() {
        let (_dir, backend) = open();
        contract::racing_transitions_apply_once(Arc::new(backend)).await;
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_dir, backend) = open();
        contract::get_missing_is_none(&backend).await;
    }

    #[tokio::test]
    async fn test_arrival_counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.redb");
        let pool = PoolName::parse("p").unwrap();
        let first = {
            let backend = RedbResultBackend::open(&path).unwrap();
            backend.store(TaskRun::seed(pool.clone(), Map::new())).await.unwrap()
        };
        let backend = RedbResultBackend::open(&path).unwrap();
        let second = backend.store(TaskRun::seed(pool, Map::new())).await.unwrap();
        assert!(second.arrival > first.arrival);
        assert_eq!(backend.count(None, None).await.unwrap(), 2);
    }
}
