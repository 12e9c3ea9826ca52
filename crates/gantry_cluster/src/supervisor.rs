//! Pool loop supervision.

use crate::scheduler::Scheduler;
use gantry_core::PoolName;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owns one scheduling loop per pool plus the sweeper
///
/// Loops are started once per pool and share one cancellation token, so
/// [`Supervisor::shutdown`] stops all of them together.
#[derive(Debug)]
pub struct Supervisor {
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    pools: Mutex<BTreeSet<PoolName>>,
    sweeping: Mutex<bool>,
}

impl Supervisor {
    /// Create a supervisor with no loops running
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            pools: Mutex::new(BTreeSet::new()),
            sweeping: Mutex::new(false),
        }
    }

    /// The scheduler the loops drive
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Start the loop for `pool` unless it is already running
    ///
    /// Returns `true` if a loop was started.
    pub async fn ensure(&self, pool: &PoolName) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let mut pools = self.pools.lock().await;
        if !pools.insert(pool.clone()) {
            return false;
        }
        let scheduler = Arc::clone(&self.scheduler);
        let cancel = self.cancel.child_token();
        let pool = pool.clone();
        self.tracker
            .spawn(async move { scheduler.run_pool(pool, cancel).await });
        true
    }

    /// Start the orphan and stale-worker sweeper unless it is running
    pub async fn start_sweeper(&self) -> bool {
        let mut sweeping = self.sweeping.lock().await;
        if *sweeping || self.cancel.is_cancelled() {
            return false;
        }
        *sweeping = true;
        let scheduler = Arc::clone(&self.scheduler);
        let cancel = self.cancel.child_token();
        self.tracker
            .spawn(async move { scheduler.run_sweeper(cancel).await });
        true
    }

    /// Pools with a running loop
    pub async fn pools(&self) -> Vec<PoolName> {
        self.pools.lock().await.iter().cloned().collect()
    }

    /// Stop every loop and wait for them to finish
    pub async fn shutdown(&self) {
        tracing::info!("Stopping pool loops");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
