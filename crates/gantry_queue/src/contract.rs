//! Behaviour every queue and registry implementation must share.
//!
//! Each backend's test module runs these against its own instance.

use crate::queue::{AckOutcome, Queue};
use crate::worker::{Worker, WorkerRegistry};
use gantry_core::{PoolName, Task, WorkerId};
use serde_json::{Map, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub fn task(pool: &PoolName) -> Task {
    let Some(payload) = json!({"action": "eval"}).as_object().cloned() else {
        panic!("object")
    };
    Task::new(pool.clone(), payload)
}

fn pool(name: &str) -> PoolName {
    PoolName::parse(name).unwrap()
}

pub async fn fifo_and_ack(queue: &dyn Queue) {
    let p = pool("fifo");
    let first = task(&p);
    let second = task(&p);
    queue.enqueue(&p, first.clone()).await.unwrap();
    queue.enqueue(&p, second.clone()).await.unwrap();
    assert_eq!(queue.pending(&p).await.unwrap(), 2);

    let a = queue.dequeue(&p, Duration::from_millis(200)).await.unwrap().unwrap();
    let b = queue.dequeue(&p, Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(a.task, first);
    assert_eq!(a.attempts, 0);
    assert_eq!(b.task.id, second.id);
    assert_eq!(queue.pending(&p).await.unwrap(), 2);

    assert_eq!(queue.ack(&p, &a.task.id).await.unwrap(), AckOutcome::Acked);
    assert_eq!(queue.ack(&p, &a.task.id).await.unwrap(), AckOutcome::AlreadySettled);
    assert_eq!(queue.ack(&p, &b.task.id).await.unwrap(), AckOutcome::Acked);
    assert_eq!(queue.pending(&p).await.unwrap(), 0);
}

pub async fn dequeue_times_out(queue: &dyn Queue) {
    let p = pool("empty");
    let start = Instant::now();
    let got = queue.dequeue(&p, Duration::from_millis(100)).await.unwrap();
    assert!(got.is_none());
    assert!(start.elapsed() >= Duration::from_millis(100));
}

pub async fn release_returns_task(queue: &dyn Queue) {
    let p = pool("release");
    let t = task(&p);
    queue.enqueue(&p, t.clone()).await.unwrap();
    let d = queue.dequeue(&p, Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(queue.release(&p, &d.task.id).await.unwrap(), AckOutcome::Acked);
    assert_eq!(
        queue.release(&p, &d.task.id).await.unwrap(),
        AckOutcome::AlreadySettled
    );

    let again = queue.dequeue(&p, Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(again.task.id, t.id);
    assert_eq!(again.attempts, 0);
    queue.ack(&p, &t.id).await.unwrap();
}

pub async fn orphans_redelivered_once(queue: &dyn Queue) {
    let p = pool("orphans");
    let t = task(&p);
    queue.enqueue(&p, t.clone()).await.unwrap();
    queue.dequeue(&p, Duration::from_millis(200)).await.unwrap().unwrap();

    let idle = Duration::from_millis(80);
    assert!(queue.requeue_orphans(idle).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let reclaimed: Vec<_> = queue
        .requeue_orphans(idle)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.pool == p)
        .collect();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].task_id, t.id);
    assert_eq!(reclaimed[0].attempts, 1);

    let redelivered = queue.dequeue(&p, Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(redelivered.task.id, t.id);
    assert_eq!(redelivered.attempts, 1);
    assert!(queue.dequeue(&p, Duration::from_millis(50)).await.unwrap().is_none());

    assert_eq!(queue.ack(&p, &t.id).await.unwrap(), AckOutcome::Acked);
    assert_eq!(queue.pending(&p).await.unwrap(), 0);
}

pub async fn pools_are_isolated(queue: &dyn Queue) {
    let a = pool("iso-a");
    let b = pool("iso-b");
    queue.enqueue(&a, task(&a)).await.unwrap();
    assert!(queue.dequeue(&b, Duration::from_millis(50)).await.unwrap().is_none());
    assert_eq!(queue.pending(&a).await.unwrap(), 1);
    assert_eq!(queue.pending(&b).await.unwrap(), 0);
    assert!(queue.pools().await.unwrap().contains(&a));
}

pub async fn racing_dequeuers_get_one_delivery(queue: Arc<dyn Queue>) {
    let p = pool("race");
    let t = task(&p);
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let p = p.clone();
            tokio::spawn(async move { queue.dequeue(&p, Duration::from_millis(300)).await })
        })
        .collect();
    queue.enqueue(&p, t.clone()).await.unwrap();

    let mut delivered = Vec::new();
    for handle in handles {
        if let Some(delivery) = handle.await.unwrap().unwrap() {
            delivered.push(delivery.task.id);
        }
    }
    assert_eq!(delivered, vec![t.id.clone()]);
    assert_eq!(queue.ack(&p, &t.id).await.unwrap(), AckOutcome::Acked);
    assert_eq!(queue.pending(&p).await.unwrap(), 0);
}

fn worker(id: &str, pool_name: &str) -> Worker {
    Worker::new(
        WorkerId::parse(id).unwrap(),
        pool(pool_name),
        format!("http://{}.local:8001/rpc", id),
    )
    .with_handlers(vec!["eval".to_string()])
}

pub async fn register_and_list(registry: &dyn WorkerRegistry) {
    registry.register(worker("w1", "reg")).await.unwrap();
    registry.register(worker("w2", "reg")).await.unwrap();
    registry.register(worker("w3", "other")).await.unwrap();

    let mut ids: Vec<String> = registry
        .list(Some(&pool("reg")))
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.worker_id.to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["w1", "w2"]);

    let w1 = registry.get(&WorkerId::parse("w1").unwrap()).await.unwrap().unwrap();
    assert_eq!(w1.handlers, vec!["eval".to_string()]);
    assert_eq!(w1.url, "http://w1.local:8001/rpc");
}

pub async fn heartbeat_rules(registry: &dyn WorkerRegistry) {
    let known = WorkerId::parse("hb-known").unwrap();
    registry.register(worker("hb-known", "hb")).await.unwrap();

    let mut metrics = Map::new();
    metrics.insert("load".into(), json!(0.5));
    assert!(registry.heartbeat(&known, metrics, None, None).await.unwrap());
    let refreshed = registry.get(&known).await.unwrap().unwrap();
    assert_eq!(refreshed.metrics.get("load"), Some(&json!(0.5)));

    let stranger = WorkerId::parse("hb-stranger").unwrap();
    assert!(!registry.heartbeat(&stranger, Map::new(), None, None).await.unwrap());
    assert!(registry.get(&stranger).await.unwrap().is_none());

    assert!(
        registry
            .heartbeat(
                &stranger,
                Map::new(),
                Some(pool("hb")),
                Some("http://late:9000/rpc".into()),
            )
            .await
            .unwrap()
    );
    assert_eq!(registry.list(Some(&pool("hb"))).await.unwrap().len(), 2);
}

pub async fn remove_worker(registry: &dyn WorkerRegistry) {
    let id = WorkerId::parse("rm-1").unwrap();
    registry.register(worker("rm-1", "rm")).await.unwrap();
    assert!(registry.remove(&id).await.unwrap());
    assert!(!registry.remove(&id).await.unwrap());
    assert!(registry.list(Some(&pool("rm"))).await.unwrap().is_empty());
    assert!(registry.get(&id).await.unwrap().is_none());
}

pub async fn heartbeat_moves_pool(registry: &dyn WorkerRegistry) {
    let id = WorkerId::parse("mv-1").unwrap();
    registry.register(worker("mv-1", "mv-old")).await.unwrap();
    assert!(
        registry
            .heartbeat(&id, Map::new(), Some(pool("mv-new")), None)
            .await
            .unwrap()
    );

    assert!(registry.list(Some(&pool("mv-old"))).await.unwrap().is_empty());
    let moved = registry.list(Some(&pool("mv-new"))).await.unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].worker_id, id);
    assert_eq!(moved[0].url, "http://mv-1.local:8001/rpc");
    assert_eq!(moved[0].handlers, vec!["eval".to_string()]);
    assert_eq!(registry.get(&id).await.unwrap().unwrap().pool, pool("mv-new"));

    assert!(registry.remove(&id).await.unwrap());
    assert!(registry.list(Some(&pool("mv-new"))).await.unwrap().is_empty());
}
