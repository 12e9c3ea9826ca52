//! GANTRY Queue
//!
//! Per-pool task queues with at-least-once delivery, and the registry of
//! workers that drain them. Both come in an in-memory flavour and a Redis
//! flavour (Streams consumer groups for the queue, expiring hashes for the
//! registry).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod error;
pub mod memory;
pub mod queue;
pub mod redis_registry;
pub mod redis_stream;
pub mod worker;

#[cfg(test)]
pub(crate) mod contract;

pub use entry::QueueEntry;
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;
pub use queue::{AckOutcome, Delivery, Queue, Reclaimed};
pub use redis_registry::RedisWorkerRegistry;
pub use redis_stream::{RedisQueueConfig, RedisStreamQueue};
pub use worker::{DEFAULT_WORKER_TTL, MemoryWorkerRegistry, Worker, WorkerRegistry};
