//! GANTRY Core Types
//!
//! Pure types and logic shared by every other crate: SHA-256 digests,
//! canonical JSON, the hash-chain digest functions, identifiers, the task
//! model and time. The only I/O here is reading YAML documents for
//! `plan_hash` and `design_hash`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod chain;
pub mod error;
pub mod hash;
pub mod id;
pub mod task;
pub mod time;

// Re-exports
pub use canonical::{canonical_value, to_canonical_bytes, to_canonical_string};
pub use error::{CoreError, CoreResult};
pub use hash::{Digest, DigestError};
pub use id::{PoolName, TaskId, WorkerId};
pub use task::{Task, TaskStatus};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
