//! GANTRY Provenance
//!
//! An append-only, content-addressed lineage DAG. Task revisions are chained
//! by parent digest, derivations are recorded as lineage edges grouped into
//! fan-outs, and every status transition is logged with its own digest.
//! Batches commit atomically and are validated before any row is written: a
//! child revision is never visible before its parent.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod durable;
pub mod error;
pub mod memory;
pub mod record;
pub mod store;

pub use batch::{ChildSpec, CompletionBatch, ProvenanceBatch};
pub use durable::RedbProvenanceStore;
pub use error::{ProvenanceError, ProvenanceResult};
pub use memory::MemoryProvenanceStore;
pub use record::{ArtefactLineage, FanoutRow, StatusLogEntry, TaskRevision};
pub use store::{CommitSummary, ProvenanceStore};
