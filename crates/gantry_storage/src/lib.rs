//! GANTRY Storage
//!
//! Task outcome storage and the selectors built on top of it:
//! - `ResultBackend` with in-memory and redb implementations
//! - A name-keyed `BackendRegistry` used to resolve backends from config
//! - Leader/candidate selectors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod durable;
pub mod memory;
pub mod run;
pub mod select;

pub use backend::{
    BackendOptions, BackendRegistry, ResultBackend, RunUpdate, StorageError, StorageResult,
    Transition,
};
pub use durable::RedbResultBackend;
pub use memory::MemoryResultBackend;
pub use run::TaskRun;
pub use select::{BootstrapSelector, InputSelector, ResultBackendSelector, Selection, Selector};
