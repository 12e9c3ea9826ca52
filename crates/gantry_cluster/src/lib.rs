//! GANTRY Cluster
//!
//! Moving tasks from pool queues to remote workers: JSON-RPC dispatch,
//! one scheduling loop per pool with orphan recovery, a supervisor that
//! owns the loops, label controls, task update events and the gateway API
//! submitters and workers call.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod events;
pub mod gateway;
pub mod labels;
pub mod remote;
pub mod scheduler;
pub mod supervisor;

pub use events::{TASK_UPDATE, TaskEvent};
pub use gateway::{
    Ack, Cancelled, Gateway, GatewayError, GatewayResult, Heartbeat, LabelParams, LabelPaused,
    LabelRef, LabelState, ListPoolTasks, ListWorkers, PatchTask, PoolRef, RegisterWorker,
    SubmitTask, Submitted, TaskChanges, TaskRef, WorkFinished, WorkerList,
};
pub use labels::{Admission, LabelBook, LabelError, LabelMeta, LabelUpdate};
pub use remote::{Dispatcher, HttpDispatcher, RpcCall, TransportError};
pub use scheduler::{
    Completion, LoopState, Scheduler, SchedulerConfig, SchedulerError, SchedulerResult, StepOutcome,
    SweepReport, TaskPatch,
};
pub use supervisor::Supervisor;
