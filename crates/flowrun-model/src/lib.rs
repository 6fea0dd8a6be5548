//! Flowrun Model
//!
//! Immutable value types describing one run of a flow:
//!
//! - [`State`]: current [`StateType`] plus an append-only transition history
//! - [`TaskRun`]: one instantiation of one task node, with its attempts
//! - [`Execution`]: the run itself, owning the ordered list of task runs
//! - [`ResolvedTask`]: a task instance that may run but has no task run yet
//! - worker payloads exchanged over the queues ([`WorkerTask`],
//!   [`WorkerTaskResult`], [`ExecutionKilled`]) and the registry records
//!   ([`WorkerInstance`], [`WorkerJobRunning`])
//!
//! Every mutation goes through a `with_*` method returning a new value, so
//! two values can always be compared with `==`.

mod error;
mod execution;
mod resolved;
mod state;
mod task_run;
mod worker;

pub use error::ModelError;
pub use execution::Execution;
pub use resolved::ResolvedTask;
pub use state::{History, State, StateType};
pub use task_run::{TaskRun, TaskRunAttempt};
pub use worker::{
  ExecutionKilled, KillState, WorkerInstance, WorkerJobRunning, WorkerTask, WorkerTaskResult,
  worker_consumer_group,
};
