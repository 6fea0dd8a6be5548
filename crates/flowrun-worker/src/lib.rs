//! Flowrun Worker
//!
//! Runs the runnable tasks the executor dispatches. A worker:
//!
//! - registers in the [`flowrun_registry::Registry`] and sends heartbeats
//! - consumes the work items of its worker group, a bounded number at once
//! - renders the task properties and hands them to a [`TaskRunner`]
//! - reports RUNNING, then the final state (or RETRYING) of every task run
//! - stops the tasks of killed executions
//!
//! ```ignore
//! let worker = Arc::new(Worker::new(registry, queues, WorkerConfig::default()));
//! worker.run(cancel).await?;
//! ```

mod config;
mod error;
mod task;
mod worker;

pub use config::WorkerConfig;
pub use error::{TaskError, WorkerError};
pub use task::{BuiltinTaskRunner, TaskContext, TaskRunner};
pub use worker::Worker;
