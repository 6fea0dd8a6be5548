//! Flowrun Executor
//!
//! The component owning the state of executions. It consumes:
//!
//! - submitted executions (and restarted ones) from the execution queue
//! - task run progress reported by the workers
//! - kill requests
//!
//! and after every event stores the updated execution, then emits the work
//! items of the runnable task runs it now waits for. Flowable tasks never
//! reach a worker: the executor resolves their children and their final
//! state itself, see [`process`].
//!
//! ```ignore
//! let flows = Arc::new(FlowCache::from_queue(queues.flow.clone()));
//! let executor = Arc::new(Executor::new(flows, store, dedup, registry, queues));
//! executor.run(cancel).await;
//! ```

mod config;
mod error;
mod events;
mod flows;
mod lock;
mod process;
mod runner;
mod service;

pub use config::ExecutorConfig;
pub use error::ExecutorError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use flows::{FlowCache, FlowRepository};
pub use lock::KeyedLock;
pub use process::{Processed, on_nexts, process};
pub use runner::{EXECUTOR_GROUP, Executor};
pub use service::{ExecutionService, restart};
