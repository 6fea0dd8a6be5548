//! Flowrun Config
//!
//! This crate contains the serializable flow definition types for flowrun.
//! A [`Flow`] is a tree of [`Task`]s: runnable leaves executed by workers and
//! flowable nodes (sequential, parallel, dag, each, if, switch) that only
//! decide which of their children run next.
//!
//! Definitions are usually loaded from JSON:
//!
//! ```ignore
//! let flow: Flow = serde_json::from_str(&content)?;
//! flow.validate()?;
//! ```
//!
//! Parsing and validation are deliberately shallow here. Expression rendering,
//! DAG dependency checks and scheduling live in `flowrun-resolver`.

mod error;
mod flow;
mod retry;
mod task;

pub use error::FlowError;
pub use flow::Flow;
pub use retry::{RetryBackoff, RetryPolicy};
pub use task::{
  Dag, DagTask, EachParallel, EachSequential, If, Parallel, Runnable, Sequential, Switch, Task,
  TaskKind,
};
