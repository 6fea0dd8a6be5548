//! Flowrun Resolver
//!
//! Pure functions deciding, for one execution, which task runs come next and
//! when a flowable scope is over. Nothing here performs I/O: the executor
//! calls the resolver with a flow, an execution and a [`Renderer`], and acts
//! on the task runs and states it gets back.
//!
//! ```ignore
//! let ctx = RunContext::new(&flow, &execution, &renderer);
//! let nexts = resolve_nexts(&ctx, task, &parent_task_run)?;
//! ```

mod error;
mod flowable;
mod graph;
mod nexts;
mod render;

pub use error::ResolverError;
pub use flowable::{Flowable, RunContext, flowable, resolve_nexts, resolve_state, validate_flow};
pub use graph::Graph;
pub use nexts::{
  resolve_dag_nexts, resolve_parallel_nexts, resolve_scope_state, resolve_sequential_nexts,
};
pub use render::{MiniJinjaRenderer, RenderError, Renderer, is_truthy, render_value, variables};
