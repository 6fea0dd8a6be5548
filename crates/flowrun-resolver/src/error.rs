use flowrun_config::FlowError;
use flowrun_model::ModelError;

use crate::render::RenderError;

/// Errors raised while resolving the tasks of an execution.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
  /// A dag task depends on a task that is not part of the dag.
  #[error("task '{task_id}' depends on unknown task '{dependency}'")]
  UnknownDependency { task_id: String, dependency: String },

  /// The dependencies of a dag loop back on themselves.
  #[error("dag '{task_id}' has a dependency cycle through {tasks:?}")]
  Cycle { task_id: String, tasks: Vec<String> },

  /// An expression of a flowable task failed to render.
  #[error("failed to render expression of task '{task_id}': {source}")]
  Render {
    task_id: String,
    #[source]
    source: RenderError,
  },

  /// A rendered each value is not a usable list of values.
  #[error("invalid value for task '{task_id}': {message}")]
  InvalidValue { task_id: String, message: String },

  /// A task run refers to a task missing from its flow.
  #[error("task '{task_id}' not found in flow '{flow_id}'")]
  TaskNotFound { flow_id: String, task_id: String },

  #[error(transparent)]
  Flow(#[from] FlowError),

  #[error(transparent)]
  Model(#[from] ModelError),
}
