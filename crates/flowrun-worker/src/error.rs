use flowrun_queue::QueueError;
use flowrun_registry::RegistryError;
use flowrun_resolver::RenderError;

/// Errors a task can end with.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
  /// The task logic reported a failure.
  #[error("{0}")]
  Failed(String),

  /// No task logic has that name.
  #[error("unknown runner '{0}'")]
  UnknownRunner(String),

  /// A property is missing or has the wrong type.
  #[error("invalid property '{name}': {message}")]
  InvalidProperty { name: String, message: String },

  /// A property failed to render.
  #[error("failed to render properties: {0}")]
  Render(#[from] RenderError),

  /// The task ran past its deadline.
  #[error("task timed out after {0:?}")]
  Timeout(std::time::Duration),

  /// The task is not a runnable task.
  #[error("task '{0}' can't run on a worker")]
  NotRunnable(String),
}

/// Errors of the worker itself.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error(transparent)]
  Registry(#[from] RegistryError),
}
