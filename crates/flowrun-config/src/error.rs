use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
  #[error("flow '{0}' has no tasks")]
  NoTasks(String),

  #[error("duplicate task id: {0}")]
  DuplicateTaskId(String),

  #[error("task '{task_id}' has an invalid retry policy: {message}")]
  InvalidRetry { task_id: String, message: String },

  #[error("task '{task_id}' is invalid: {message}")]
  InvalidTask { task_id: String, message: String },
}
