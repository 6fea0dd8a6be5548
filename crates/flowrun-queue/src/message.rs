use std::fmt;

use flowrun_config::Flow;
use flowrun_model::{
  Execution, ExecutionKilled, WorkerInstance, WorkerJobRunning, WorkerTask, WorkerTaskResult,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The logs a backend keeps, one per kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
  Execution,
  WorkerTask,
  WorkerTaskResult,
  ExecutionKilled,
  Trigger,
  Flow,
  WorkerInstance,
  WorkerJobRunning,
}

impl QueueType {
  pub fn as_str(self) -> &'static str {
    match self {
      QueueType::Execution => "execution",
      QueueType::WorkerTask => "worker_task",
      QueueType::WorkerTaskResult => "worker_task_result",
      QueueType::ExecutionKilled => "execution_killed",
      QueueType::Trigger => "trigger",
      QueueType::Flow => "flow",
      QueueType::WorkerInstance => "worker_instance",
      QueueType::WorkerJobRunning => "worker_job_running",
    }
  }
}

impl fmt::Display for QueueType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A value that can travel through a [`crate::Queue`].
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
  /// The log the messages are written to.
  const TYPE: QueueType;

  /// Key of the message, usually the id of what it describes.
  fn key(&self) -> String;
}

impl QueueMessage for Execution {
  const TYPE: QueueType = QueueType::Execution;

  fn key(&self) -> String {
    self.id.clone()
  }
}

impl QueueMessage for WorkerTask {
  const TYPE: QueueType = QueueType::WorkerTask;

  fn key(&self) -> String {
    self.task_run.id.clone()
  }
}

impl QueueMessage for WorkerTaskResult {
  const TYPE: QueueType = QueueType::WorkerTaskResult;

  fn key(&self) -> String {
    self.task_run.id.clone()
  }
}

impl QueueMessage for ExecutionKilled {
  const TYPE: QueueType = QueueType::ExecutionKilled;

  fn key(&self) -> String {
    self.execution_id.clone()
  }
}

impl QueueMessage for Flow {
  const TYPE: QueueType = QueueType::Flow;

  fn key(&self) -> String {
    self.uid()
  }
}

impl QueueMessage for WorkerInstance {
  const TYPE: QueueType = QueueType::WorkerInstance;

  fn key(&self) -> String {
    self.worker_uuid.to_string()
  }
}

impl QueueMessage for WorkerJobRunning {
  const TYPE: QueueType = QueueType::WorkerJobRunning;

  fn key(&self) -> String {
    self.task_run_id.clone()
  }
}
