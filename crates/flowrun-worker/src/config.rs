use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Maximum number of tasks running at once.
  pub concurrency: usize,
  /// Only run the tasks of this worker group. None runs the tasks without a
  /// group.
  pub worker_group: Option<String>,
  /// Timeout of the tasks that don't set their own.
  pub default_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      concurrency: 8,
      worker_group: None,
      default_timeout_ms: None,
    }
  }
}

impl WorkerConfig {
  /// Timeout of a task, its own first.
  pub fn timeout(&self, task_timeout_ms: Option<u64>) -> Option<Duration> {
    task_timeout_ms
      .or(self.default_timeout_ms)
      .map(Duration::from_millis)
  }
}
