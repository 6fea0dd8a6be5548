use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  /// Upper bound on the passes of one processing run. An execution still
  /// changing after that many passes is failed.
  pub max_process_iterations: u32,
  /// How many times an update is replayed after a concurrent write.
  pub conflict_retries: u32,
  /// Period of the removal of handled executions and results from their
  /// queues. 0 keeps everything.
  pub trim_interval_ms: u64,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      max_process_iterations: 1000,
      conflict_retries: 10,
      trim_interval_ms: 60_000,
    }
  }
}

impl ExecutorConfig {
  pub fn trim_interval(&self) -> Option<Duration> {
    (self.trim_interval_ms > 0).then(|| Duration::from_millis(self.trim_interval_ms))
  }
}
