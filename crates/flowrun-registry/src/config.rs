use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker liveness and partitioning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
  pub heartbeat_interval_ms: u64,
  /// Heartbeats an instance may miss before it is considered dead.
  pub missed_heartbeats: u32,
  /// Partitions shared by the instances of each worker group.
  pub partitions: i32,
  /// How often the liveness monitor looks for dead instances.
  pub liveness_check_interval_ms: u64,
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self {
      heartbeat_interval_ms: 2_000,
      missed_heartbeats: 3,
      partitions: 16,
      liveness_check_interval_ms: 2_000,
    }
  }
}

impl RegistryConfig {
  pub fn heartbeat_interval(&self) -> Duration {
    Duration::from_millis(self.heartbeat_interval_ms)
  }

  pub fn liveness_check_interval(&self) -> Duration {
    Duration::from_millis(self.liveness_check_interval_ms)
  }

  /// An instance whose last heartbeat is older than this is dead.
  pub fn expiry(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(
      self.heartbeat_interval_ms as i64 * i64::from(self.missed_heartbeats),
    )
  }
}
