use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling settings shared by every consumer of a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Delay before polling again after an empty read.
  pub poll_interval_ms: u64,
  /// Upper bound of the random delay added to `poll_interval_ms`.
  pub poll_jitter_ms: u64,
  /// Messages claimed or read at once.
  pub batch_size: usize,
  /// A claim not acknowledged after this long is handed out again.
  pub visibility_timeout_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      poll_interval_ms: 100,
      poll_jitter_ms: 50,
      batch_size: 16,
      visibility_timeout_ms: 60_000,
    }
  }
}

impl QueueConfig {
  pub fn visibility_timeout(&self) -> Duration {
    Duration::from_millis(self.visibility_timeout_ms)
  }

  /// Idle delay, jittered so that pollers don't wake up together.
  pub fn idle_delay(&self) -> Duration {
    let jitter = if self.poll_jitter_ms == 0 {
      0
    } else {
      rand::random::<u64>() % (self.poll_jitter_ms + 1)
    };
    Duration::from_millis(self.poll_interval_ms + jitter)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_idle_delay_is_bounded() {
    let config = QueueConfig {
      poll_interval_ms: 10,
      poll_jitter_ms: 5,
      ..Default::default()
    };

    for _ in 0..100 {
      let delay = config.idle_delay();
      assert!(delay >= Duration::from_millis(10));
      assert!(delay <= Duration::from_millis(15));
    }
  }

  #[test]
  fn test_partial_config() {
    let config: QueueConfig = serde_json::from_str(r#"{ "batch_size": 4 }"#).unwrap();
    assert_eq!(config.batch_size, 4);
    assert_eq!(config.poll_interval_ms, 100);
  }
}
