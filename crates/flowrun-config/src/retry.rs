use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_delay_factor() -> f64 {
  2.0
}

/// Delay strategy between two attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryBackoff {
  Constant {
    interval_ms: u64,
  },
  Exponential {
    interval_ms: u64,
    max_interval_ms: u64,
    #[serde(default = "default_delay_factor")]
    delay_factor: f64,
  },
}

/// When and how often a failed task is attempted again.
///
/// At least one of `max_attempt` and `max_duration_ms` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  #[serde(flatten)]
  pub backoff: RetryBackoff,
  /// Total number of attempts, the first one included.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_attempt: Option<u32>,
  /// Upper bound on the time between the first attempt and the next retry.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_duration_ms: Option<u64>,
  /// End in WARNING when the task only succeeded after a retry.
  #[serde(default)]
  pub warning_on_retry: bool,
}

impl RetryPolicy {
  pub fn constant(interval: Duration, max_attempt: u32) -> Self {
    Self {
      backoff: RetryBackoff::Constant {
        interval_ms: interval.as_millis() as u64,
      },
      max_attempt: Some(max_attempt),
      max_duration_ms: None,
      warning_on_retry: false,
    }
  }

  /// Delay before the attempt following `attempts` finished attempts.
  pub fn next_delay(&self, attempts: u32) -> Duration {
    match &self.backoff {
      RetryBackoff::Constant { interval_ms } => Duration::from_millis(*interval_ms),
      RetryBackoff::Exponential {
        interval_ms,
        max_interval_ms,
        delay_factor,
      } => {
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let delay = (*interval_ms as f64) * delay_factor.powi(exponent);
        Duration::from_millis(delay.min(*max_interval_ms as f64) as u64)
      }
    }
  }

  /// Whether another attempt is allowed after `attempts` finished attempts,
  /// `elapsed` being the time since the first one started.
  pub fn should_retry(&self, attempts: u32, elapsed: Duration) -> bool {
    if self.max_attempt.is_some_and(|max| attempts >= max) {
      return false;
    }

    self.max_duration_ms.is_none_or(|max_duration_ms| {
      elapsed + self.next_delay(attempts) <= Duration::from_millis(max_duration_ms)
    })
  }

  pub(crate) fn check(&self) -> Result<(), String> {
    if self.max_attempt.is_none() && self.max_duration_ms.is_none() {
      return Err("one of max_attempt or max_duration_ms is required".to_string());
    }
    if self.max_attempt == Some(0) {
      return Err("max_attempt must be at least 1".to_string());
    }
    if let RetryBackoff::Exponential {
      interval_ms,
      max_interval_ms,
      delay_factor,
    } = &self.backoff
    {
      if max_interval_ms < interval_ms {
        return Err("max_interval_ms is lower than interval_ms".to_string());
      }
      if *delay_factor < 1.0 {
        return Err("delay_factor must be at least 1".to_string());
      }
    }
    Ok(())
  }
}
