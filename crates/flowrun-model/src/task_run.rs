use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::Execution;
use crate::resolved::ResolvedTask;
use crate::state::{State, StateType};

/// One try of a task run on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
  pub state: State,
}

impl TaskRunAttempt {
  pub fn of(state: StateType) -> Self {
    Self {
      state: State::of(state),
    }
  }

  pub fn with_state(&self, state: StateType) -> Self {
    Self {
      state: self.state.with_state(state),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
  pub id: String,
  pub execution_id: String,
  pub namespace: String,
  pub flow_id: String,
  pub task_id: String,
  pub parent_task_run_id: Option<String>,
  pub value: Option<String>,
  #[serde(default)]
  pub attempts: Vec<TaskRunAttempt>,
  #[serde(default)]
  pub outputs: serde_json::Map<String, serde_json::Value>,
  pub state: State,
  #[serde(default)]
  pub iteration: u32,
  /// Set while RETRYING: the next attempt must not start before.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_retry_date: Option<DateTime<Utc>>,
}

impl TaskRun {
  /// A new CREATED task run for `resolved` in `execution`.
  pub fn of(execution: &Execution, resolved: &ResolvedTask) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      execution_id: execution.id.clone(),
      namespace: execution.namespace.clone(),
      flow_id: execution.flow_id.clone(),
      task_id: resolved.task.id.clone(),
      parent_task_run_id: resolved.parent_id.clone(),
      value: resolved.value.clone(),
      attempts: Vec::new(),
      outputs: serde_json::Map::new(),
      state: State::new(),
      iteration: 0,
      next_retry_date: None,
    }
  }

  pub fn with_state(&self, state: StateType) -> Self {
    Self {
      state: self.state.with_state(state),
      ..self.clone()
    }
  }

  pub fn with_attempts(&self, attempts: Vec<TaskRunAttempt>) -> Self {
    Self {
      attempts,
      ..self.clone()
    }
  }

  pub fn with_outputs(&self, outputs: serde_json::Map<String, serde_json::Value>) -> Self {
    Self {
      outputs,
      ..self.clone()
    }
  }

  pub fn last_attempt(&self) -> Option<&TaskRunAttempt> {
    self.attempts.last()
  }

  pub fn attempt_count(&self) -> u32 {
    self.attempts.len() as u32
  }

  /// Same instance of the same task, whatever its progress.
  pub fn is_same(&self, other: &TaskRun) -> bool {
    self.id == other.id && self.value == other.value && self.iteration == other.iteration
  }

  /// Prepare a task run whose worker vanished to be dispatched again.
  ///
  /// The attempt the worker was running is marked KILLED (or a KILLED
  /// attempt is recorded if none is open) so the next worker starts a new
  /// attempt. The task run state itself is untouched.
  pub fn on_running_resend(&self) -> Self {
    let mut attempts = self.attempts.clone();

    match attempts.last_mut() {
      Some(last) if !last.state.is_terminated() => {
        *last = last.with_state(StateType::Killed);
      }
      _ => attempts.push(TaskRunAttempt::of(StateType::Killed)),
    }

    self.with_attempts(attempts)
  }

  /// Record a FAILED attempt and fail the task run.
  pub fn fail(&self) -> Self {
    let mut attempts = self.attempts.clone();
    match attempts.last_mut() {
      Some(last) if !last.state.is_terminated() => {
        *last = last.with_state(StateType::Failed);
      }
      _ => attempts.push(TaskRunAttempt::of(StateType::Failed)),
    }

    Self {
      attempts,
      state: self.state.with_state(StateType::Failed),
      ..self.clone()
    }
  }

  /// Schedule another attempt at `date`, leaving a FAILED state.
  pub fn retry(&self, date: DateTime<Utc>) -> Self {
    Self {
      state: self.state.retry(),
      next_retry_date: Some(date),
      ..self.clone()
    }
  }

  /// Move back to RESTARTED so the task run is dispatched again.
  pub fn restart(&self) -> Self {
    Self {
      state: self.state.restart(),
      next_retry_date: None,
      ..self.clone()
    }
  }

  /// Human readable identity for logs.
  pub fn describe(&self) -> String {
    match &self.value {
      Some(value) => format!("{}[{}]", self.task_id, value),
      None => self.task_id.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn task_run() -> TaskRun {
    TaskRun {
      id: "tr".to_string(),
      execution_id: "ex".to_string(),
      namespace: "io.flowrun".to_string(),
      flow_id: "f".to_string(),
      task_id: "t".to_string(),
      parent_task_run_id: None,
      value: None,
      attempts: Vec::new(),
      outputs: serde_json::Map::new(),
      state: State::new(),
      iteration: 0,
      next_retry_date: None,
    }
  }

  #[test]
  fn test_on_running_resend_without_attempt() {
    let resent = task_run().with_state(StateType::Running).on_running_resend();

    assert_eq!(resent.attempts.len(), 1);
    assert_eq!(resent.attempts[0].state.current, StateType::Killed);
    assert_eq!(resent.state.current, StateType::Running);
  }

  #[test]
  fn test_on_running_resend_kills_open_attempt() {
    let running = task_run()
      .with_state(StateType::Running)
      .with_attempts(vec![TaskRunAttempt::of(StateType::Running)]);

    let resent = running.on_running_resend();
    assert_eq!(resent.attempts.len(), 1);
    assert_eq!(resent.attempts[0].state.current, StateType::Killed);
  }

  #[test]
  fn test_on_running_resend_after_terminated_attempt() {
    let running = task_run()
      .with_state(StateType::Running)
      .with_attempts(vec![TaskRunAttempt::of(StateType::Failed)]);

    let resent = running.on_running_resend();
    assert_eq!(resent.attempts.len(), 2);
    assert_eq!(resent.attempts[1].state.current, StateType::Killed);
  }

  #[test]
  fn test_fail_records_attempt() {
    let failed = task_run().fail();

    assert_eq!(failed.state.current, StateType::Failed);
    assert_eq!(failed.attempt_count(), 1);
  }

  #[test]
  fn test_is_same_ignores_progress() {
    let a = task_run();
    let b = a.with_state(StateType::Running);
    let mut c = a.clone();
    c.value = Some("x".to_string());

    assert!(a.is_same(&b));
    assert!(!a.is_same(&c));
  }
}
