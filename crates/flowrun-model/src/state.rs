use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Type of a [`State`].
///
/// The set is split in two: terminal types end the life of a task run or an
/// execution, every other type may still change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
  Created,
  Queued,
  Running,
  Paused,
  Restarted,
  Killing,
  Retrying,
  Success,
  Warning,
  Failed,
  Killed,
  Cancelled,
  Skipped,
}

impl StateType {
  pub fn is_terminated(self) -> bool {
    matches!(
      self,
      StateType::Success
        | StateType::Warning
        | StateType::Failed
        | StateType::Killed
        | StateType::Cancelled
        | StateType::Skipped
    )
  }

  /// Running or being killed.
  pub fn is_running(self) -> bool {
    matches!(self, StateType::Running | StateType::Killing)
  }

  /// Waiting to be dispatched, either for the first time or after a restart.
  pub fn is_created(self) -> bool {
    matches!(self, StateType::Created | StateType::Restarted)
  }

  pub fn is_failed(self) -> bool {
    self == StateType::Failed
  }

  pub fn is_paused(self) -> bool {
    self == StateType::Paused
  }

  pub fn is_retrying(self) -> bool {
    self == StateType::Retrying
  }

  /// Terminal and not a failure: downstream work may depend on it.
  pub fn is_successful(self) -> bool {
    matches!(
      self,
      StateType::Success | StateType::Warning | StateType::Skipped
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      StateType::Created => "CREATED",
      StateType::Queued => "QUEUED",
      StateType::Running => "RUNNING",
      StateType::Paused => "PAUSED",
      StateType::Restarted => "RESTARTED",
      StateType::Killing => "KILLING",
      StateType::Retrying => "RETRYING",
      StateType::Success => "SUCCESS",
      StateType::Warning => "WARNING",
      StateType::Failed => "FAILED",
      StateType::Killed => "KILLED",
      StateType::Cancelled => "CANCELLED",
      StateType::Skipped => "SKIPPED",
    }
  }
}

impl fmt::Display for StateType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
  pub state: StateType,
  pub date: DateTime<Utc>,
}

/// A state type with the full chronology that led to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
  pub current: StateType,
  pub histories: Vec<History>,
}

impl Default for State {
  fn default() -> Self {
    Self::new()
  }
}

impl State {
  pub fn new() -> Self {
    Self::of(StateType::Created)
  }

  pub fn of(state: StateType) -> Self {
    Self {
      current: state,
      histories: vec![History {
        state,
        date: Utc::now(),
      }],
    }
  }

  /// Transition to `state`.
  ///
  /// Moving to the current type or leaving a terminal type is ignored: the
  /// same value is returned. Use [`State::restart`], [`State::retry`] or
  /// [`State::reset`] to leave a terminal type.
  pub fn with_state(&self, state: StateType) -> Self {
    if self.current == state {
      warn!(from = %self.current, to = %state, "ignoring transition to the same state");
      return self.clone();
    }

    if self.current.is_terminated() {
      warn!(from = %self.current, to = %state, "ignoring transition from a terminated state");
      return self.clone();
    }

    self.append(state)
  }

  /// Move to RESTARTED, whatever the current type.
  pub fn restart(&self) -> Self {
    self.append(StateType::Restarted)
  }

  /// Move a failed state to RETRYING.
  pub fn retry(&self) -> Self {
    self.append(StateType::Retrying)
  }

  /// Back to CREATED. The previous history is kept.
  pub fn reset(&self) -> Self {
    self.append(StateType::Created)
  }

  fn append(&self, state: StateType) -> Self {
    let now = Utc::now();
    // keep the history ordered even if the clock goes backward
    let date = self.max_date().map_or(now, |last| last.max(now));

    let mut histories = self.histories.clone();
    histories.push(History { state, date });

    Self {
      current: state,
      histories,
    }
  }

  pub fn is_terminated(&self) -> bool {
    self.current.is_terminated()
  }

  pub fn is_running(&self) -> bool {
    self.current.is_running()
  }

  pub fn is_created(&self) -> bool {
    self.current.is_created()
  }

  pub fn is_failed(&self) -> bool {
    self.current.is_failed()
  }

  pub fn is_paused(&self) -> bool {
    self.current.is_paused()
  }

  pub fn is_retrying(&self) -> bool {
    self.current.is_retrying()
  }

  /// Whether this state is `previous` with exactly one more transition.
  pub fn follows(&self, previous: &State) -> bool {
    self.histories.len() == previous.histories.len() + 1
      && self.histories.starts_with(&previous.histories)
  }

  pub fn start_date(&self) -> Option<DateTime<Utc>> {
    self.histories.first().map(|h| h.date)
  }

  pub fn max_date(&self) -> Option<DateTime<Utc>> {
    self.histories.last().map(|h| h.date)
  }

  /// Date of the terminal entry, if the state is terminated.
  pub fn end_date(&self) -> Option<DateTime<Utc>> {
    if self.is_terminated() {
      self.max_date()
    } else {
      None
    }
  }

  /// Time between the first entry and the end, or now while still running.
  pub fn duration(&self) -> chrono::Duration {
    match self.start_date() {
      Some(start) => self.end_date().unwrap_or_else(Utc::now) - start,
      None => chrono::Duration::zero(),
    }
  }
}
