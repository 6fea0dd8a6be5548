//! Execution events and notifiers for observability.
//!
//! The executor emits an event for every persisted change so consumers can
//! follow progress, wait for an execution to end, stream to a UI, etc.

use flowrun_model::{Execution, StateType};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while an execution is driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A submitted execution was accepted.
  ExecutionCreated {
    execution_id: String,
    flow_id: String,
  },

  /// The execution moved to another state.
  ExecutionStateChanged {
    execution_id: String,
    state: StateType,
  },

  /// A task run was created.
  TaskRunCreated {
    execution_id: String,
    task_run_id: String,
    task_id: String,
    value: Option<String>,
  },

  /// A task run moved to another state.
  TaskRunStateChanged {
    execution_id: String,
    task_run_id: String,
    task_id: String,
    state: StateType,
  },

  /// The execution reached a terminal state.
  ExecutionTerminated { execution: Box<Execution> },
}

/// Trait for receiving execution events.
///
/// The executor calls `notify` for each event once the change is stored.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // NOTE: unbounded so a slow consumer never holds an execution lock.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

/// Events describing how `previous` became `current`.
pub(crate) fn diff(previous: Option<&Execution>, current: &Execution) -> Vec<ExecutionEvent> {
  let mut events = Vec::new();

  if previous.is_none() {
    events.push(ExecutionEvent::ExecutionCreated {
      execution_id: current.id.clone(),
      flow_id: current.flow_id.clone(),
    });
  }

  for task_run in &current.task_run_list {
    let before = previous.and_then(|p| p.task_run_list.iter().find(|t| t.id == task_run.id));
    match before {
      None => {
        events.push(ExecutionEvent::TaskRunCreated {
          execution_id: current.id.clone(),
          task_run_id: task_run.id.clone(),
          task_id: task_run.task_id.clone(),
          value: task_run.value.clone(),
        });
        if task_run.state.current != StateType::Created {
          events.push(task_run_state(current, task_run));
        }
      }
      Some(before) if before.state.current != task_run.state.current => {
        events.push(task_run_state(current, task_run));
      }
      Some(_) => {}
    }
  }

  if previous.is_none_or(|p| p.state.current != current.state.current) {
    events.push(ExecutionEvent::ExecutionStateChanged {
      execution_id: current.id.clone(),
      state: current.state.current,
    });
    if current.state.is_terminated() {
      events.push(ExecutionEvent::ExecutionTerminated {
        execution: Box::new(current.clone()),
      });
    }
  }

  events
}

fn task_run_state(execution: &Execution, task_run: &flowrun_model::TaskRun) -> ExecutionEvent {
  ExecutionEvent::TaskRunStateChanged {
    execution_id: execution.id.clone(),
    task_run_id: task_run.id.clone(),
    task_id: task_run.task_id.clone(),
    state: task_run.state.current,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowrun_config::{Flow, Task};
  use flowrun_model::{ResolvedTask, TaskRun};

  #[test]
  fn test_channel_notifier_forwards() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let notifier = ChannelNotifier::new(tx);

    notifier.notify(ExecutionEvent::ExecutionStateChanged {
      execution_id: "e".to_string(),
      state: StateType::Running,
    });

    assert!(matches!(
      rx.try_recv(),
      Ok(ExecutionEvent::ExecutionStateChanged { .. })
    ));
  }

  #[test]
  fn test_diff_reports_task_run_progress() {
    let flow = Flow::new("io.flowrun", "f", vec![Task::runnable("a", "log")]);
    let execution = Execution::new(&flow, Default::default());
    let task_run = TaskRun::of(&execution, &ResolvedTask::of(&flow.tasks)[0]);
    let before = execution
      .with_state(StateType::Running)
      .with_task_run_list(vec![task_run.clone()]);
    let after = before
      .with_task_run(task_run.with_state(StateType::Running).with_state(StateType::Success))
      .unwrap()
      .with_state(StateType::Success);

    let events = diff(Some(&before), &after);

    assert_eq!(events.len(), 3);
    assert!(matches!(
      &events[0],
      ExecutionEvent::TaskRunStateChanged { state: StateType::Success, .. }
    ));
    assert!(matches!(
      &events[2],
      ExecutionEvent::ExecutionTerminated { .. }
    ));
  }
}
