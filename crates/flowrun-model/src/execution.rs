use std::collections::HashSet;

use flowrun_config::Flow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ModelError;
use crate::resolved::ResolvedTask;
use crate::state::{State, StateType};
use crate::task_run::TaskRun;

/// One run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
  pub id: String,
  pub namespace: String,
  pub flow_id: String,
  pub flow_revision: u32,
  pub state: State,
  #[serde(default)]
  pub task_run_list: Vec<TaskRun>,
  #[serde(default)]
  pub inputs: Map<String, Value>,
}

impl Execution {
  /// A new CREATED execution of `flow`.
  pub fn new(flow: &Flow, inputs: Map<String, Value>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      namespace: flow.namespace.clone(),
      flow_id: flow.id.clone(),
      flow_revision: flow.revision,
      state: State::new(),
      task_run_list: Vec::new(),
      inputs,
    }
  }

  pub fn with_state(&self, state: StateType) -> Self {
    Self {
      state: self.state.with_state(state),
      ..self.clone()
    }
  }

  /// Replace the stored task run having the same id.
  pub fn with_task_run(&self, task_run: TaskRun) -> Result<Self, ModelError> {
    let index = self
      .task_run_list
      .iter()
      .position(|current| current.id == task_run.id)
      .ok_or_else(|| ModelError::InvariantViolation {
        execution_id: self.id.clone(),
        message: format!("can't replace missing task run '{}'", task_run.id),
      })?;

    let mut task_run_list = self.task_run_list.clone();
    task_run_list[index] = task_run;

    Ok(self.with_task_run_list(task_run_list))
  }

  pub fn with_task_run_list(&self, task_run_list: Vec<TaskRun>) -> Self {
    Self {
      task_run_list,
      ..self.clone()
    }
  }

  /// Leave a terminal state to run again with `task_run_list`.
  pub fn with_restart(&self, task_run_list: Vec<TaskRun>) -> Self {
    Self {
      state: self.state.restart(),
      task_run_list,
      ..self.clone()
    }
  }

  pub fn find_task_run_by_task_run_id(&self, id: &str) -> Result<&TaskRun, ModelError> {
    self
      .task_run_list
      .iter()
      .find(|task_run| task_run.id == id)
      .ok_or_else(|| ModelError::InvariantViolation {
        execution_id: self.id.clone(),
        message: format!("task run '{}' not found", id),
      })
  }

  /// Task runs instantiating one of `tasks`, in creation order.
  pub fn find_task_run_by_tasks(&self, tasks: &[ResolvedTask]) -> Vec<&TaskRun> {
    self
      .task_run_list
      .iter()
      .filter(|task_run| tasks.iter().any(|task| task.is_task_run_for(task_run)))
      .collect()
  }

  pub fn find_last_created(&self, tasks: &[ResolvedTask]) -> Option<&TaskRun> {
    self.find_last(tasks, |t| t.state.is_created())
  }

  pub fn find_last_running(&self, tasks: &[ResolvedTask]) -> Option<&TaskRun> {
    self.find_last(tasks, |t| t.state.is_running())
  }

  pub fn find_last_terminated(&self, tasks: &[ResolvedTask]) -> Option<&TaskRun> {
    self.find_last(tasks, |t| t.state.is_terminated())
  }

  fn find_last(&self, tasks: &[ResolvedTask], predicate: impl Fn(&TaskRun) -> bool) -> Option<&TaskRun> {
    self
      .find_task_run_by_tasks(tasks)
      .into_iter()
      .rev()
      .find(|task_run| predicate(task_run))
  }

  /// Every task of `tasks` has a terminated task run.
  pub fn is_terminated(&self, tasks: &[ResolvedTask]) -> bool {
    let terminated = self
      .find_task_run_by_tasks(tasks)
      .into_iter()
      .filter(|task_run| task_run.state.is_terminated())
      .count();

    terminated == tasks.len()
  }

  pub fn has_failed(&self, tasks: &[ResolvedTask]) -> bool {
    self
      .find_task_run_by_tasks(tasks)
      .iter()
      .any(|task_run| task_run.state.is_failed())
  }

  /// Some task run of `tasks` is not terminated yet.
  pub fn has_pending(&self, tasks: &[ResolvedTask]) -> bool {
    self
      .find_task_run_by_tasks(tasks)
      .iter()
      .any(|task_run| !task_run.state.is_terminated())
  }

  pub fn has_created(&self) -> bool {
    self.task_run_list.iter().any(|t| t.state.is_created())
  }

  pub fn has_running(&self) -> bool {
    self
      .task_run_list
      .iter()
      .any(|t| t.state.is_running() || t.state.is_retrying())
  }

  /// Select the branch to resolve in a scope.
  ///
  /// Disabled tasks are dropped. As soon as a normal task failed, or an
  /// error task was already started, the error branch is returned (possibly
  /// empty) and never switches back.
  pub fn find_task_depending_flow_state(
    &self,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
  ) -> Vec<ResolvedTask> {
    let tasks = remove_disabled(tasks);
    let errors = remove_disabled(errors);

    if !self.find_task_run_by_tasks(&errors).is_empty() || self.has_failed(&tasks) {
      return errors;
    }

    tasks
  }

  /// Outcome of a scope from the task runs of `tasks`.
  ///
  /// The worst outcome wins: KILLED, CANCELLED, FAILED, WARNING then PAUSED, otherwise
  /// SUCCESS. With `allow_failure` a FAILED scope ends in WARNING.
  pub fn guess_final_state(&self, tasks: &[ResolvedTask], allow_failure: bool) -> StateType {
    let task_runs = self.find_task_run_by_tasks(tasks);
    let has = |state: StateType| task_runs.iter().any(|t| t.state.current == state);

    let state = [
      StateType::Killed,
      StateType::Cancelled,
      StateType::Failed,
      StateType::Warning,
      StateType::Paused,
    ]
    .into_iter()
    .find(|state| has(*state))
    .unwrap_or(StateType::Success);

    if state == StateType::Failed && allow_failure {
      StateType::Warning
    } else {
      state
    }
  }

  /// Ancestors of `task_run`, root first.
  pub fn find_parents(&self, task_run: &TaskRun) -> Vec<&TaskRun> {
    let mut parents = Vec::new();
    let mut visited = HashSet::from([task_run.id.as_str()]);
    let mut parent_id = task_run.parent_task_run_id.as_deref();

    while let Some(id) = parent_id {
      let Some(parent) = self.task_run_list.iter().find(|t| t.id == id) else {
        break;
      };
      if !visited.insert(parent.id.as_str()) {
        break;
      }
      parents.push(parent);
      parent_id = parent.parent_task_run_id.as_deref();
    }

    parents.reverse();
    parents
  }

  /// Direct children of the task run `id`.
  pub fn find_children(&self, id: &str) -> Vec<&TaskRun> {
    self
      .task_run_list
      .iter()
      .filter(|t| t.parent_task_run_id.as_deref() == Some(id))
      .collect()
  }

  /// Values of the ancestors of `task_run` that carry one, root first.
  pub fn find_parents_values(&self, task_run: &TaskRun) -> Vec<String> {
    self
      .find_parents(task_run)
      .into_iter()
      .filter_map(|t| t.value.clone())
      .collect()
  }

  /// Whether `task_run`, reported by a worker, carries progress not yet
  /// stored in this execution.
  pub fn has_task_run_joinable(&self, task_run: &TaskRun) -> bool {
    let Some(current) = self.task_run_list.iter().find(|t| t.is_same(task_run)) else {
      return true;
    };

    if current.state.is_terminated() {
      return false;
    }

    if task_run.attempts.len() > current.attempts.len() {
      return true;
    }

    if current.state.current == task_run.state.current {
      return false;
    }

    current.state.histories.len() <= task_run.state.histories.len()
  }

  /// Mark every unfinished ancestor of `task_run` KILLED.
  pub fn kill_parent_task_runs(&self, task_run: &TaskRun) -> Result<Self, ModelError> {
    let mut execution = self.clone();
    let parents: Vec<TaskRun> = self.find_parents(task_run).into_iter().cloned().collect();

    for parent in parents {
      if !parent.state.is_terminated() {
        execution = execution.with_task_run(parent.with_state(StateType::Killed))?;
      }
    }

    Ok(execution)
  }

  /// Outputs of every task run, nested by task id then by the values of the
  /// task run and its ancestors.
  pub fn outputs(&self) -> Map<String, Value> {
    let mut result = Map::new();

    for task_run in &self.task_run_list {
      if task_run.outputs.is_empty() {
        continue;
      }

      let mut nested = Value::Object(task_run.outputs.clone());
      if let Some(value) = &task_run.value {
        nested = single(value, nested);
      }
      for value in self.find_parents_values(task_run).iter().rev() {
        nested = single(value, nested);
      }

      merge(&mut result, single(&task_run.task_id, nested));
    }

    result
  }
}

fn remove_disabled(tasks: &[ResolvedTask]) -> Vec<ResolvedTask> {
  tasks.iter().filter(|t| !t.task.disabled).cloned().collect()
}

fn single(key: &str, value: Value) -> Value {
  let mut map = Map::new();
  map.insert(key.to_string(), value);
  Value::Object(map)
}

fn merge(into: &mut Map<String, Value>, from: Value) {
  let Value::Object(from) = from else {
    return;
  };

  for (key, value) in from {
    match (into.get_mut(&key), value) {
      (Some(Value::Object(existing)), Value::Object(incoming)) => {
        merge(existing, Value::Object(incoming));
      }
      (_, value) => {
        into.insert(key, value);
      }
    }
  }
}
