use flowrun_config::Task;
use serde::{Deserialize, Serialize};

use crate::task_run::TaskRun;

/// A task instance that is allowed to exist in a scope.
///
/// `value` disambiguates the instances an each loop creates for the same
/// task, `parent_id` is the task run of the enclosing flowable (none at the
/// root of the flow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTask {
  pub task: Task,
  pub value: Option<String>,
  pub parent_id: Option<String>,
}

impl ResolvedTask {
  /// Root level tasks, without parent nor value.
  pub fn of(tasks: &[Task]) -> Vec<ResolvedTask> {
    tasks
      .iter()
      .map(|task| ResolvedTask {
        task: task.clone(),
        value: None,
        parent_id: None,
      })
      .collect()
  }

  /// Children of `parent`.
  pub fn children(tasks: &[Task], parent: &TaskRun) -> Vec<ResolvedTask> {
    tasks
      .iter()
      .map(|task| ResolvedTask {
        task: task.clone(),
        value: None,
        parent_id: Some(parent.id.clone()),
      })
      .collect()
  }

  /// Whether `task_run` is the instance of this resolved task.
  pub fn is_task_run_for(&self, task_run: &TaskRun) -> bool {
    self.task.id == task_run.task_id
      && self.parent_id == task_run.parent_task_run_id
      && self
        .value
        .as_ref()
        .is_none_or(|value| task_run.value.as_ref() == Some(value))
  }
}
