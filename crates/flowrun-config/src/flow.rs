use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::task::Task;

/// A flow definition: root tasks run one after the other, `errors` run
/// instead of the remaining root tasks once one of them failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
  pub namespace: String,
  pub id: String,
  #[serde(default = "default_revision")]
  pub revision: u32,
  pub tasks: Vec<Task>,
  #[serde(default)]
  pub errors: Vec<Task>,
}

fn default_revision() -> u32 {
  1
}

impl Flow {
  pub fn new(namespace: impl Into<String>, id: impl Into<String>, tasks: Vec<Task>) -> Self {
    Self {
      namespace: namespace.into(),
      id: id.into(),
      revision: default_revision(),
      tasks,
      errors: Vec::new(),
    }
  }

  pub fn with_errors(mut self, errors: Vec<Task>) -> Self {
    self.errors = errors;
    self
  }

  /// Key identifying one revision of the flow.
  pub fn uid(&self) -> String {
    format!("{}_{}_{}", self.namespace, self.id, self.revision)
  }

  /// Every task of the flow, depth first, error branches included.
  pub fn all_tasks(&self) -> Vec<&Task> {
    fn collect<'a>(task: &'a Task, into: &mut Vec<&'a Task>) {
      into.push(task);
      for child in task.all_child_tasks() {
        collect(child, into);
      }
    }

    let mut tasks = Vec::new();
    for task in self.tasks.iter().chain(&self.errors) {
      collect(task, &mut tasks);
    }
    tasks
  }

  pub fn find_task(&self, task_id: &str) -> Option<&Task> {
    self
      .tasks
      .iter()
      .chain(&self.errors)
      .find_map(|task| task.find(task_id))
  }

  /// Structural checks: at least one task, unique ids, sane retry policies.
  pub fn validate(&self) -> Result<(), FlowError> {
    if self.tasks.is_empty() {
      return Err(FlowError::NoTasks(self.id.clone()));
    }

    let mut seen = HashSet::new();
    for task in self.all_tasks() {
      if !seen.insert(task.id.as_str()) {
        return Err(FlowError::DuplicateTaskId(task.id.clone()));
      }
      if let Some(retry) = &task.retry {
        retry.check().map_err(|message| FlowError::InvalidRetry {
          task_id: task.id.clone(),
          message,
        })?;
      }
      if task.timeout_ms == Some(0) {
        return Err(FlowError::InvalidTask {
          task_id: task.id.clone(),
          message: "timeout_ms must be positive".to_string(),
        });
      }
    }

    Ok(())
  }
}
