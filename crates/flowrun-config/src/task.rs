use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

fn is_false(value: &bool) -> bool {
  !*value
}

/// A node of a flow.
///
/// Common settings live here; what the node actually does is described by
/// its [`TaskKind`], flattened into the same JSON object under `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  #[serde(flatten)]
  pub kind: TaskKind,
  #[serde(default, skip_serializing_if = "is_false")]
  pub disabled: bool,
  /// A failure of this task ends it in WARNING instead of FAILED.
  #[serde(default, skip_serializing_if = "is_false")]
  pub allow_failure: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryPolicy>,
  /// Restricts the task to workers of the named group.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub worker_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
  /// Executed by a worker.
  Runnable(Runnable),
  Sequential(Sequential),
  Parallel(Parallel),
  Dag(Dag),
  EachSequential(EachSequential),
  EachParallel(EachParallel),
  If(If),
  Switch(Switch),
}

/// A leaf task. `runner` names the task logic a worker should invoke,
/// `properties` are rendered against the execution before the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runnable {
  pub runner: String,
  #[serde(default)]
  pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequential {
  pub tasks: Vec<Task>,
  #[serde(default)]
  pub errors: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parallel {
  pub tasks: Vec<Task>,
  #[serde(default)]
  pub errors: Vec<Task>,
  /// Maximum number of children running at once, 0 for unbounded.
  #[serde(default)]
  pub concurrency: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagTask {
  pub task: Task,
  #[serde(default)]
  pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
  pub tasks: Vec<DagTask>,
  #[serde(default)]
  pub errors: Vec<Task>,
  #[serde(default)]
  pub concurrency: u32,
}

/// Runs `tasks` once per value, one value after the other.
///
/// `value` is either a JSON array or a template rendering to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EachSequential {
  pub value: serde_json::Value,
  pub tasks: Vec<Task>,
  #[serde(default)]
  pub errors: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EachParallel {
  pub value: serde_json::Value,
  pub tasks: Vec<Task>,
  #[serde(default)]
  pub errors: Vec<Task>,
  #[serde(default)]
  pub concurrency: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct If {
  pub condition: String,
  #[serde(default)]
  pub then: Vec<Task>,
  #[serde(default, rename = "else")]
  pub else_tasks: Vec<Task>,
  #[serde(default)]
  pub errors: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
  pub value: String,
  #[serde(default)]
  pub cases: BTreeMap<String, Vec<Task>>,
  #[serde(default)]
  pub defaults: Vec<Task>,
  #[serde(default)]
  pub errors: Vec<Task>,
}

impl Task {
  /// Create an enabled task with default settings.
  pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
    Self {
      id: id.into(),
      kind,
      disabled: false,
      allow_failure: false,
      timeout_ms: None,
      retry: None,
      worker_group: None,
    }
  }

  /// Shorthand for a runnable task.
  pub fn runnable(id: impl Into<String>, runner: impl Into<String>) -> Self {
    Self::new(
      id,
      TaskKind::Runnable(Runnable {
        runner: runner.into(),
        properties: serde_json::Map::new(),
      }),
    )
  }

  pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    if let TaskKind::Runnable(runnable) = &mut self.kind {
      runnable.properties.insert(key.into(), value);
    }
    self
  }

  pub fn is_flowable(&self) -> bool {
    !matches!(self.kind, TaskKind::Runnable(_))
  }

  /// The type tag of the task, as written in the definition.
  pub fn type_name(&self) -> &'static str {
    match self.kind {
      TaskKind::Runnable(_) => "runnable",
      TaskKind::Sequential(_) => "sequential",
      TaskKind::Parallel(_) => "parallel",
      TaskKind::Dag(_) => "dag",
      TaskKind::EachSequential(_) => "each_sequential",
      TaskKind::EachParallel(_) => "each_parallel",
      TaskKind::If(_) => "if",
      TaskKind::Switch(_) => "switch",
    }
  }

  /// Every direct child, whatever branch it belongs to (errors included).
  pub fn all_child_tasks(&self) -> Vec<&Task> {
    match &self.kind {
      TaskKind::Runnable(_) => Vec::new(),
      TaskKind::Sequential(t) => t.tasks.iter().chain(&t.errors).collect(),
      TaskKind::Parallel(t) => t.tasks.iter().chain(&t.errors).collect(),
      TaskKind::Dag(t) => t.tasks.iter().map(|d| &d.task).chain(&t.errors).collect(),
      TaskKind::EachSequential(t) => t.tasks.iter().chain(&t.errors).collect(),
      TaskKind::EachParallel(t) => t.tasks.iter().chain(&t.errors).collect(),
      TaskKind::If(t) => t.then.iter().chain(&t.else_tasks).chain(&t.errors).collect(),
      TaskKind::Switch(t) => t
        .defaults
        .iter()
        .chain(t.cases.values().flatten())
        .chain(&t.errors)
        .collect(),
    }
  }

  /// Depth-first search for a task by id, this task included.
  pub fn find(&self, task_id: &str) -> Option<&Task> {
    if self.id == task_id {
      return Some(self);
    }
    self
      .all_child_tasks()
      .into_iter()
      .find_map(|child| child.find(task_id))
  }
}
