use std::collections::HashSet;

use flowrun_config::{
  Dag, EachParallel, EachSequential, Flow, If, Parallel, Sequential, Switch, Task, TaskKind,
};
use flowrun_model::{Execution, ResolvedTask, StateType, TaskRun};
use serde_json::Value;
use tracing::debug;

use crate::error::ResolverError;
use crate::graph::Graph;
use crate::nexts::{
  resolve_dag_nexts, resolve_parallel_nexts, resolve_scope_state, resolve_sequential_nexts,
};
use crate::render::{Renderer, is_truthy, variables};

/// What a flowable task is resolved against.
pub struct RunContext<'a> {
  pub flow: &'a Flow,
  pub execution: &'a Execution,
  pub renderer: &'a dyn Renderer,
}

impl<'a> RunContext<'a> {
  pub fn new(flow: &'a Flow, execution: &'a Execution, renderer: &'a dyn Renderer) -> Self {
    Self {
      flow,
      execution,
      renderer,
    }
  }

  fn render(&self, parent: &TaskRun, template: &str) -> Result<String, ResolverError> {
    let vars = variables(self.flow, self.execution, Some(parent));
    self
      .renderer
      .render(template, &vars)
      .map_err(|source| ResolverError::Render {
        task_id: parent.task_id.clone(),
        source,
      })
  }
}

/// A task that doesn't run on a worker but schedules its children.
pub trait Flowable {
  /// Tasks run instead of the remaining children once one failed.
  fn errors(&self) -> &[Task];

  /// Every child, whatever the branch.
  fn all_child_tasks(&self) -> Vec<&Task>;

  /// Children to run for the task run `parent`, expressions rendered.
  fn child_tasks(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<ResolvedTask>, ResolverError>;

  /// New task runs to create under `parent`.
  fn resolve_nexts(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<TaskRun>, ResolverError> {
    let children = self.child_tasks(ctx, parent)?;
    let errors = ResolvedTask::children(self.errors(), parent);
    Ok(resolve_sequential_nexts(ctx.execution, &children, &errors))
  }

  /// Final state of `parent`, once all the work below it is over.
  fn resolve_state(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
    allow_failure: bool,
  ) -> Result<Option<StateType>, ResolverError> {
    let children = self.child_tasks(ctx, parent)?;
    let errors = ResolvedTask::children(self.errors(), parent);
    Ok(resolve_scope_state(
      ctx.execution,
      &children,
      &errors,
      allow_failure,
    ))
  }
}

impl Flowable for Sequential {
  fn errors(&self) -> &[Task] {
    &self.errors
  }

  fn all_child_tasks(&self) -> Vec<&Task> {
    self.tasks.iter().chain(&self.errors).collect()
  }

  fn child_tasks(
    &self,
    _ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<ResolvedTask>, ResolverError> {
    Ok(ResolvedTask::children(&self.tasks, parent))
  }
}

impl Flowable for Parallel {
  fn errors(&self) -> &[Task] {
    &self.errors
  }

  fn all_child_tasks(&self) -> Vec<&Task> {
    self.tasks.iter().chain(&self.errors).collect()
  }

  fn child_tasks(
    &self,
    _ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<ResolvedTask>, ResolverError> {
    Ok(ResolvedTask::children(&self.tasks, parent))
  }

  fn resolve_nexts(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<TaskRun>, ResolverError> {
    let children = self.child_tasks(ctx, parent)?;
    let errors = ResolvedTask::children(&self.errors, parent);
    Ok(resolve_parallel_nexts(
      ctx.execution,
      &children,
      &errors,
      self.concurrency,
    ))
  }
}

impl Flowable for Dag {
  fn errors(&self) -> &[Task] {
    &self.errors
  }

  fn all_child_tasks(&self) -> Vec<&Task> {
    self
      .tasks
      .iter()
      .map(|d| &d.task)
      .chain(&self.errors)
      .collect()
  }

  fn child_tasks(
    &self,
    _ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<ResolvedTask>, ResolverError> {
    let tasks: Vec<Task> = self.tasks.iter().map(|d| d.task.clone()).collect();
    Ok(ResolvedTask::children(&tasks, parent))
  }

  fn resolve_nexts(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<TaskRun>, ResolverError> {
    Graph::new(&parent.task_id, &self.tasks)?;

    let children = self.child_tasks(ctx, parent)?;
    let errors = ResolvedTask::children(&self.errors, parent);
    Ok(resolve_dag_nexts(
      ctx.execution,
      &children,
      &errors,
      &self.tasks,
      self.concurrency,
    ))
  }
}

impl Flowable for EachSequential {
  fn errors(&self) -> &[Task] {
    &self.errors
  }

  fn all_child_tasks(&self) -> Vec<&Task> {
    self.tasks.iter().chain(&self.errors).collect()
  }

  fn child_tasks(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<ResolvedTask>, ResolverError> {
    each_child_tasks(ctx, parent, &self.value, &self.tasks)
  }
}

impl Flowable for EachParallel {
  fn errors(&self) -> &[Task] {
    &self.errors
  }

  fn all_child_tasks(&self) -> Vec<&Task> {
    self.tasks.iter().chain(&self.errors).collect()
  }

  fn child_tasks(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<ResolvedTask>, ResolverError> {
    each_child_tasks(ctx, parent, &self.value, &self.tasks)
  }

  fn resolve_nexts(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<TaskRun>, ResolverError> {
    let children = self.child_tasks(ctx, parent)?;
    let errors = ResolvedTask::children(&self.errors, parent);
    Ok(resolve_parallel_nexts(
      ctx.execution,
      &children,
      &errors,
      self.concurrency,
    ))
  }
}

impl Flowable for If {
  fn errors(&self) -> &[Task] {
    &self.errors
  }

  fn all_child_tasks(&self) -> Vec<&Task> {
    self
      .then
      .iter()
      .chain(&self.else_tasks)
      .chain(&self.errors)
      .collect()
  }

  fn child_tasks(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<ResolvedTask>, ResolverError> {
    let rendered = ctx.render(parent, &self.condition)?;
    let branch = if is_truthy(&rendered) {
      &self.then
    } else {
      &self.else_tasks
    };

    Ok(ResolvedTask::children(branch, parent))
  }
}

impl Flowable for Switch {
  fn errors(&self) -> &[Task] {
    &self.errors
  }

  fn all_child_tasks(&self) -> Vec<&Task> {
    self
      .defaults
      .iter()
      .chain(self.cases.values().flatten())
      .chain(&self.errors)
      .collect()
  }

  fn child_tasks(
    &self,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
  ) -> Result<Vec<ResolvedTask>, ResolverError> {
    let rendered = ctx.render(parent, &self.value)?;
    let branch = self.cases.get(rendered.trim()).unwrap_or(&self.defaults);

    Ok(ResolvedTask::children(branch, parent))
  }
}

/// One resolved task per (value, task) pair, values in order.
fn each_child_tasks(
  ctx: &RunContext<'_>,
  parent: &TaskRun,
  value: &Value,
  tasks: &[Task],
) -> Result<Vec<ResolvedTask>, ResolverError> {
  let values = each_values(ctx, parent, value)?;

  Ok(
    values
      .iter()
      .flat_map(|value| {
        tasks.iter().map(move |task| ResolvedTask {
          task: task.clone(),
          value: Some(value.clone()),
          parent_id: Some(parent.id.clone()),
        })
      })
      .collect(),
  )
}

/// The distinct values an each task iterates over.
///
/// `value` is either a JSON array, or a string rendered then parsed as one.
/// Strings are used as-is, any other item as its JSON text.
fn each_values(
  ctx: &RunContext<'_>,
  parent: &TaskRun,
  value: &Value,
) -> Result<Vec<String>, ResolverError> {
  let invalid = |message: String| ResolverError::InvalidValue {
    task_id: parent.task_id.clone(),
    message,
  };

  let items = match value {
    Value::Array(items) => items.clone(),
    Value::String(template) => {
      let rendered = ctx.render(parent, template)?;
      match serde_json::from_str::<Value>(&rendered) {
        Ok(Value::Array(items)) => items,
        Ok(other) => return Err(invalid(format!("expected a list, got {}", other))),
        Err(e) => return Err(invalid(format!("'{}' is not a JSON list: {}", rendered, e))),
      }
    }
    other => return Err(invalid(format!("expected a list, got {}", other))),
  };

  let mut seen = HashSet::new();
  let mut values = Vec::with_capacity(items.len());
  for item in items {
    let value = match item {
      Value::Null => return Err(invalid("null values are not allowed".to_string())),
      Value::String(s) => s,
      other => other.to_string(),
    };
    if seen.insert(value.clone()) {
      values.push(value);
    } else {
      debug!(task_id = %parent.task_id, value = %value, "duplicate_each_value_skipped");
    }
  }

  Ok(values)
}

/// The flowable capability of `task`, none for a runnable task.
pub fn flowable(task: &Task) -> Option<&dyn Flowable> {
  match &task.kind {
    TaskKind::Runnable(_) => None,
    TaskKind::Sequential(t) => Some(t),
    TaskKind::Parallel(t) => Some(t),
    TaskKind::Dag(t) => Some(t),
    TaskKind::EachSequential(t) => Some(t),
    TaskKind::EachParallel(t) => Some(t),
    TaskKind::If(t) => Some(t),
    TaskKind::Switch(t) => Some(t),
  }
}

/// New task runs below the flowable task run `parent` of `task`.
pub fn resolve_nexts(
  ctx: &RunContext<'_>,
  task: &Task,
  parent: &TaskRun,
) -> Result<Vec<TaskRun>, ResolverError> {
  match flowable(task) {
    Some(flowable) => flowable.resolve_nexts(ctx, parent),
    None => Ok(Vec::new()),
  }
}

/// Final state of the flowable task run `parent` of `task`, if it is over.
pub fn resolve_state(
  ctx: &RunContext<'_>,
  task: &Task,
  parent: &TaskRun,
) -> Result<Option<StateType>, ResolverError> {
  match flowable(task) {
    Some(flowable) => flowable.resolve_state(ctx, parent, task.allow_failure),
    None => Ok(None),
  }
}

/// Structural checks of `flow`, dag dependencies included.
pub fn validate_flow(flow: &Flow) -> Result<(), ResolverError> {
  flow.validate()?;

  for task in flow.all_tasks() {
    if let TaskKind::Dag(dag) = &task.kind {
      Graph::new(&task.id, &dag.tasks)?;
    }
  }

  Ok(())
}
