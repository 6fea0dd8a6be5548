//! The executor state machine.
//!
//! [`process`] takes a stored execution and applies, one at a time, the
//! first transition that applies to it until none does:
//!
//! 1. a RESTARTED execution goes back to RUNNING
//! 2. an execution whose root tasks are over takes its final state
//! 3. under KILLING, waiting task runs are KILLED, then running flowables
//!    whose children are over, then the execution itself
//! 4. new task runs (root tasks and children of running flowables)
//! 5. running flowables whose children are over take their final state
//! 6. created flowables start RUNNING
//!
//! Nothing here performs I/O. The work items for the runnable task runs
//! still waiting for a worker are computed once the execution settled.

use flowrun_config::{Flow, Task};
use flowrun_model::{Execution, ResolvedTask, StateType, TaskRun, WorkerTask};
use flowrun_resolver::{
  Renderer, ResolverError, RunContext, resolve_nexts, resolve_scope_state,
  resolve_sequential_nexts, resolve_state, variables,
};
use tracing::{debug, info, warn};

use crate::error::ExecutorError;

/// A settled execution and the work it waits for.
#[derive(Debug, Clone)]
pub struct Processed {
  pub execution: Execution,
  pub worker_tasks: Vec<WorkerTask>,
}

impl Processed {
  /// Give up on `execution`: it is FAILED and nothing gets dispatched.
  pub fn failed(execution: &Execution) -> Self {
    Self {
      execution: execution.with_state(StateType::Failed),
      worker_tasks: Vec::new(),
    }
  }
}

/// Drive `execution` until no transition applies anymore.
pub fn process(
  flow: &Flow,
  execution: Execution,
  renderer: &dyn Renderer,
  max_iterations: u32,
) -> Result<Processed, ExecutorError> {
  let mut execution = execution;

  for _ in 0..max_iterations {
    match step(flow, &execution, renderer)? {
      Some(next) => execution = next,
      None => {
        let worker_tasks = worker_tasks(flow, &execution)?;
        return Ok(Processed {
          execution,
          worker_tasks,
        });
      }
    }
  }

  Err(ExecutorError::NotConverging {
    execution_id: execution.id,
    iterations: max_iterations,
  })
}

/// Append new task runs. The first ones start the execution.
pub fn on_nexts(execution: &Execution, nexts: Vec<TaskRun>) -> Execution {
  let mut task_run_list = execution.task_run_list.clone();
  task_run_list.extend(nexts);
  let execution = execution.with_task_run_list(task_run_list);

  if execution.state.current == StateType::Created {
    info!(execution_id = %execution.id, "execution_started");
    execution.with_state(StateType::Running)
  } else {
    execution
  }
}

fn step(
  flow: &Flow,
  execution: &Execution,
  renderer: &dyn Renderer,
) -> Result<Option<Execution>, ExecutorError> {
  let state = execution.state.current;

  if state == StateType::Restarted {
    debug!(execution_id = %execution.id, "execution_resumed");
    return Ok(Some(execution.with_state(StateType::Running)));
  }

  if execution.state.is_terminated() || execution.state.is_paused() {
    return Ok(None);
  }

  if state == StateType::Killing {
    return killing(flow, execution);
  }

  if let Some(ended) = end(flow, execution) {
    return Ok(Some(ended));
  }

  if state != StateType::Queued {
    if let Some(next) = nexts(flow, execution, renderer)? {
      return Ok(Some(next));
    }
  }

  if let Some(next) = flowable_states(flow, execution, renderer)? {
    return Ok(Some(next));
  }

  start_flowables(flow, execution)
}

fn end(flow: &Flow, execution: &Execution) -> Option<Execution> {
  if execution.has_created() || execution.has_running() {
    return None;
  }

  let tasks = ResolvedTask::of(&flow.tasks);
  let errors = ResolvedTask::of(&flow.errors);
  let state = resolve_scope_state(execution, &tasks, &errors, false)?;

  info!(execution_id = %execution.id, state = %state, "execution_ended");
  Some(execution.with_state(state))
}

fn killing(flow: &Flow, execution: &Execution) -> Result<Option<Execution>, ExecutorError> {
  // nothing runs these yet: no worker will report them
  let waiting: Vec<TaskRun> = execution
    .task_run_list
    .iter()
    .filter(|t| t.state.is_created() || t.state.is_retrying())
    .map(|t| t.with_state(StateType::Killed))
    .collect();
  if let Some(next) = apply(execution, waiting)? {
    return Ok(Some(next));
  }

  let mut drained = Vec::new();
  for (_, task_run) in running_flowables(flow, execution)? {
    let children_over = execution
      .find_children(&task_run.id)
      .iter()
      .all(|child| child.state.is_terminated());
    if children_over {
      drained.push(task_run.with_state(StateType::Killed));
    }
  }
  if let Some(next) = apply(execution, drained)? {
    return Ok(Some(next));
  }

  if execution
    .task_run_list
    .iter()
    .all(|t| t.state.is_terminated())
  {
    info!(execution_id = %execution.id, "execution_killed");
    return Ok(Some(execution.with_state(StateType::Killed)));
  }

  Ok(None)
}

fn nexts(
  flow: &Flow,
  execution: &Execution,
  renderer: &dyn Renderer,
) -> Result<Option<Execution>, ExecutorError> {
  let tasks = ResolvedTask::of(&flow.tasks);
  let errors = ResolvedTask::of(&flow.errors);
  let mut nexts = resolve_sequential_nexts(execution, &tasks, &errors);

  let ctx = RunContext::new(flow, execution, renderer);
  let mut failed = Vec::new();
  for (task, parent) in running_flowables(flow, execution)? {
    match resolve_nexts(&ctx, task, parent) {
      Ok(children) => nexts.extend(children),
      Err(e) => failed.push(fail_flowable(parent, e)?),
    }
  }

  if let Some(next) = apply(execution, failed)? {
    return Ok(Some(next));
  }
  if nexts.is_empty() {
    return Ok(None);
  }

  for task_run in &nexts {
    debug!(
      execution_id = %execution.id,
      task_run_id = %task_run.id,
      task = %task_run.describe(),
      "task_run_created"
    );
  }
  Ok(Some(on_nexts(execution, nexts)))
}

fn flowable_states(
  flow: &Flow,
  execution: &Execution,
  renderer: &dyn Renderer,
) -> Result<Option<Execution>, ExecutorError> {
  let ctx = RunContext::new(flow, execution, renderer);
  let mut updated = Vec::new();

  for (task, parent) in running_flowables(flow, execution)? {
    match resolve_state(&ctx, task, parent) {
      Ok(Some(state)) => {
        debug!(
          execution_id = %execution.id,
          task = %parent.describe(),
          state = %state,
          "flowable_ended"
        );
        updated.push(parent.with_state(state));
      }
      Ok(None) => {}
      Err(e) => updated.push(fail_flowable(parent, e)?),
    }
  }

  apply(execution, updated)
}

fn start_flowables(flow: &Flow, execution: &Execution) -> Result<Option<Execution>, ExecutorError> {
  let mut started = Vec::new();
  for task_run in execution.task_run_list.iter().filter(|t| t.state.is_created()) {
    if find_task(flow, task_run)?.is_flowable() {
      started.push(task_run.with_state(StateType::Running));
    }
  }

  apply(execution, started)
}

/// Work items for the runnable task runs waiting for a worker.
fn worker_tasks(flow: &Flow, execution: &Execution) -> Result<Vec<WorkerTask>, ExecutorError> {
  if execution.state.is_terminated() || execution.state.current == StateType::Killing {
    return Ok(Vec::new());
  }

  let mut worker_tasks = Vec::new();
  for task_run in &execution.task_run_list {
    if !task_run.state.is_created() && !task_run.state.is_retrying() {
      continue;
    }
    let task = find_task(flow, task_run)?;
    if task.is_flowable() {
      continue;
    }

    worker_tasks.push(WorkerTask {
      task_run: task_run.clone(),
      task: task.clone(),
      variables: variables(flow, execution, Some(task_run)),
    });
  }

  Ok(worker_tasks)
}

/// An expression of the flowable could not be resolved: the task run fails,
/// the execution goes on with its error branch. Broken invariants are
/// returned instead.
fn fail_flowable(parent: &TaskRun, error: ResolverError) -> Result<TaskRun, ExecutorError> {
  match error {
    ResolverError::Model(_) | ResolverError::TaskNotFound { .. } => Err(error.into()),
    error => {
      warn!(
        execution_id = %parent.execution_id,
        task = %parent.describe(),
        error = %error,
        "flowable_resolution_failed"
      );
      Ok(parent.fail())
    }
  }
}

fn running_flowables<'a>(
  flow: &'a Flow,
  execution: &'a Execution,
) -> Result<Vec<(&'a Task, &'a TaskRun)>, ExecutorError> {
  let mut found = Vec::new();
  for task_run in &execution.task_run_list {
    if task_run.state.current != StateType::Running {
      continue;
    }
    let task = find_task(flow, task_run)?;
    if task.is_flowable() {
      found.push((task, task_run));
    }
  }
  Ok(found)
}

fn find_task<'a>(flow: &'a Flow, task_run: &TaskRun) -> Result<&'a Task, ResolverError> {
  flow
    .find_task(&task_run.task_id)
    .ok_or_else(|| ResolverError::TaskNotFound {
      flow_id: flow.id.clone(),
      task_id: task_run.task_id.clone(),
    })
}

fn apply(execution: &Execution, task_runs: Vec<TaskRun>) -> Result<Option<Execution>, ExecutorError> {
  if task_runs.is_empty() {
    return Ok(None);
  }

  let mut execution = execution.clone();
  for task_run in task_runs {
    execution = execution.with_task_run(task_run)?;
  }
  Ok(Some(execution))
}
